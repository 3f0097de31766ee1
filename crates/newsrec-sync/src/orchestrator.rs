use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use newsrec_adapters::{scrape, RouteStatus, ScrapeOptions, ScrapeOutcome, StoryEnricher};
use newsrec_browser::{AcquireContext, CdpSession, SessionBroker};
use newsrec_core::{IngestionRun, RunStatus, StoryCandidate};
use newsrec_outlets::{OutletReconciler, ReconcilerConfig};
use newsrec_storage::{read_json_file, write_json_atomic, ArtifactStore, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::persist::StoryStore;
use crate::runs::RunRecorder;

pub const INGEST_ROTATION_KEY: &str = "ingest";

/// What one scrape+enrich+persist attempt reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub ok: bool,
    pub route_count: i64,
    pub link_count: i64,
    pub story_count: i64,
    pub rejected: i64,
    pub scrape_dump: Option<String>,
}

#[async_trait]
pub trait IngestPipeline: Send + Sync {
    async fn run(&self, attempt: u32) -> Result<PipelineReport>;
}

/// A report that does not claim success, or carries negative counts, is a
/// failed attempt even though no error was raised.
pub fn validate_report(report: &PipelineReport) -> Result<()> {
    ensure!(report.ok, "pipeline reported ok=false");
    for (field, value) in [
        ("route_count", report.route_count),
        ("link_count", report.link_count),
        ("story_count", report.story_count),
    ] {
        ensure!(value >= 0, "pipeline reported negative {field} ({value})");
    }
    Ok(())
}

pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    base * attempt
}

/// Last known orchestrator state, rewritten after every attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run: IngestionRun,
    pub max_attempts: u32,
    pub finished: bool,
    pub written_at: DateTime<Utc>,
}

pub async fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    read_json_file(path).await
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub checkpoint_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub attempts: u32,
    pub report: PipelineReport,
}

pub struct Orchestrator {
    pipeline: Arc<dyn IngestPipeline>,
    runs: Arc<dyn RunRecorder>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<dyn IngestPipeline>, runs: Arc<dyn RunRecorder>, config: OrchestratorConfig) -> Self {
        Self {
            pipeline,
            runs,
            config,
        }
    }

    async fn record(&self, run: &IngestionRun, finished: bool) {
        if let Err(err) = self.runs.record(run).await {
            warn!(run_id = %run.id, error = %format!("{err:#}"), "failed to record ingestion run");
        }
        let checkpoint = Checkpoint {
            run: run.clone(),
            max_attempts: self.config.attempts.max(1),
            finished,
            written_at: Utc::now(),
        };
        if let Err(err) = write_json_atomic(&self.config.checkpoint_path, &checkpoint).await {
            warn!(path = %self.config.checkpoint_path.display(), error = %format!("{err:#}"), "failed to write checkpoint");
        }
    }

    /// Runs the pipeline with linear backoff between attempts. Each attempt
    /// gets its own run row; the last error is returned once attempts run out.
    pub async fn run(&self) -> Result<RunSummary> {
        let attempts = self.config.attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut run = IngestionRun {
                id: Uuid::new_v4(),
                attempt,
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                route_count: 0,
                link_count: 0,
                story_count: 0,
                error: None,
            };
            self.record(&run, false).await;

            let span = info_span!("ingest_attempt", run_id = %run.id, attempt);
            let outcome = async {
                let report = self.pipeline.run(attempt).await?;
                validate_report(&report)?;
                Ok::<_, anyhow::Error>(report)
            }
            .instrument(span)
            .await;
            run.finished_at = Some(Utc::now());

            match outcome {
                Ok(report) => {
                    run.status = RunStatus::Ok;
                    run.route_count = report.route_count;
                    run.link_count = report.link_count;
                    run.story_count = report.story_count;
                    self.record(&run, true).await;
                    info!(
                        run_id = %run.id,
                        attempt,
                        stories = report.story_count,
                        links = report.link_count,
                        "ingestion succeeded"
                    );
                    return Ok(RunSummary {
                        run_id: run.id,
                        attempts: attempt,
                        report,
                    });
                }
                Err(err) => {
                    let last = attempt == attempts;
                    run.status = if last { RunStatus::Failed } else { RunStatus::Retry };
                    run.error = Some(format!("{err:#}"));
                    self.record(&run, last).await;
                    if last {
                        error!(run_id = %run.id, attempt, error = %format!("{err:#}"), "ingestion failed");
                    } else {
                        let delay = retry_delay(attempt, self.config.base_delay);
                        warn!(
                            run_id = %run.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %format!("{err:#}"),
                            "ingestion attempt failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err.context(format!("ingestion failed after {attempts} attempts"))),
            None => Err(anyhow!("ingestion made no attempts")),
        }
    }
}

/// Scrapes through a brokered remote browser, enriches each story over HTTP
/// and persists the batch.
pub struct LivePipeline {
    pub broker: Arc<SessionBroker>,
    pub scrape_options: ScrapeOptions,
    pub fetcher: Arc<HttpFetcher>,
    pub enricher: StoryEnricher,
    pub store: StoryStore,
    pub artifacts: ArtifactStore,
    pub reconciler_config: ReconcilerConfig,
    pub enrich_concurrency: usize,
}

impl LivePipeline {
    async fn scrape_site(&self) -> Result<ScrapeOutcome> {
        let lease = self
            .broker
            .acquire(&AcquireContext::keyed(INGEST_ROTATION_KEY))
            .await
            .context("acquiring browser session")?;

        let outcome = async {
            let session = CdpSession::connect(&lease.endpoint).await?;
            let scraped = match session.new_page().await {
                Ok(page) => {
                    let outcome = scrape(&page, &self.scrape_options).await;
                    page.close().await;
                    Ok(outcome)
                }
                Err(err) => Err(err),
            };
            session.close().await;
            scraped
        }
        .await;

        if let Err(err) = self.broker.release(&lease).await {
            warn!(session_id = %lease.session_id, error = %err, "failed to release browser session");
        }
        outcome.context("scraping site")
    }

    async fn enrich_all(&self, story_links: &[String]) -> (Vec<StoryCandidate>, i64) {
        let results = stream::iter(story_links.iter().cloned().enumerate())
            .map(|(idx, url): (usize, String)| {
                async move {
                    let result = self.enricher.enrich_story(&url).await;
                    (idx, url, result)
                }
            })
            .buffer_unordered(self.enrich_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut failures = 0;
        let mut candidates = Vec::with_capacity(results.len());
        for (idx, url, result) in results {
            match result {
                Ok(mut candidate) => {
                    candidate.homepage_rank = Some(idx as i32 + 1);
                    candidates.push(candidate);
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "story enrichment failed");
                    failures += 1;
                }
            }
        }
        candidates.sort_by_key(|c| c.homepage_rank);
        (candidates, failures)
    }
}

#[async_trait]
impl IngestPipeline for LivePipeline {
    async fn run(&self, attempt: u32) -> Result<PipelineReport> {
        let outcome = self.scrape_site().await?;
        if !outcome.routes.is_empty() && outcome.routes.iter().all(|r| r.status == RouteStatus::Error) {
            anyhow::bail!("every route failed to load");
        }
        let dump = self
            .artifacts
            .store_json(outcome.started_at, "scrapes", &outcome)
            .await
            .context("writing scrape dump")?;
        info!(
            attempt,
            routes = outcome.routes.len(),
            stories = outcome.story_links.len(),
            dump = %dump.relative_path.display(),
            "scrape finished"
        );

        let (candidates, failures) = self.enrich_all(&outcome.story_links).await;
        let reconciler = OutletReconciler::from_config(&self.reconciler_config, self.fetcher.clone());
        let summary = self
            .store
            .persist_batch(&candidates, &reconciler)
            .await
            .context("persisting story batch")?;

        Ok(PipelineReport {
            ok: true,
            route_count: outcome.routes.len() as i64,
            link_count: outcome.link_count() as i64,
            story_count: summary.stories as i64,
            rejected: summary.rejected as i64 + failures,
            scrape_dump: Some(dump.relative_path.display().to_string()),
        })
    }
}
