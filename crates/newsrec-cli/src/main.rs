use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newsrec_browser::{BrokerConfig, SessionBroker, SessionProvider};
use newsrec_core::OutletDraft;
use newsrec_outlets::{OutletReconciler, ReconcilerConfig};
use newsrec_storage::{HttpClientConfig, HttpFetcher};
use newsrec_sync::{build_scheduler, SyncConfig, SyncRuntime};
use newsrec_web::WebConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "newsrec")]
#[command(about = "News story ingestion and outlet reconciliation")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "NEWSREC_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, enrich and persist one batch, retrying per configuration.
    Ingest,
    /// Merge duplicate stories.
    Dedup {
        #[arg(long)]
        dry_run: bool,
        #[arg(long, env = "NEWSREC_DEDUP_GAP_HOURS")]
        gap_hours: Option<i64>,
    },
    /// Resolve archived copies for the given article URLs.
    Archive {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Run outlet reconciliation standalone and print the merged record.
    EnrichOutlet {
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: Option<String>,
    },
    /// Remote browser session housekeeping.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Serve the JSON trigger and read endpoints.
    Serve,
    /// Run ingestion and dedup on their cron schedules until interrupted.
    Schedule,
    /// Apply the reference schema.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum SessionAction {
    List {
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    StopAll {
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("newsrec=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
            let summary = runtime.run_ingest().await?;
            println!(
                "ingest complete: run_id={} attempts={} routes={} links={} stories={} rejected={}",
                summary.run_id,
                summary.attempts,
                summary.report.route_count,
                summary.report.link_count,
                summary.report.story_count,
                summary.report.rejected
            );
        }
        Commands::Dedup { dry_run, gap_hours } => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
            let report = runtime.run_dedup(dry_run, gap_hours).await?;
            println!(
                "dedup complete: run_id={} dry_run={} clusters={} merged={} failed={}",
                report.run_id,
                report.dry_run,
                report.clusters.len(),
                report.merged,
                report.failed
            );
        }
        Commands::Archive { urls } => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
            let entries = runtime.verify_archives(&urls).await?;
            for entry in &entries {
                println!(
                    "{}\t{}\t{}",
                    entry.status,
                    entry.original_url,
                    entry.archive_url.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::EnrichOutlet { name, url } => {
            let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::from_env())?);
            let reconciler = OutletReconciler::from_config(&ReconcilerConfig::from_env(), fetcher);
            let enriched = reconciler.enrich(OutletDraft::new(name, url)).await;
            print_json(&enriched)?;
        }
        Commands::Sessions { action } => {
            let broker = SessionBroker::from_config(BrokerConfig::from_env()?)?;
            match action {
                SessionAction::List { page_size } => {
                    let provider = broker.provider();
                    let mut page_number = 1;
                    loop {
                        let page = provider.list_sessions(page_size, page_number).await?;
                        for session in &page.sessions {
                            println!("{}\t{}", session.id, session.status.as_deref().unwrap_or("-"));
                        }
                        if page.sessions.len() < page_size as usize {
                            break;
                        }
                        page_number += 1;
                    }
                }
                SessionAction::StopAll { page_size } => {
                    let stopped = broker.stop_all(page_size).await?;
                    println!("stopped {} sessions", stopped.len());
                }
            }
        }
        Commands::Serve => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
            newsrec_web::serve(Arc::new(runtime), WebConfig::from_env()).await?;
        }
        Commands::Schedule => {
            let runtime = Arc::new(SyncRuntime::connect(SyncConfig::from_env()).await?);
            let Some(mut sched) = build_scheduler(runtime).await? else {
                anyhow::bail!("scheduler is disabled; set NEWSREC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let runtime = SyncRuntime::connect(SyncConfig::from_env()).await?;
            runtime.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
