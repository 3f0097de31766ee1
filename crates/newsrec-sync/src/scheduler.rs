use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::SyncRuntime;

/// Ingestion and the dedup pass on their own cron expressions. `None` when
/// the scheduler is disabled.
pub async fn build_scheduler(runtime: Arc<SyncRuntime>) -> Result<Option<JobScheduler>> {
    let config = runtime.config().clone();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_runtime = runtime.clone();
    let ingest = Job::new_async(config.ingest_cron.as_str(), move |_uuid, _l| {
        let runtime = ingest_runtime.clone();
        Box::pin(async move {
            match runtime.run_ingest().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    stories = summary.report.story_count,
                    "scheduled ingestion finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingestion failed"),
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {}", config.ingest_cron))?;
    sched.add(ingest).await.context("adding ingest job")?;

    let dedup_runtime = runtime.clone();
    let dedup = Job::new_async(config.dedup_cron.as_str(), move |_uuid, _l| {
        let runtime = dedup_runtime.clone();
        Box::pin(async move {
            match runtime.run_dedup(false, None).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    merged = report.merged,
                    failed = report.failed,
                    "scheduled dedup finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled dedup failed"),
            }
        })
    })
    .with_context(|| format!("creating dedup job for cron {}", config.dedup_cron))?;
    sched.add(dedup).await.context("adding dedup job")?;

    info!(ingest = %config.ingest_cron, dedup = %config.dedup_cron, "scheduler configured");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncConfig;

    fn runtime(enabled: bool) -> Arc<SyncRuntime> {
        let config = SyncConfig {
            scheduler_enabled: enabled,
            ..SyncConfig::default()
        };
        Arc::new(SyncRuntime::connect_lazy(config).unwrap())
    }

    #[tokio::test]
    async fn disabled_scheduler_is_none() {
        assert!(build_scheduler(runtime(false)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_registers_jobs() {
        assert!(build_scheduler(runtime(true)).await.unwrap().is_some());
    }
}
