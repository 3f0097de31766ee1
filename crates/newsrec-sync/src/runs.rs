use async_trait::async_trait;
use newsrec_core::{IngestionRun, RunStatus};
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

/// Persistence for ingestion run records. `record` upserts by id so one row
/// follows an attempt from `running` to its final status.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record(&self, run: &IngestionRun) -> anyhow::Result<()>;
    async fn latest(&self) -> anyhow::Result<Option<IngestionRun>>;
}

fn parse_status(value: &str) -> RunStatus {
    match value {
        "ok" => RunStatus::Ok,
        "retry" => RunStatus::Retry,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Running,
    }
}

pub struct PgRunRecorder {
    pool: PgPool,
}

impl PgRunRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunRecorder for PgRunRecorder {
    async fn record(&self, run: &IngestionRun) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_runs (id, attempt, status, started_at, finished_at, route_count,
                                        link_count, story_count, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                finished_at = EXCLUDED.finished_at,
                route_count = EXCLUDED.route_count,
                link_count = EXCLUDED.link_count,
                story_count = EXCLUDED.story_count,
                error = EXCLUDED.error
            "#,
        )
        .bind(run.id)
        .bind(run.attempt as i32)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.route_count)
        .bind(run.link_count)
        .bind(run.story_count)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self) -> anyhow::Result<Option<IngestionRun>> {
        let row = sqlx::query(
            r#"
            SELECT id, attempt, status, started_at, finished_at, route_count, link_count,
                   story_count, error
              FROM ingestion_runs
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let attempt: i32 = row.try_get("attempt")?;
        Ok(Some(IngestionRun {
            id: row.try_get("id")?,
            attempt: attempt.max(0) as u32,
            status: parse_status(&status),
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            route_count: row.try_get("route_count")?,
            link_count: row.try_get("link_count")?,
            story_count: row.try_get("story_count")?,
            error: row.try_get("error")?,
        }))
    }
}

/// Keeps runs in memory; used when no database is wired and in tests.
#[derive(Default)]
pub struct InMemoryRunRecorder {
    runs: Mutex<Vec<IngestionRun>>,
}

impl InMemoryRunRecorder {
    pub async fn all(&self) -> Vec<IngestionRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl RunRecorder for InMemoryRunRecorder {
    async fn record(&self, run: &IngestionRun) -> anyhow::Result<()> {
        let mut runs = self.runs.lock().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
        Ok(())
    }

    async fn latest(&self) -> anyhow::Result<Option<IngestionRun>> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .max_by_key(|r| (r.started_at, r.attempt))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn run(attempt: u32, status: RunStatus) -> IngestionRun {
        IngestionRun {
            id: Uuid::new_v4(),
            attempt,
            status,
            started_at: Utc::now(),
            finished_at: None,
            route_count: 0,
            link_count: 0,
            story_count: 0,
            error: None,
        }
    }

    #[tokio::test]
    async fn record_updates_in_place() {
        let recorder = InMemoryRunRecorder::default();
        let mut first = run(1, RunStatus::Running);
        recorder.record(&first).await.unwrap();
        first.status = RunStatus::Ok;
        first.story_count = 12;
        recorder.record(&first).await.unwrap();

        let all = recorder.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, RunStatus::Ok);
        assert_eq!(recorder.latest().await.unwrap().unwrap().story_count, 12);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [RunStatus::Running, RunStatus::Ok, RunStatus::Retry, RunStatus::Failed] {
            assert_eq!(parse_status(status.as_str()), status);
        }
    }
}
