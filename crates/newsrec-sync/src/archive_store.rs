use async_trait::async_trait;
use newsrec_adapters::ArchiveEntryStore;
use newsrec_core::{ArchiveAttempt, ArchiveEntry, ArchiveStatus};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

/// `archive_entries` table, keyed by original URL.
pub struct PgArchiveStore {
    pool: PgPool,
}

impl PgArchiveStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveEntryStore for PgArchiveStore {
    async fn get(&self, original_url: &str) -> anyhow::Result<Option<ArchiveEntry>> {
        let row = sqlx::query(
            r#"
            SELECT original_url, status, host, archive_url, headline, paragraphs, attempts, resolved_at
              FROM archive_entries
             WHERE original_url = $1
            "#,
        )
        .bind(original_url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let status = ArchiveStatus::parse(&status).unwrap_or_else(|| {
            debug!(url = %original_url, status = %status, "unrecognised archive status");
            ArchiveStatus::Error
        });
        let Json(paragraphs): Json<Vec<String>> = row.try_get("paragraphs")?;
        let Json(attempts): Json<Vec<ArchiveAttempt>> = row.try_get("attempts")?;
        Ok(Some(ArchiveEntry {
            original_url: row.try_get("original_url")?,
            status,
            host: row.try_get("host")?,
            archive_url: row.try_get("archive_url")?,
            headline: row.try_get("headline")?,
            paragraphs,
            attempts,
            resolved_at: row.try_get("resolved_at")?,
        }))
    }

    async fn put(&self, entry: &ArchiveEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO archive_entries (original_url, status, host, archive_url, headline,
                                         paragraphs, attempts, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (original_url) DO UPDATE SET
                status = EXCLUDED.status,
                host = EXCLUDED.host,
                archive_url = EXCLUDED.archive_url,
                headline = EXCLUDED.headline,
                paragraphs = EXCLUDED.paragraphs,
                attempts = EXCLUDED.attempts,
                resolved_at = EXCLUDED.resolved_at
            "#,
        )
        .bind(&entry.original_url)
        .bind(entry.status.as_str())
        .bind(&entry.host)
        .bind(&entry.archive_url)
        .bind(&entry.headline)
        .bind(Json(&entry.paragraphs))
        .bind(Json(&entry.attempts))
        .bind(entry.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
