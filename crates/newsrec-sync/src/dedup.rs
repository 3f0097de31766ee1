use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use newsrec_storage::{write_atomic, write_json_atomic};
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::PersistError;

/// Child tables whose rows move from a merged-away story to its keeper.
const REMAPPED_TABLES: &[&str] = &[
    "story_tags",
    "source_articles",
    "reading_events",
    "story_feedback",
    "story_snapshots",
    "story_timeline_items",
    "story_podcasts",
    "story_reader_links",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupStory {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub homepage_rank: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub title: String,
    pub keeper: DedupStory,
    pub losers: Vec<DedupStory>,
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

fn rank_key(story: &DedupStory) -> (bool, Option<i32>) {
    (story.homepage_rank.is_none(), story.homepage_rank)
}

/// Lowest homepage rank wins (unranked is worst), then the most recently
/// updated, then slug order.
pub fn choose_keeper(members: &[DedupStory]) -> Option<usize> {
    members
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            rank_key(a)
                .cmp(&rank_key(b))
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.slug.cmp(&b.slug))
        })
        .map(|(i, _)| i)
}

/// Groups stories by case-insensitive title, then chains members whose
/// publication times sit within `gap` of the previous one. Clusters of two or
/// more become merge plans. Stories without `published_at` never merge;
/// `updated_at` moves on every re-ingest and is only a keeper tie-break.
pub fn plan_merges(stories: Vec<DedupStory>, gap: Duration) -> Vec<MergePlan> {
    let mut groups: BTreeMap<String, Vec<DedupStory>> = BTreeMap::new();
    for story in stories.into_iter().filter(|s| s.published_at.is_some()) {
        groups.entry(title_key(&story.title)).or_default().push(story);
    }

    let mut plans = Vec::new();
    for (_, mut group) in groups {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| a.published_at.cmp(&b.published_at).then_with(|| a.slug.cmp(&b.slug)));

        let mut clusters: Vec<Vec<DedupStory>> = Vec::new();
        let mut last_time = None;
        for story in group {
            let at = story.published_at;
            let joins = match (last_time, at) {
                (Some(prev), Some(now)) => now - prev <= gap,
                _ => false,
            };
            match clusters.last_mut() {
                Some(current) if joins => current.push(story),
                _ => clusters.push(vec![story]),
            }
            last_time = at;
        }

        for mut members in clusters.into_iter().filter(|c| c.len() >= 2) {
            let Some(idx) = choose_keeper(&members) else {
                continue;
            };
            let keeper = members.remove(idx);
            plans.push(MergePlan {
                title: keeper.title.clone(),
                keeper,
                losers: members,
            });
        }
    }
    plans
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Merged,
    Planned,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOutcome {
    pub title: String,
    pub keeper_slug: String,
    pub loser_slugs: Vec<String>,
    pub status: ClusterStatus,
    pub rows_moved: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub gap_hours: i64,
    pub stories_scanned: usize,
    pub merged: usize,
    pub failed: usize,
    pub clusters: Vec<ClusterOutcome>,
}

pub fn report_markdown(report: &DedupReport) -> String {
    let rows = if report.clusters.is_empty() {
        "No duplicate clusters found.".to_string()
    } else {
        report
            .clusters
            .iter()
            .map(|c| {
                format!(
                    "- `{:?}` **{}**: keep `{}`, merge {}{}",
                    c.status,
                    c.title,
                    c.keeper_slug,
                    c.loser_slugs
                        .iter()
                        .map(|s| format!("`{s}`"))
                        .collect::<Vec<_>>()
                        .join(", "),
                    c.error.as_deref().map(|e| format!(" ({e})")).unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Dedup Report\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Gap: {}h\n- Stories scanned: {}\n- Merged clusters: {}\n- Failed clusters: {}\n\n## Clusters\n{}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.dry_run,
        report.gap_hours,
        report.stories_scanned,
        report.merged,
        report.failed,
        rows
    )
}

/// Writes `dedup/<run_id>/dedup_report.{json,md}` under `reports_root`.
pub async fn write_dedup_report(reports_root: &Path, report: &DedupReport) -> Result<PathBuf> {
    let dir = reports_root.join("dedup").join(report.run_id.to_string());
    write_json_atomic(&dir.join("dedup_report.json"), report)
        .await
        .context("writing dedup_report.json")?;
    write_atomic(&dir.join("dedup_report.md"), report_markdown(report).as_bytes())
        .await
        .context("writing dedup_report.md")?;
    Ok(dir)
}

async fn merge_loser(conn: &mut PgConnection, keeper: Uuid, loser: Uuid) -> Result<u64, PersistError> {
    let mut sp = sqlx::Connection::begin(&mut *conn).await?;

    sqlx::query(
        "DELETE FROM story_tags WHERE story_id = $2 AND tag IN (SELECT tag FROM story_tags WHERE story_id = $1)",
    )
    .bind(keeper)
    .bind(loser)
    .execute(&mut *sp)
    .await?;
    sqlx::query(
        "DELETE FROM source_articles WHERE story_id = $2 AND url IN (SELECT url FROM source_articles WHERE story_id = $1)",
    )
    .bind(keeper)
    .bind(loser)
    .execute(&mut *sp)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM story_related_stories
         WHERE (story_id = $2 AND related_story_id = $1)
            OR (story_id = $1 AND related_story_id = $2)
            OR (story_id = $2 AND related_story_id IN
                   (SELECT related_story_id FROM story_related_stories WHERE story_id = $1))
            OR (related_story_id = $2 AND story_id IN
                   (SELECT story_id FROM story_related_stories WHERE related_story_id = $1))
        "#,
    )
    .bind(keeper)
    .bind(loser)
    .execute(&mut *sp)
    .await?;

    let mut moved = 0;
    for table in REMAPPED_TABLES {
        moved += sqlx::query(&format!("UPDATE {table} SET story_id = $1 WHERE story_id = $2"))
            .bind(keeper)
            .bind(loser)
            .execute(&mut *sp)
            .await?
            .rows_affected();
    }
    moved += sqlx::query("UPDATE story_related_stories SET story_id = $1 WHERE story_id = $2")
        .bind(keeper)
        .bind(loser)
        .execute(&mut *sp)
        .await?
        .rows_affected();
    moved += sqlx::query("UPDATE story_related_stories SET related_story_id = $1 WHERE related_story_id = $2")
        .bind(keeper)
        .bind(loser)
        .execute(&mut *sp)
        .await?
        .rows_affected();

    let keeper_has_geo = sqlx::query("SELECT 1 AS present FROM story_geos WHERE story_id = $1")
        .bind(keeper)
        .fetch_optional(&mut *sp)
        .await?
        .is_some();
    if keeper_has_geo {
        sqlx::query("DELETE FROM story_geos WHERE story_id = $1")
            .bind(loser)
            .execute(&mut *sp)
            .await?;
    } else {
        moved += sqlx::query("UPDATE story_geos SET story_id = $1 WHERE story_id = $2")
            .bind(keeper)
            .bind(loser)
            .execute(&mut *sp)
            .await?
            .rows_affected();
    }

    sqlx::query("DELETE FROM stories WHERE id = $1")
        .bind(loser)
        .execute(&mut *sp)
        .await?;
    sp.commit().await?;
    Ok(moved)
}

/// Maintenance pass folding same-titled, near-simultaneous stories into one.
pub struct DedupEngine {
    pool: PgPool,
    reports_root: PathBuf,
}

impl DedupEngine {
    pub fn new(pool: PgPool, reports_root: PathBuf) -> Self {
        Self { pool, reports_root }
    }

    async fn load_stories(&self) -> Result<Vec<DedupStory>, PersistError> {
        let rows = sqlx::query(
            "SELECT id, slug, title, published_at, updated_at, homepage_rank FROM stories",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut stories = Vec::with_capacity(rows.len());
        for row in rows {
            stories.push(DedupStory {
                id: row.try_get("id")?,
                slug: row.try_get("slug")?,
                title: row.try_get("title")?,
                published_at: row.try_get("published_at")?,
                updated_at: row.try_get("updated_at")?,
                homepage_rank: row.try_get("homepage_rank")?,
            });
        }
        Ok(stories)
    }

    async fn merge_cluster(&self, plan: &MergePlan) -> Result<u64, PersistError> {
        let mut tx = self.pool.begin().await?;
        let mut moved = 0;
        for loser in &plan.losers {
            moved += merge_loser(&mut tx, plan.keeper.id, loser.id).await?;
        }
        tx.commit().await?;
        Ok(moved)
    }

    /// Plans and (unless `dry_run`) applies every merge. A failing cluster is
    /// rolled back on its own and reported; the pass carries on.
    pub async fn run(&self, dry_run: bool, gap: Duration) -> Result<DedupReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stories = self.load_stories().await.context("loading stories for dedup")?;
        let stories_scanned = stories.len();
        let plans = plan_merges(stories, gap);
        info!(%run_id, dry_run, stories = stories_scanned, clusters = plans.len(), "dedup planned");

        let mut clusters = Vec::with_capacity(plans.len());
        for plan in &plans {
            let mut outcome = ClusterOutcome {
                title: plan.title.clone(),
                keeper_slug: plan.keeper.slug.clone(),
                loser_slugs: plan.losers.iter().map(|l| l.slug.clone()).collect(),
                status: ClusterStatus::Planned,
                rows_moved: 0,
                error: None,
            };
            if !dry_run {
                let span = info_span!("dedup_cluster", keeper = %plan.keeper.slug, losers = plan.losers.len());
                match self.merge_cluster(plan).instrument(span).await {
                    Ok(moved) => {
                        outcome.status = ClusterStatus::Merged;
                        outcome.rows_moved = moved;
                    }
                    Err(err) => {
                        warn!(keeper = %plan.keeper.slug, error = %err, "dedup cluster failed");
                        outcome.status = ClusterStatus::Failed;
                        outcome.error = Some(err.to_string());
                    }
                }
            }
            clusters.push(outcome);
        }

        let report = DedupReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            gap_hours: gap.num_hours(),
            stories_scanned,
            merged: clusters.iter().filter(|c| c.status == ClusterStatus::Merged).count(),
            failed: clusters.iter().filter(|c| c.status == ClusterStatus::Failed).count(),
            clusters,
        };
        let dir = write_dedup_report(&self.reports_root, &report).await?;
        info!(%run_id, merged = report.merged, failed = report.failed, dir = %dir.display(), "dedup finished");
        Ok(report)
    }
}
