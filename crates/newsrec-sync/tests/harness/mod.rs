//! Postgres harness for the transactional persistence and dedup paths.
//!
//! Set `NEWSREC_TEST_DATABASE_URL` to run these; without it every test
//! returns early. Each context migrates a private schema and drops it on
//! teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use newsrec_core::{
    BiasRating, Factuality, Locality, OutletDraft, OwnershipCategory, Paywall, SourceCandidate,
    StoryCandidate,
};
use newsrec_outlets::{
    CatalogLookup, CatalogRecord, KgCandidate, KnowledgeGraph, OutletReconciler, ProfileData,
    ProfileLookup, ReconcileError,
};
use newsrec_sync::StoryStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use uuid::Uuid;

pub struct TestDb {
    admin: PgPool,
    pub pool: PgPool,
    schema: String,
}

impl TestDb {
    /// `None` when no test database is configured (test should be skipped).
    pub async fn try_new() -> Option<Self> {
        let url = std::env::var("NEWSREC_TEST_DATABASE_URL").ok()?;
        let schema = format!("newsrec_test_{}", Uuid::new_v4().simple());

        let admin = PgPool::connect(&url).await.expect("connecting to test database");
        admin
            .execute(format!("CREATE SCHEMA {schema}").as_str())
            .await
            .expect("creating test schema");

        let search_path = schema.clone();
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .after_connect(move |conn, _meta| {
                let stmt = format!("SET search_path TO {search_path}");
                Box::pin(async move {
                    conn.execute(stmt.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("connecting with test schema");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrating test schema");

        Some(Self { admin, pool, schema })
    }

    pub fn store(&self) -> StoryStore {
        StoryStore::new(self.pool.clone(), Duration::from_secs(30))
    }

    pub async fn count(&self, sql: &str, story_id: Uuid) -> i64 {
        sqlx::query_scalar::<_, i64>(sql)
            .bind(story_id)
            .fetch_one(&self.pool)
            .await
            .expect("count query")
    }

    pub async fn teardown(self) {
        self.pool.close().await;
        self.admin
            .execute(format!("DROP SCHEMA {} CASCADE", self.schema).as_str())
            .await
            .expect("dropping test schema");
    }
}

struct NoCatalog;

#[async_trait]
impl CatalogLookup for NoCatalog {
    async fn lookup(&self, _host: Option<&str>, _name: &str) -> Result<Option<CatalogRecord>, ReconcileError> {
        Ok(None)
    }
}

struct NoProfiles;

#[async_trait]
impl ProfileLookup for NoProfiles {
    async fn fetch_profile(&self, _profile_url: &str) -> Result<Option<ProfileData>, ReconcileError> {
        Ok(None)
    }
}

struct NoKnowledge;

#[async_trait]
impl KnowledgeGraph for NoKnowledge {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, ReconcileError> {
        Ok(Vec::new())
    }

    async fn entities(&self, _ids: &[String]) -> Result<Vec<KgCandidate>, ReconcileError> {
        Ok(Vec::new())
    }

    async fn labels(&self, _ids: &[String]) -> Result<HashMap<String, String>, ReconcileError> {
        Ok(HashMap::new())
    }
}

/// Reconciler whose lookups all come back empty.
pub fn offline_reconciler() -> OutletReconciler {
    OutletReconciler::new(Arc::new(NoCatalog), Arc::new(NoProfiles), Arc::new(NoKnowledge), None)
}

pub fn at(hour: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).single().unwrap() + chrono::Duration::hours(hour)
}

pub fn source(url: &str) -> SourceCandidate {
    let host = newsrec_core::host_of(url).unwrap();
    SourceCandidate {
        url: url.to_string(),
        outlet: OutletDraft::new(host.clone(), Some(format!("https://{host}"))),
        excerpt: None,
        published_at: None,
        paywall: Paywall::Soft,
        locality: Locality::National,
        is_wire_service: false,
        bias_rating: BiasRating::LeanRight,
        factuality: Factuality::Mixed,
        ownership: Some(OwnershipCategory::Corporation),
        signals_synthetic: true,
    }
}

pub fn story(slug: &str, title: &str, hour: i64, rank: Option<i32>, urls: &[&str], tags: &[&str]) -> StoryCandidate {
    let mut s = StoryCandidate::new(slug, format!("https://site.test/story/{slug}"), title);
    s.published_at = Some(at(hour));
    s.updated_at = Some(at(hour));
    s.homepage_rank = rank;
    s.sources = urls.iter().map(|u| source(u)).collect();
    s.tags = tags.iter().map(|t| t.to_string()).collect();
    s
}
