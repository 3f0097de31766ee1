//! JSON trigger and read endpoints for the ingestion pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use newsrec_core::{ArchiveEntry, IngestionRun};
use newsrec_sync::{DedupReport, RunSummary, SyncRuntime};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "newsrec-web";

pub const API_KEY_HEADER: &str = "x-api-key";

/// The operations the web layer may invoke.
#[async_trait]
pub trait PipelineService: Send + Sync {
    async fn ingest(&self) -> anyhow::Result<RunSummary>;
    async fn dedup(&self, dry_run: bool, gap_hours: Option<i64>) -> anyhow::Result<DedupReport>;
    async fn latest_run(&self) -> anyhow::Result<Option<IngestionRun>>;
    async fn archive_entry(&self, url: &str) -> anyhow::Result<ArchiveEntry>;
}

#[async_trait]
impl PipelineService for SyncRuntime {
    async fn ingest(&self) -> anyhow::Result<RunSummary> {
        self.run_ingest().await
    }

    async fn dedup(&self, dry_run: bool, gap_hours: Option<i64>) -> anyhow::Result<DedupReport> {
        self.run_dedup(dry_run, gap_hours).await
    }

    async fn latest_run(&self) -> anyhow::Result<Option<IngestionRun>> {
        SyncRuntime::latest_run(self).await
    }

    async fn archive_entry(&self, url: &str) -> anyhow::Result<ArchiveEntry> {
        SyncRuntime::archive_entry(self, url).await
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    /// Operator key for the trigger endpoints. Unset disables them.
    pub api_key: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            api_key: None,
        }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("NEWSREC_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            api_key: std::env::var("NEWSREC_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn PipelineService>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(service: Arc<dyn PipelineService>, api_key: Option<String>) -> Self {
        Self { service, api_key }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/dedup", post(dedup_handler))
        .route("/api/runs/latest", get(latest_run_handler))
        .route("/api/archive", get(archive_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: Arc<dyn PipelineService>, config: WebConfig) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        warn!("NEWSREC_API_KEY is not set; trigger endpoints are disabled");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "web server listening");
    axum::serve(listener, app(AppState::new(service, config.api_key)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

pub async fn serve_from_env(service: Arc<dyn PipelineService>) -> anyhow::Result<()> {
    serve(service, WebConfig::from_env()).await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.api_key.as_deref() else {
        return Err(error_response(StatusCode::FORBIDDEN, "operator API key is not configured"));
    };
    match presented_key(headers) {
        Some(key) if keys_match(key, expected) => Ok(()),
        Some(_) => Err(error_response(StatusCode::UNAUTHORIZED, "invalid API key")),
        None => Err(error_response(StatusCode::UNAUTHORIZED, "missing API key")),
    }
}

async fn ingest_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.service.ingest().await {
        Ok(summary) => {
            let mut body = serde_json::to_value(&summary.report).unwrap_or_else(|_| json!({}));
            if let Some(map) = body.as_object_mut() {
                map.insert("ok".into(), json!(true));
                map.insert("run_id".into(), json!(summary.run_id));
                map.insert("attempts".into(), json!(summary.attempts));
            }
            Json(body).into_response()
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "triggered ingestion failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DedupParams {
    dry_run: Option<bool>,
    gap_hours: Option<i64>,
}

async fn dedup_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DedupParams>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    if params.gap_hours.is_some_and(|h| h <= 0) {
        return error_response(StatusCode::BAD_REQUEST, "gap_hours must be positive");
    }
    match state
        .service
        .dedup(params.dry_run.unwrap_or(false), params.gap_hours)
        .await
    {
        Ok(report) => Json(json!({ "ok": true, "report": report })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

async fn latest_run_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.service.latest_run().await {
        Ok(Some(run)) => Json(json!({ "run": run })).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no ingestion runs recorded"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveParams {
    url: Option<String>,
}

async fn archive_handler(State(state): State<Arc<AppState>>, Query(params): Query<ArchiveParams>) -> Response {
    let Some(raw) = params.url.filter(|u| !u.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "url query parameter is required");
    };
    match url::Url::parse(raw.trim()) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => return error_response(StatusCode::BAD_REQUEST, "url must be an absolute http(s) URL"),
    }
    match state.service.archive_entry(raw.trim()).await {
        Ok(entry) => Json(entry).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use newsrec_core::{ArchiveStatus, RunStatus};
    use newsrec_sync::PipelineReport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeService {
        ingests: AtomicUsize,
        fail_ingest: bool,
    }

    #[async_trait]
    impl PipelineService for FakeService {
        async fn ingest(&self) -> anyhow::Result<RunSummary> {
            self.ingests.fetch_add(1, Ordering::SeqCst);
            if self.fail_ingest {
                anyhow::bail!("ingestion failed after 2 attempts: browser exhausted");
            }
            Ok(RunSummary {
                run_id: Uuid::new_v4(),
                attempts: 1,
                report: PipelineReport {
                    ok: true,
                    route_count: 3,
                    link_count: 42,
                    story_count: 17,
                    rejected: 1,
                    scrape_dump: None,
                },
            })
        }

        async fn dedup(&self, dry_run: bool, gap_hours: Option<i64>) -> anyhow::Result<DedupReport> {
            Ok(DedupReport {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
                dry_run,
                gap_hours: gap_hours.unwrap_or(72),
                stories_scanned: 0,
                merged: 0,
                failed: 0,
                clusters: Vec::new(),
            })
        }

        async fn latest_run(&self) -> anyhow::Result<Option<IngestionRun>> {
            Ok(Some(IngestionRun {
                id: Uuid::new_v4(),
                attempt: 1,
                status: RunStatus::Ok,
                started_at: Utc::now(),
                finished_at: Some(Utc::now()),
                route_count: 3,
                link_count: 42,
                story_count: 17,
                error: None,
            }))
        }

        async fn archive_entry(&self, url: &str) -> anyhow::Result<ArchiveEntry> {
            Ok(ArchiveEntry::fallback(url, Some("archive.ph")))
        }
    }

    fn router(service: Arc<FakeService>, key: Option<&str>) -> Router {
        app(AppState::new(service, key.map(str::to_string)))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> axum::http::request::Builder {
        Request::builder().method("POST").uri(uri)
    }

    #[test]
    fn key_comparison_requires_exact_bytes() {
        assert!(keys_match("s3cret", "s3cret"));
        assert!(!keys_match("s3cret", "s3cre"));
        assert!(!keys_match("s3creT", "s3cret"));
        assert!(!keys_match("", "s3cret"));
    }

    #[tokio::test]
    async fn ingest_requires_configured_key() {
        let service = Arc::new(FakeService::default());
        let resp = router(service.clone(), None)
            .oneshot(post("/api/ingest").header(API_KEY_HEADER, "anything").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(service.ingests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_rejects_wrong_or_missing_key() {
        let service = Arc::new(FakeService::default());
        let app = router(service.clone(), Some("s3cret"));
        let wrong = app
            .clone()
            .oneshot(post("/api/ingest").header(API_KEY_HEADER, "nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        let missing = app
            .oneshot(post("/api/ingest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(missing).await["error"], "missing API key");
        assert_eq!(service.ingests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ingest_returns_run_summary() {
        let service = Arc::new(FakeService::default());
        let resp = router(service.clone(), Some("s3cret"))
            .oneshot(
                post("/api/ingest")
                    .header(header::AUTHORIZATION, "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["story_count"], 17);
        assert_eq!(body["attempts"], 1);
        assert_eq!(service.ingests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ingest_failure_is_500_with_error() {
        let service = Arc::new(FakeService {
            fail_ingest: true,
            ..FakeService::default()
        });
        let resp = router(service, Some("s3cret"))
            .oneshot(post("/api/ingest").header(API_KEY_HEADER, "s3cret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("browser exhausted"));
    }

    #[tokio::test]
    async fn archive_read_returns_fallback_entry() {
        let resp = router(Arc::new(FakeService::default()), None)
            .oneshot(
                Request::builder()
                    .uri("/api/archive?url=https%3A%2F%2Fpaper.test%2Fa")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], ArchiveStatus::Fallback.as_str());
        assert_eq!(body["archive_url"], "https://archive.ph/https://paper.test/a");
    }

    #[tokio::test]
    async fn archive_read_rejects_bad_url() {
        let app = router(Arc::new(FakeService::default()), None);
        for uri in ["/api/archive", "/api/archive?url=notaurl", "/api/archive?url=ftp%3A%2F%2Fx.test%2F"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn dedup_and_latest_run_are_keyed() {
        let app = router(Arc::new(FakeService::default()), Some("s3cret"));
        let dedup = app
            .clone()
            .oneshot(
                post("/api/dedup?dry_run=true&gap_hours=24")
                    .header(API_KEY_HEADER, "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(dedup.status(), StatusCode::OK);
        let body = json_body(dedup).await;
        assert_eq!(body["report"]["dry_run"], true);
        assert_eq!(body["report"]["gap_hours"], 24);

        let latest = app
            .oneshot(
                Request::builder()
                    .uri("/api/runs/latest")
                    .header(API_KEY_HEADER, "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(json_body(latest).await["run"]["status"], "ok");
    }
}
