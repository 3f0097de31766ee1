use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::rotation::{select_index, FileRotationStore, RotationMode, RotationState, RotationStore};
use crate::vendor::{CreateSessionRequest, SessionProvider, VendorClient};
use crate::{BrowserError, Result};

pub const DEFAULT_MAX_MATRIX_ATTEMPTS: usize = 6;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 300;

const PROFILE_POOL: &str = "profile";
const PROXY_POOL: &str = "proxy_country";

/// Proxy country codes implied by a site edition.
pub fn edition_countries(edition: &str) -> &'static [&'static str] {
    match edition.trim().to_ascii_lowercase().as_str() {
        "europe" | "eu" => &["de", "fr", "nl", "be"],
        "us" => &["us"],
        "uk" | "gb" => &["gb"],
        "international" | "intl" => &["us", "gb", "ca", "au"],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SessionIdentity {
    pub profile_id: Option<String>,
    pub proxy_country: Option<String>,
}

impl SessionIdentity {
    pub fn new(profile_id: Option<&str>, proxy_country: Option<&str>) -> Self {
        Self {
            profile_id: profile_id.map(str::to_string),
            proxy_country: proxy_country.map(str::to_string),
        }
    }

    pub fn bare() -> Self {
        Self::default()
    }
}

/// Orders the identities to try when creating a session.
///
/// `base` first, then pool combinations until `cap` entries exist, then the
/// base with its profile dropped, the base with its proxy dropped, and finally
/// no identity at all. Duplicates are skipped.
pub fn build_attempt_matrix(
    base: &SessionIdentity,
    profiles: &[String],
    countries: &[String],
    cap: usize,
) -> Vec<SessionIdentity> {
    fn push(matrix: &mut Vec<SessionIdentity>, identity: SessionIdentity) {
        if !matrix.contains(&identity) {
            matrix.push(identity);
        }
    }

    let mut matrix: Vec<SessionIdentity> = Vec::new();

    push(&mut matrix, base.clone());

    let profile_axis: Vec<Option<&str>> = if profiles.is_empty() {
        vec![base.profile_id.as_deref()]
    } else {
        profiles.iter().map(|p| Some(p.as_str())).collect()
    };
    let country_axis: Vec<Option<&str>> = if countries.is_empty() {
        vec![base.proxy_country.as_deref()]
    } else {
        countries.iter().map(|c| Some(c.as_str())).collect()
    };

    'combos: for profile in &profile_axis {
        for country in &country_axis {
            if matrix.len() >= cap.max(1) {
                break 'combos;
            }
            push(&mut matrix, SessionIdentity::new(*profile, *country));
        }
    }

    push(
        &mut matrix,
        SessionIdentity::new(None, base.proxy_country.as_deref()),
    );
    push(
        &mut matrix,
        SessionIdentity::new(base.profile_id.as_deref(), None),
    );
    push(&mut matrix, SessionIdentity::bare());
    matrix
}

fn dedup_pool<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }
    out
}

fn split_list(raw: &str) -> Vec<String> {
    dedup_pool(raw.split(','))
}

#[derive(Debug, Clone, Default)]
pub struct AcquireContext {
    /// Makes identity selection deterministic per logical task in sticky mode.
    pub rotation_key: Option<String>,
    pub profile_id: Option<String>,
    pub proxy_country: Option<String>,
}

impl AcquireContext {
    pub fn keyed(rotation_key: &str) -> Self {
        Self {
            rotation_key: Some(rotation_key.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserLease {
    pub session_id: String,
    pub endpoint: String,
    pub identity: SessionIdentity,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub api_url: String,
    pub api_key: String,
    pub profile_ids: Vec<String>,
    pub proxy_countries: Vec<String>,
    pub edition: Option<String>,
    pub rotation_mode: RotationMode,
    pub max_attempts: usize,
    pub session_timeout_secs: u64,
    pub request_timeout: Duration,
    pub rotation_state_path: PathBuf,
}

impl BrokerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let workspace = std::env::var("NEWSREC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let api_key = std::env::var("BROWSER_API_KEY").context("BROWSER_API_KEY is not set")?;
        let rotation_mode = match std::env::var("BROWSER_ROTATION_MODE") {
            Ok(raw) => RotationMode::parse(&raw).with_context(|| {
                format!("BROWSER_ROTATION_MODE must be round_robin, random or sticky (got {raw:?})")
            })?,
            Err(_) => RotationMode::RoundRobin,
        };

        Ok(Self {
            api_url: std::env::var("BROWSER_API_URL")
                .unwrap_or_else(|_| "https://api.browser-vendor.invalid/v1".to_string()),
            api_key,
            profile_ids: std::env::var("BROWSER_PROFILE_IDS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            proxy_countries: std::env::var("BROWSER_PROXY_COUNTRIES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            edition: std::env::var("BROWSER_EDITION").ok().filter(|v| !v.trim().is_empty()),
            rotation_mode,
            max_attempts: std::env::var("BROWSER_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_MATRIX_ATTEMPTS),
            session_timeout_secs: std::env::var("BROWSER_SESSION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(
                std::env::var("NEWSREC_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            rotation_state_path: workspace.join("state").join("browser_rotation.json"),
        })
    }
}

pub struct SessionBroker {
    provider: Arc<dyn SessionProvider>,
    rotation: Arc<dyn RotationStore>,
    config: BrokerConfig,
}

impl SessionBroker {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        rotation: Arc<dyn RotationStore>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            provider,
            rotation,
            config,
        }
    }

    /// Vendor REST client plus file-backed rotation state.
    pub fn from_config(config: BrokerConfig) -> Result<Self> {
        let provider = VendorClient::new(&config.api_url, &config.api_key, config.request_timeout)?;
        let rotation = FileRotationStore::new(config.rotation_state_path.clone());
        Ok(Self::new(Arc::new(provider), Arc::new(rotation), config))
    }

    pub fn provider(&self) -> Arc<dyn SessionProvider> {
        self.provider.clone()
    }

    fn profile_pool(&self, ctx: &AcquireContext) -> Vec<String> {
        dedup_pool(
            ctx.profile_id
                .as_deref()
                .into_iter()
                .chain(self.config.profile_ids.iter().map(String::as_str)),
        )
    }

    fn country_pool(&self, ctx: &AcquireContext) -> Vec<String> {
        let edition = self
            .config
            .edition
            .as_deref()
            .map(edition_countries)
            .unwrap_or(&[]);
        dedup_pool(
            ctx.proxy_country
                .as_deref()
                .into_iter()
                .chain(self.config.proxy_countries.iter().map(String::as_str))
                .chain(edition.iter().copied()),
        )
    }

    async fn load_rotation(&self) -> RotationState {
        match self.rotation.load().await {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "rotation state unreadable; starting from zero");
                RotationState::default()
            }
        }
    }

    fn pick(
        &self,
        explicit: Option<&str>,
        pool: &[String],
        pool_name: &str,
        ctx: &AcquireContext,
        state: &RotationState,
    ) -> Option<String> {
        if let Some(explicit) = explicit {
            return Some(explicit.to_string());
        }
        let key = ctx.rotation_key.as_deref().map(|k| format!("{k}:{pool_name}"));
        select_index(
            pool.len(),
            self.config.rotation_mode,
            key.as_deref(),
            state.counter(pool_name),
            rand::random::<u64>(),
        )
        .and_then(|idx| pool.get(idx).cloned())
    }

    pub async fn acquire(&self, ctx: &AcquireContext) -> Result<BrowserLease> {
        let profiles = self.profile_pool(ctx);
        let countries = self.country_pool(ctx);

        let mut state = self.load_rotation().await;
        let base = SessionIdentity {
            profile_id: self.pick(ctx.profile_id.as_deref(), &profiles, PROFILE_POOL, ctx, &state),
            proxy_country: self.pick(
                ctx.proxy_country.as_deref(),
                &countries,
                PROXY_POOL,
                ctx,
                &state,
            ),
        };
        if self.config.rotation_mode == RotationMode::RoundRobin {
            state.advance(PROFILE_POOL);
            state.advance(PROXY_POOL);
            if let Err(err) = self.rotation.save(&state).await {
                warn!(error = %err, "failed to persist rotation state");
            }
        }

        let matrix = build_attempt_matrix(&base, &profiles, &countries, self.config.max_attempts);
        let mut last_error = String::from("no session configurations to try");
        for (idx, identity) in matrix.iter().enumerate() {
            let request = CreateSessionRequest {
                profile_id: identity.profile_id.clone(),
                proxy_country_code: identity.proxy_country.clone(),
                timeout: Some(self.config.session_timeout_secs),
            };
            match self.provider.create_session(&request).await {
                Ok(session) => {
                    info!(
                        session_id = %session.id,
                        profile = ?identity.profile_id,
                        proxy = ?identity.proxy_country,
                        attempt = idx + 1,
                        "browser session acquired"
                    );
                    return Ok(BrowserLease {
                        session_id: session.id,
                        endpoint: session.connect_url,
                        identity: identity.clone(),
                        attempts: idx + 1,
                    });
                }
                Err(err) if err.is_auth_failure() => return Err(err),
                Err(err) => {
                    warn!(
                        error = %err,
                        profile = ?identity.profile_id,
                        proxy = ?identity.proxy_country,
                        attempt = idx + 1,
                        "session creation failed; trying next configuration"
                    );
                    last_error = err.to_string();
                }
            }
        }

        Err(BrowserError::Exhausted {
            attempts: matrix.len(),
            last: last_error,
        })
    }

    pub async fn release(&self, lease: &BrowserLease) -> Result<()> {
        self.provider.stop_session(&lease.session_id).await?;
        info!(session_id = %lease.session_id, "browser session released");
        Ok(())
    }

    /// Stops every session the vendor reports as active. Returns the stopped ids.
    pub async fn stop_all(&self, page_size: u32) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_number = 1;
        loop {
            let page = self.provider.list_sessions(page_size, page_number).await?;
            if page.sessions.is_empty() {
                break;
            }
            let fetched = page.sessions.len();
            ids.extend(page.sessions.into_iter().map(|s| s.id));
            if fetched < page_size as usize {
                break;
            }
            page_number += 1;
        }
        let mut stopped = Vec::new();
        for id in ids {
            match self.provider.stop_session(&id).await {
                Ok(()) => stopped.push(id),
                Err(err) => warn!(session_id = %id, error = %err, "failed to stop session"),
            }
        }
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::InMemoryRotationStore;
    use crate::vendor::{ListedSession, SessionPage, VendorSession};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn matrix_orders_base_combos_then_degraded_fallbacks() {
        let base = SessionIdentity::new(Some("p1"), Some("de"));
        let matrix = build_attempt_matrix(&base, &ids(&["p1", "p2"]), &ids(&["de", "fr"]), 6);
        assert_eq!(
            matrix,
            vec![
                SessionIdentity::new(Some("p1"), Some("de")),
                SessionIdentity::new(Some("p1"), Some("fr")),
                SessionIdentity::new(Some("p2"), Some("de")),
                SessionIdentity::new(Some("p2"), Some("fr")),
                SessionIdentity::new(None, Some("de")),
                SessionIdentity::new(Some("p1"), None),
                SessionIdentity::bare(),
            ]
        );
    }

    #[test]
    fn matrix_cap_limits_combinations_but_keeps_fallbacks() {
        let base = SessionIdentity::new(Some("p1"), Some("de"));
        let matrix = build_attempt_matrix(&base, &ids(&["p1", "p2", "p3"]), &ids(&["de", "fr"]), 2);
        assert_eq!(matrix.len(), 5);
        assert_eq!(matrix[1], SessionIdentity::new(Some("p1"), Some("fr")));
        assert_eq!(matrix.last(), Some(&SessionIdentity::bare()));
    }

    #[test]
    fn bare_base_collapses_to_one_entry() {
        let matrix = build_attempt_matrix(&SessionIdentity::bare(), &[], &[], 6);
        assert_eq!(matrix, vec![SessionIdentity::bare()]);
    }

    #[test]
    fn edition_map_matches_known_editions() {
        assert_eq!(edition_countries("Europe"), &["de", "fr", "nl", "be"]);
        assert_eq!(edition_countries("uk"), &["gb"]);
        assert!(edition_countries("mars").is_empty());
    }

    #[derive(Default)]
    struct FakeProvider {
        fail_with: Mutex<Vec<Option<u16>>>,
        requests: Mutex<Vec<CreateSessionRequest>>,
        stopped: Mutex<Vec<String>>,
        listed: Vec<String>,
    }

    #[async_trait]
    impl SessionProvider for FakeProvider {
        async fn create_session(&self, request: &CreateSessionRequest) -> Result<VendorSession> {
            self.requests.lock().await.push(request.clone());
            let mut script = self.fail_with.lock().await;
            let outcome = if script.is_empty() { None } else { script.remove(0) };
            match outcome {
                Some(status) => Err(BrowserError::Api {
                    status,
                    message: "nope".into(),
                }),
                None => Ok(VendorSession {
                    id: format!("s-{}", self.requests.lock().await.len()),
                    connect_url: "wss://cdp.test".into(),
                    status: None,
                    created_at: None,
                }),
            }
        }

        async fn stop_session(&self, session_id: &str) -> Result<()> {
            self.stopped.lock().await.push(session_id.to_string());
            Ok(())
        }

        async fn list_sessions(&self, page_size: u32, page_number: u32) -> Result<SessionPage> {
            let start = ((page_number - 1) * page_size) as usize;
            let sessions = self
                .listed
                .iter()
                .skip(start)
                .take(page_size as usize)
                .map(|id| ListedSession {
                    id: id.clone(),
                    status: Some("running".into()),
                })
                .collect();
            Ok(SessionPage {
                sessions,
                total_items: Some(self.listed.len() as u64),
            })
        }
    }

    fn config(mode: RotationMode) -> BrokerConfig {
        BrokerConfig {
            api_url: "http://vendor.test".into(),
            api_key: "k".into(),
            profile_ids: ids(&["p1", "p2"]),
            proxy_countries: vec![],
            edition: Some("europe".into()),
            rotation_mode: mode,
            max_attempts: DEFAULT_MAX_MATRIX_ATTEMPTS,
            session_timeout_secs: 60,
            request_timeout: Duration::from_secs(5),
            rotation_state_path: PathBuf::from("unused.json"),
        }
    }

    fn broker(provider: Arc<FakeProvider>, mode: RotationMode) -> SessionBroker {
        SessionBroker::new(provider, Arc::new(InMemoryRotationStore::default()), config(mode))
    }

    #[tokio::test]
    async fn auth_failure_aborts_without_trying_other_identities() {
        let provider = Arc::new(FakeProvider {
            fail_with: Mutex::new(vec![Some(401)]),
            ..FakeProvider::default()
        });
        let err = broker(provider.clone(), RotationMode::RoundRobin)
            .acquire(&AcquireContext::default())
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(provider.requests.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_degrade_to_bare_session() {
        let provider = Arc::new(FakeProvider {
            fail_with: Mutex::new(vec![Some(500); 20]),
            ..FakeProvider::default()
        });
        let err = broker(provider.clone(), RotationMode::RoundRobin)
            .acquire(&AcquireContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::Exhausted { .. }));
        let requests = provider.requests.lock().await;
        let last = requests.last().unwrap();
        assert_eq!(last.profile_id, None);
        assert_eq!(last.proxy_country_code, None);
    }

    #[tokio::test]
    async fn explicit_overrides_win_and_second_try_succeeds() {
        let provider = Arc::new(FakeProvider {
            fail_with: Mutex::new(vec![Some(502)]),
            ..FakeProvider::default()
        });
        let ctx = AcquireContext {
            rotation_key: None,
            profile_id: Some("special".into()),
            proxy_country: Some("nl".into()),
        };
        let lease = broker(provider.clone(), RotationMode::RoundRobin)
            .acquire(&ctx)
            .await
            .unwrap();
        assert_eq!(lease.attempts, 2);
        let requests = provider.requests.lock().await;
        assert_eq!(requests[0].profile_id.as_deref(), Some("special"));
        assert_eq!(requests[0].proxy_country_code.as_deref(), Some("nl"));
    }

    #[tokio::test]
    async fn round_robin_rotates_between_acquisitions() {
        let provider = Arc::new(FakeProvider::default());
        let broker = broker(provider.clone(), RotationMode::RoundRobin);
        let first = broker.acquire(&AcquireContext::default()).await.unwrap();
        let second = broker.acquire(&AcquireContext::default()).await.unwrap();
        assert_eq!(first.identity.profile_id.as_deref(), Some("p1"));
        assert_eq!(second.identity.profile_id.as_deref(), Some("p2"));
        assert_eq!(first.identity.proxy_country.as_deref(), Some("de"));
        assert_eq!(second.identity.proxy_country.as_deref(), Some("fr"));
    }

    #[tokio::test]
    async fn sticky_key_pins_identity() {
        let provider = Arc::new(FakeProvider::default());
        let broker = broker(provider, RotationMode::Sticky);
        let ctx = AcquireContext::keyed("archive-verify-batch");
        let a = broker.acquire(&ctx).await.unwrap();
        let b = broker.acquire(&ctx).await.unwrap();
        assert_eq!(a.identity, b.identity);
    }

    #[tokio::test]
    async fn stop_all_pages_through_sessions() {
        let provider = Arc::new(FakeProvider {
            listed: ids(&["a", "b", "c"]),
            ..FakeProvider::default()
        });
        let stopped = broker(provider.clone(), RotationMode::RoundRobin)
            .stop_all(2)
            .await
            .unwrap();
        assert_eq!(stopped, ids(&["a", "b", "c"]));
        assert_eq!(*provider.stopped.lock().await, ids(&["a", "b", "c"]));
    }
}
