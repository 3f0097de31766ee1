use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newsrec_browser::BrowserPage;
use newsrec_core::{archive_lookup_url, ArchiveAttempt, ArchiveEntry, ArchiveStatus};
use scraper::Html;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{element_text, select_first_text, selector};

pub const MAX_ARCHIVE_PARAGRAPHS: usize = 16;
pub const MIN_PARAGRAPH_CHARS: usize = 60;
pub const DEFAULT_ARCHIVE_HOSTS: &[&str] = &["archive.ph", "archive.today", "archive.is"];

const BLOCKED_PATTERNS: &[&str] = &[
    "security check",
    "captcha",
    "are you a robot",
    "verify you are human",
    "one more step",
];
const NOT_FOUND_PATTERNS: &[&str] = &["no results", "didn't archive", "did not archive", "has not been archived"];

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub hosts: Vec<String>,
    pub navigation_timeout: Duration,
    pub settle: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            hosts: DEFAULT_ARCHIVE_HOSTS.iter().map(|h| h.to_string()).collect(),
            navigation_timeout: Duration::from_secs(30),
            settle: Duration::from_millis(1500),
        }
    }
}

impl ArchiveConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hosts: std::env::var("ARCHIVE_HOSTS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .filter(|hosts| !hosts.is_empty())
                .unwrap_or(defaults.hosts),
            ..defaults
        }
    }

    pub fn first_host(&self) -> Option<&str> {
        self.hosts.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageVerdict {
    Blocked,
    NotFound,
    Success {
        headline: Option<String>,
        paragraphs: Vec<String>,
    },
}

/// Classifies a rendered archive page by its text.
pub fn classify_archive_page(html: &str) -> PageVerdict {
    let document = Html::parse_document(html);
    let body_text = document
        .root_element()
        .text()
        .collect::<String>()
        .to_lowercase();

    if BLOCKED_PATTERNS.iter().any(|p| body_text.contains(p)) {
        return PageVerdict::Blocked;
    }
    if NOT_FOUND_PATTERNS.iter().any(|p| body_text.contains(p)) {
        return PageVerdict::NotFound;
    }

    let headline = select_first_text(&document, "h1").ok().flatten();
    let paragraphs = match selector("p") {
        Ok(sel) => document
            .select(&sel)
            .filter_map(element_text)
            .filter(|p| p.chars().count() >= MIN_PARAGRAPH_CHARS)
            .take(MAX_ARCHIVE_PARAGRAPHS)
            .collect(),
        Err(_) => Vec::new(),
    };
    PageVerdict::Success {
        headline,
        paragraphs,
    }
}

/// First success wins; otherwise the first blocked, then not_found, then error.
pub fn select_final_attempt(attempts: &[ArchiveAttempt]) -> Option<&ArchiveAttempt> {
    [
        ArchiveStatus::Success,
        ArchiveStatus::Blocked,
        ArchiveStatus::NotFound,
        ArchiveStatus::Error,
    ]
    .into_iter()
    .find_map(|status| attempts.iter().find(|a| a.status == status))
}

fn entry_from_attempts(original_url: &str, attempts: Vec<ArchiveAttempt>, now: DateTime<Utc>) -> ArchiveEntry {
    let chosen = select_final_attempt(&attempts).cloned();
    match chosen {
        Some(chosen) => ArchiveEntry {
            original_url: original_url.to_string(),
            status: chosen.status,
            host: Some(chosen.host),
            archive_url: Some(chosen.archive_url),
            headline: chosen.headline,
            paragraphs: chosen.paragraphs,
            attempts,
            resolved_at: now,
        },
        None => ArchiveEntry {
            original_url: original_url.to_string(),
            status: ArchiveStatus::Error,
            host: None,
            archive_url: None,
            headline: None,
            paragraphs: Vec::new(),
            attempts,
            resolved_at: now,
        },
    }
}

async fn attempt_host(page: &dyn BrowserPage, host: &str, original_url: &str, config: &ArchiveConfig) -> ArchiveAttempt {
    let archive_url = archive_lookup_url(host, original_url);
    let mut attempt = ArchiveAttempt {
        host: host.to_string(),
        archive_url: archive_url.clone(),
        status: ArchiveStatus::Error,
        error: None,
        headline: None,
        paragraphs: Vec::new(),
        checked_at: Utc::now(),
    };

    let html = match page.goto(&archive_url, config.navigation_timeout).await {
        Ok(()) => {
            page.pause(config.settle).await;
            page.html().await
        }
        Err(err) => Err(err),
    };
    match html {
        Ok(html) => match classify_archive_page(&html) {
            PageVerdict::Blocked => attempt.status = ArchiveStatus::Blocked,
            PageVerdict::NotFound => attempt.status = ArchiveStatus::NotFound,
            PageVerdict::Success {
                headline,
                paragraphs,
            } => {
                attempt.status = ArchiveStatus::Success;
                attempt.headline = headline;
                attempt.paragraphs = paragraphs;
            }
        },
        Err(err) => {
            warn!(host, url = %original_url, error = %err, "archive host failed");
            attempt.error = Some(err.to_string());
        }
    }
    debug!(host, url = %original_url, status = %attempt.status, "archive attempt");
    attempt
}

/// Tries each host in order on one page; the first success short-circuits.
pub async fn resolve_archive(page: &dyn BrowserPage, original_url: &str, config: &ArchiveConfig) -> ArchiveEntry {
    let mut attempts = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let attempt = attempt_host(page, host, original_url, config).await;
        let done = attempt.status == ArchiveStatus::Success;
        attempts.push(attempt);
        if done {
            break;
        }
    }
    let entry = entry_from_attempts(original_url, attempts, Utc::now());
    info!(
        url = %original_url,
        status = %entry.status,
        attempts = entry.attempts.len(),
        "archive resolved"
    );
    entry
}

/// Cache of resolved entries keyed by original URL.
#[async_trait]
pub trait ArchiveEntryStore: Send + Sync {
    async fn get(&self, original_url: &str) -> anyhow::Result<Option<ArchiveEntry>>;
    async fn put(&self, entry: &ArchiveEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryArchiveStore {
    entries: Mutex<HashMap<String, ArchiveEntry>>,
}

#[async_trait]
impl ArchiveEntryStore for InMemoryArchiveStore {
    async fn get(&self, original_url: &str) -> anyhow::Result<Option<ArchiveEntry>> {
        Ok(self.entries.lock().await.get(original_url).cloned())
    }

    async fn put(&self, entry: &ArchiveEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .await
            .insert(entry.original_url.clone(), entry.clone());
        Ok(())
    }
}

/// Returns a reusable cached entry, or resolves and stores a fresh one.
pub async fn resolve_cached(
    page: &dyn BrowserPage,
    store: &dyn ArchiveEntryStore,
    original_url: &str,
    config: &ArchiveConfig,
) -> anyhow::Result<ArchiveEntry> {
    if let Some(cached) = store.get(original_url).await? {
        if cached.is_reusable(Utc::now()) {
            debug!(url = %original_url, status = %cached.status, "archive cache hit");
            return Ok(cached);
        }
        debug!(url = %original_url, "cached not_found expired; retrying");
    }
    let entry = resolve_archive(page, original_url, config).await;
    store.put(&entry).await?;
    Ok(entry)
}
