use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use newsrec_browser::BrowserPage;
use newsrec_core::LinkKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub const DEFAULT_SCROLL_PASSES: u32 = 4;
pub const DEFAULT_SETTLE_MS: u64 = 1200;
pub const DEFAULT_MAX_LINKS_PER_ROUTE: usize = 120;
pub const DEFAULT_NAVIGATION_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_ROUTES: &[&str] = &["/", "/blindspot", "/local", "/international"];

/// Controls on the "proceed anyway" consent screen.
pub const INTERSTITIAL_PATTERNS: &[&str] = &["proceed anyway", "continue to site", "continue anyway"];
/// Controls on the cookie-preference banner.
pub const COOKIE_PATTERNS: &[&str] = &["accept all", "accept cookies", "allow all", "i agree"];

const INTERSTITIAL_MARKERS: &[&str] = &["proceed anyway", "before you continue"];
const COOKIE_MARKERS: &[&str] = &["cookie preferences", "we use cookies", "manage cookies"];

const STORY_PREFIX: &str = "/story/";
const TOPIC_PREFIX: &str = "/interest/";
const OUTLET_PREFIX: &str = "/source/";

#[derive(Debug, Clone)]
pub struct ScrapeOptions {
    pub base_url: String,
    pub routes: Vec<String>,
    pub scroll_passes: u32,
    pub settle: Duration,
    pub navigation_timeout: Duration,
    pub max_links_per_route: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            base_url: "https://news-aggregator.invalid".to_string(),
            routes: DEFAULT_ROUTES.iter().map(|r| r.to_string()).collect(),
            scroll_passes: DEFAULT_SCROLL_PASSES,
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
            navigation_timeout: Duration::from_secs(DEFAULT_NAVIGATION_TIMEOUT_SECS),
            max_links_per_route: DEFAULT_MAX_LINKS_PER_ROUTE,
        }
    }
}

impl ScrapeOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("NEWSREC_SITE_BASE_URL").unwrap_or(defaults.base_url),
            routes: std::env::var("NEWSREC_ROUTES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|r| !r.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .ok()
                .filter(|routes| !routes.is_empty())
                .unwrap_or(defaults.routes),
            scroll_passes: std::env::var("NEWSREC_SCROLL_PASSES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.scroll_passes),
            settle: std::env::var("NEWSREC_SETTLE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle),
            navigation_timeout: defaults.navigation_timeout,
            max_links_per_route: std::env::var("NEWSREC_MAX_LINKS_PER_ROUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_links_per_route),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLinks {
    pub story: Vec<String>,
    pub topic: Vec<String>,
    pub outlet: Vec<String>,
}

impl RouteLinks {
    pub fn total(&self) -> usize {
        self.story.len() + self.topic.len() + self.outlet.len()
    }
}

/// Whether a prompt was still on screen when links were captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingSignals {
    pub interstitial: bool,
    pub cookie_banner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResult {
    pub route: String,
    pub url: String,
    pub status: RouteStatus,
    pub error: Option<String>,
    pub final_url: Option<String>,
    pub links: RouteLinks,
    pub blocking: BlockingSignals,
    pub dismissed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeOutcome {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub routes: Vec<RouteResult>,
    pub story_links: Vec<String>,
}

impl ScrapeOutcome {
    pub fn link_count(&self) -> usize {
        self.routes.iter().map(|r| r.links.total()).sum()
    }
}

/// Buckets a same-site URL by its path prefix.
pub fn classify_link(url: &Url, site: &Url) -> Option<LinkKind> {
    if url.host_str() != site.host_str() {
        return None;
    }
    let path = url.path();
    let (kind, rest) = if let Some(rest) = path.strip_prefix(STORY_PREFIX) {
        (LinkKind::Story, rest)
    } else if let Some(rest) = path.strip_prefix(TOPIC_PREFIX) {
        (LinkKind::Topic, rest)
    } else if let Some(rest) = path.strip_prefix(OUTLET_PREFIX) {
        (LinkKind::Outlet, rest)
    } else {
        return None;
    };
    // Bare prefixes are hub pages, not entities.
    if rest.trim_matches('/').is_empty() {
        return None;
    }
    Some(kind)
}

/// Resolves raw hrefs against `page_url`, classifies them and keeps at most
/// `max_per_kind` unique links of each kind.
pub fn bucket_links(page_url: &Url, site: &Url, hrefs: &[String], max_per_kind: usize) -> RouteLinks {
    let mut links = RouteLinks::default();
    let mut seen = HashSet::new();
    for href in hrefs {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }
        let Ok(mut resolved) = page_url.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        let Some(kind) = classify_link(&resolved, site) else {
            continue;
        };
        if kind == LinkKind::Story {
            resolved.set_query(None);
        }
        let resolved = resolved.to_string();
        if !seen.insert(resolved.clone()) {
            continue;
        }
        let bucket = match kind {
            LinkKind::Story => &mut links.story,
            LinkKind::Topic => &mut links.topic,
            LinkKind::Outlet => &mut links.outlet,
        };
        if bucket.len() < max_per_kind {
            bucket.push(resolved);
        }
    }
    links
}

pub fn detect_blocking(html: &str) -> BlockingSignals {
    let lower = html.to_lowercase();
    BlockingSignals {
        interstitial: INTERSTITIAL_MARKERS.iter().any(|m| lower.contains(m)),
        cookie_banner: COOKIE_MARKERS.iter().any(|m| lower.contains(m)),
    }
}

async fn dismiss_prompts(page: &dyn BrowserPage, settle: Duration, dismissed: &mut Vec<String>) {
    for patterns in [INTERSTITIAL_PATTERNS, COOKIE_PATTERNS] {
        match page.click_text(patterns).await {
            Ok(Some(text)) => {
                debug!(control = %text, "dismissed prompt");
                dismissed.push(text);
                page.pause(settle).await;
            }
            Ok(None) => {}
            Err(err) => debug!(error = %err, "prompt dismissal failed"),
        }
    }
}

async fn scrape_route(
    page: &dyn BrowserPage,
    route: &str,
    url: &Url,
    site: &Url,
    options: &ScrapeOptions,
) -> newsrec_browser::Result<RouteResult> {
    page.goto(url.as_str(), options.navigation_timeout).await?;
    page.pause(options.settle).await;

    let mut dismissed = Vec::new();
    for _ in 0..options.scroll_passes {
        dismiss_prompts(page, options.settle, &mut dismissed).await;
        page.scroll_to_bottom().await?;
        page.pause(options.settle).await;
    }

    let final_url = page.current_url().await.ok().flatten();
    let page_url = final_url
        .as_deref()
        .and_then(|u| Url::parse(u).ok())
        .unwrap_or_else(|| url.clone());
    let hrefs = page.hrefs().await?;
    let html = page.html().await?;

    Ok(RouteResult {
        route: route.to_string(),
        url: url.to_string(),
        status: RouteStatus::Ok,
        error: None,
        final_url,
        links: bucket_links(&page_url, site, &hrefs, options.max_links_per_route),
        blocking: detect_blocking(&html),
        dismissed,
    })
}

/// Walks every route on one page, sequentially. A failing route is recorded
/// and skipped; story links are deduplicated across all routes.
pub async fn scrape(page: &dyn BrowserPage, options: &ScrapeOptions) -> ScrapeOutcome {
    let started_at = Utc::now();
    let site = Url::parse(&options.base_url).ok();
    let mut routes = Vec::with_capacity(options.routes.len());

    for route in &options.routes {
        let resolved = site.as_ref().and_then(|s| s.join(route).ok());
        let (Some(site), Some(url)) = (site.as_ref(), resolved) else {
            routes.push(RouteResult {
                route: route.clone(),
                url: format!("{}{}", options.base_url, route),
                status: RouteStatus::Error,
                error: Some(format!("cannot resolve route against {}", options.base_url)),
                final_url: None,
                links: RouteLinks::default(),
                blocking: BlockingSignals::default(),
                dismissed: Vec::new(),
            });
            continue;
        };

        let span = info_span!("scrape_route", route = %route);
        let result = scrape_route(page, route, &url, site, options)
            .instrument(span)
            .await;
        match result {
            Ok(result) => {
                info!(
                    route = %route,
                    stories = result.links.story.len(),
                    topics = result.links.topic.len(),
                    outlets = result.links.outlet.len(),
                    interstitial = result.blocking.interstitial,
                    cookie_banner = result.blocking.cookie_banner,
                    "route scraped"
                );
                routes.push(result);
            }
            Err(err) => {
                warn!(route = %route, error = %err, "route failed");
                routes.push(RouteResult {
                    route: route.clone(),
                    url: url.to_string(),
                    status: RouteStatus::Error,
                    error: Some(err.to_string()),
                    final_url: None,
                    links: RouteLinks::default(),
                    blocking: BlockingSignals::default(),
                    dismissed: Vec::new(),
                });
            }
        }
    }

    let mut seen = HashSet::new();
    let story_links = routes
        .iter()
        .flat_map(|r| r.links.story.iter())
        .filter(|link| seen.insert(link.as_str()))
        .cloned()
        .collect();

    ScrapeOutcome {
        started_at,
        finished_at: Utc::now(),
        routes,
        story_links,
    }
}
