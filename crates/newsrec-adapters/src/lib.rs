//! Site scraping, archive resolution and story enrichment.

mod archive;
mod classifier;
mod scrape;
mod story;

use newsrec_core::ContractError;
use newsrec_storage::FetchError;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub use archive::{
    classify_archive_page, resolve_archive, resolve_cached, select_final_attempt, ArchiveConfig,
    ArchiveEntryStore, InMemoryArchiveStore, PageVerdict, DEFAULT_ARCHIVE_HOSTS,
    MAX_ARCHIVE_PARAGRAPHS, MIN_PARAGRAPH_CHARS,
};
pub use classifier::{HostHashClassifier, SourceClassifier, SourceSignals};
pub use scrape::{
    bucket_links, classify_link, detect_blocking, scrape, BlockingSignals, RouteLinks,
    RouteResult, RouteStatus, ScrapeOptions, ScrapeOutcome, COOKIE_PATTERNS,
    DEFAULT_MAX_LINKS_PER_ROUTE, DEFAULT_ROUTES, DEFAULT_SCROLL_PASSES, DEFAULT_SETTLE_MS,
    INTERSTITIAL_PATTERNS,
};
pub use story::{
    build_candidate, is_local_text, is_trending, normalize_image_url, parse_story_page,
    slug_from_story_url, truncate_summary, ParsedStoryPage, SourceLink, StoryEnricher, BLINDSPOT_SHARE,
    MAX_SOURCE_LINKS, MAX_TAGS, PLACEHOLDER_IMAGE_URL, SUMMARY_MAX_CHARS,
};

pub const CRATE_NAME: &str = "newsrec-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector(format!("{raw}: {e}")))
}

pub(crate) fn element_text(el: ElementRef<'_>) -> Option<String> {
    text_or_none(el.text().collect::<String>())
}

pub(crate) fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document.select(&sel).find_map(element_text))
}

pub(crate) fn select_first_attr(
    document: &Html,
    raw: &str,
    attr: &str,
) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .find_map(|s| text_or_none(s.to_string())))
}
