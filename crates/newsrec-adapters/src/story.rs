use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use newsrec_core::{
    host_of, is_wire_service, outlet_name_from_host, BiasDistribution, ContractError, OutletDraft,
    SourceCandidate, StoryCandidate,
};
use newsrec_storage::HttpFetcher;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};
use url::Url;

use crate::classifier::{hash_u64, SourceClassifier};
use crate::{element_text, select_first_attr, select_first_text, selector, AdapterError};

pub const SUMMARY_MAX_CHARS: usize = 220;
pub const MAX_TAGS: usize = 5;
pub const MAX_SOURCE_LINKS: usize = 8;
/// Dominant-bucket share (percent) at which a story counts as a blindspot.
pub const BLINDSPOT_SHARE: f64 = 60.0;
pub const PLACEHOLDER_IMAGE_URL: &str = "/images/story-placeholder.png";

const TOPIC_PATH: &str = "/interest/";
const FLAG_ICON_MARKERS: &[&str] = &["flagcdn.com", "/flags/", "/country-flags/"];
const LOCAL_PATTERN: &str =
    r"(?i)\b(city|county|state|township|borough|parish|municipal|mayor|governor|sheriff|city council)\b";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    pub url: String,
    pub text: Option<String>,
}

/// Fields read off a story landing page, before any derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedStoryPage {
    pub title: Option<String>,
    pub dek: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub image_url: String,
    pub topic: Option<String>,
    pub location: Option<String>,
    pub tags: Vec<String>,
    pub source_links: Vec<SourceLink>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub fn truncate_summary(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= SUMMARY_MAX_CHARS {
        return text.to_string();
    }
    let cut = text.chars().take(SUMMARY_MAX_CHARS - 1).collect::<String>();
    format!("{}…", cut.trim_end())
}

/// Resolves an image reference, unwrapping optimizer-proxy URLs and
/// replacing flag-icon placeholders.
pub fn normalize_image_url(raw: Option<&str>, base: &Url) -> String {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return PLACEHOLDER_IMAGE_URL.to_string();
    };
    let Ok(mut resolved) = base.join(raw) else {
        return PLACEHOLDER_IMAGE_URL.to_string();
    };
    let proxied = resolved
        .query_pairs()
        .find(|(k, _)| k == "url")
        .map(|(_, v)| v.into_owned());
    if let Some(origin) = proxied {
        match base.join(&origin) {
            Ok(origin) => resolved = origin,
            Err(_) => return PLACEHOLDER_IMAGE_URL.to_string(),
        }
    }
    if !matches!(resolved.scheme(), "http" | "https") {
        return PLACEHOLDER_IMAGE_URL.to_string();
    }
    let text = resolved.to_string();
    if FLAG_ICON_MARKERS.iter().any(|m| text.contains(m)) {
        return PLACEHOLDER_IMAGE_URL.to_string();
    }
    text
}

/// Last path segment of a `/story/<slug>` URL.
pub fn slug_from_story_url(story_url: &str) -> Option<String> {
    let url = Url::parse(story_url).ok()?;
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    match segments.next() {
        Some("story") => segments.last().map(str::to_string),
        _ => None,
    }
}

fn local_regex() -> Option<&'static Regex> {
    static LOCAL: OnceLock<Option<Regex>> = OnceLock::new();
    LOCAL.get_or_init(|| Regex::new(LOCAL_PATTERN).ok()).as_ref()
}

pub fn is_local_text(text: &str) -> bool {
    local_regex().is_some_and(|re| re.is_match(text))
}

/// Stable two-in-three coin flip keyed on the slug.
pub fn is_trending(slug: &str) -> bool {
    hash_u64(&format!("trending:{slug}")) % 3 != 0
}

fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|r| DateTime::parse_from_rfc3339(r.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn site_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
}

pub fn parse_story_page(html: &str, page_url: &Url) -> Result<ParsedStoryPage, AdapterError> {
    let document = Html::parse_document(html);

    let title = match select_first_attr(&document, r#"meta[property="og:title"]"#, "content")? {
        Some(t) => Some(t),
        None => match select_first_text(&document, "h1")? {
            Some(t) => Some(t),
            None => select_first_text(&document, "title")?,
        },
    };
    let description = select_first_attr(&document, r#"meta[name="description"]"#, "content")?;
    let og_description = select_first_attr(&document, r#"meta[property="og:description"]"#, "content")?;
    let summary = description.clone().or_else(|| og_description.clone()).map(|s| truncate_summary(&s));
    let dek = og_description.filter(|d| Some(d) != description.as_ref());

    let image_raw = match select_first_attr(&document, r#"meta[property="og:image"]"#, "content")? {
        Some(src) => Some(src),
        None => select_first_attr(&document, "img[src]", "src")?,
    };

    let topic = match select_first_attr(&document, r#"meta[property="article:section"]"#, "content")? {
        Some(section) => Some(section),
        None => select_first_attr(&document, r#"meta[name="keywords"]"#, "content")?.and_then(|k| {
            k.split(',')
                .map(str::trim)
                .find(|k| !k.is_empty())
                .map(str::to_string)
        }),
    };

    let own_host = site_host(page_url);
    let anchors = selector("a[href]")?;
    let mut tags = Vec::new();
    let mut seen_tags = HashSet::new();
    let mut source_links = Vec::new();
    let mut seen_sources = HashSet::new();
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = page_url.join(href.trim()) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        resolved.set_fragment(None);
        let text = element_text(anchor);
        let same_site = site_host(&resolved) == own_host;

        if same_site {
            if resolved.path().starts_with(TOPIC_PATH) && tags.len() < MAX_TAGS {
                if let Some(tag) = text {
                    if seen_tags.insert(tag.to_lowercase()) {
                        tags.push(tag);
                    }
                }
            }
            continue;
        }

        if source_links.len() < MAX_SOURCE_LINKS && seen_sources.insert(resolved.to_string()) {
            source_links.push(SourceLink {
                url: resolved.to_string(),
                text,
            });
        }
    }

    Ok(ParsedStoryPage {
        title,
        dek,
        author: select_first_attr(&document, r#"meta[name="author"]"#, "content")?,
        summary,
        image_url: normalize_image_url(image_raw.as_deref(), page_url),
        topic,
        location: select_first_attr(&document, r#"meta[name="geo.placename"]"#, "content")?,
        tags,
        source_links,
        published_at: parse_timestamp(select_first_attr(
            &document,
            r#"meta[property="article:published_time"]"#,
            "content",
        )?),
        updated_at: parse_timestamp(select_first_attr(
            &document,
            r#"meta[property="article:modified_time"]"#,
            "content",
        )?),
    })
}

/// Turns parsed page fields into a validated candidate, deriving source
/// signals through `classifier`.
pub fn build_candidate(
    story_url: &str,
    parsed: ParsedStoryPage,
    classifier: &dyn SourceClassifier,
) -> Result<StoryCandidate, AdapterError> {
    let slug = slug_from_story_url(story_url).ok_or_else(|| ContractError::MissingSlug {
        url: story_url.to_string(),
    })?;
    let title = parsed
        .title
        .clone()
        .ok_or_else(|| ContractError::MissingTitle { slug: slug.clone() })?;

    let mut candidate = StoryCandidate::new(slug.clone(), story_url, title);
    let mut buckets = Vec::new();
    for link in parsed.source_links {
        let Some(host) = host_of(&link.url) else {
            continue;
        };
        let signals = classifier.classify(&host);
        buckets.push(signals.bias());
        candidate.sources.push(SourceCandidate {
            outlet: OutletDraft::new(outlet_name_from_host(&host), Some(format!("https://{host}"))),
            url: link.url,
            excerpt: link.text,
            published_at: None,
            paywall: signals.paywall,
            locality: signals.locality,
            is_wire_service: is_wire_service(&host),
            bias_rating: signals.bias_rating,
            factuality: signals.factuality,
            ownership: Some(signals.ownership),
            signals_synthetic: signals.synthetic,
        });
    }

    candidate.bias = BiasDistribution::from_buckets(buckets);
    candidate.is_blindspot = candidate
        .bias
        .dominant()
        .is_some_and(|(_, share)| share >= BLINDSPOT_SHARE);
    let local_text = format!(
        "{} {}",
        candidate.title,
        parsed.summary.as_deref().unwrap_or_default()
    );
    candidate.is_local = is_local_text(&local_text);
    candidate.is_trending = is_trending(&slug);
    candidate.original_reporting_pct = StoryCandidate::compute_original_reporting_pct(&candidate.sources);

    candidate.dek = parsed.dek;
    candidate.author = parsed.author;
    candidate.summary = parsed.summary;
    candidate.topic = parsed.topic;
    candidate.location = parsed.location;
    candidate.image_url = Some(parsed.image_url);
    candidate.tags = parsed.tags;
    candidate.published_at = parsed.published_at;
    candidate.updated_at = parsed.updated_at.or(parsed.published_at);

    candidate.validate()?;
    Ok(candidate)
}

/// Fetches story landing pages over plain HTTP and builds candidates.
pub struct StoryEnricher {
    fetcher: Arc<HttpFetcher>,
    classifier: Arc<dyn SourceClassifier>,
}

impl StoryEnricher {
    pub fn new(fetcher: Arc<HttpFetcher>, classifier: Arc<dyn SourceClassifier>) -> Self {
        Self {
            fetcher,
            classifier,
        }
    }

    pub async fn enrich_story(&self, story_url: &str) -> Result<StoryCandidate, AdapterError> {
        let page_url =
            Url::parse(story_url).map_err(|_| AdapterError::InvalidUrl(story_url.to_string()))?;
        let span = info_span!("enrich_story", url = %story_url);
        async {
            let html = self
                .fetcher
                .fetch_text(story_url)
                .await
                .map_err(|source| AdapterError::Fetch {
                    url: story_url.to_string(),
                    source,
                })?;
            let parsed = parse_story_page(&html, &page_url)?;
            let candidate = build_candidate(story_url, parsed, self.classifier.as_ref())?;
            debug!(
                slug = %candidate.slug,
                sources = candidate.sources.len(),
                tags = candidate.tags.len(),
                "story enriched"
            );
            Ok(candidate)
        }
        .instrument(span)
        .await
    }
}
