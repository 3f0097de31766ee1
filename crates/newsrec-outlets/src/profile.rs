use std::sync::Arc;

use async_trait::async_trait;
use newsrec_core::{slugify, BiasRating, Factuality, OutletDraft};
use newsrec_storage::HttpFetcher;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::ReconcileError;

const BIAS_LABELS: &[&str] = &["bias rating", "media bias", "bias"];
const FACTUALITY_LABELS: &[&str] = &["factuality", "factual reporting", "reliability"];
const OWNERSHIP_LABELS: &[&str] = &["ownership", "owned by", "owner"];
const COUNTRY_LABELS: &[&str] = &["country", "headquarters"];
const FOUNDED_LABELS: &[&str] = &["founded", "established"];

const LOCKED_OWNERSHIP_PHRASES: &[&str] = &[
    "subscribe to",
    "upgrade to",
    "unlock",
    "premium members",
    "sign in to see",
    "log in to see",
    "available to members",
];

const SOCIAL_HOSTS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "youtube.com",
    "linkedin.com",
    "tiktok.com",
    "threads.net",
    "wikipedia.org",
    "apple.com",
    "google.com",
];

/// Outlet facts read off an aggregator profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileData {
    pub name: Option<String>,
    pub website_url: Option<String>,
    pub logo_url: Option<String>,
    pub bias_rating: BiasRating,
    pub factuality: Factuality,
    pub ownership: Option<String>,
    pub country: Option<String>,
    pub founded_year: Option<i32>,
}

impl ProfileData {
    pub fn to_draft(&self, base: &OutletDraft, profile_url: &str) -> OutletDraft {
        let mut draft = OutletDraft {
            name: base.name.clone(),
            slug: base.slug.clone(),
            website_url: self.website_url.clone(),
            profile_url: Some(profile_url.to_string()),
            logo_url: self.logo_url.clone(),
            bias_rating: self.bias_rating,
            factuality: self.factuality,
            ownership: self.ownership.clone(),
            country: self.country.clone(),
            founded_year: self.founded_year,
            ..OutletDraft::default()
        };
        draft.normalize();
        draft
    }
}

/// Ownership text that is really a paywall prompt.
pub fn is_locked_ownership(text: &str) -> bool {
    let lower = text.to_lowercase();
    LOCKED_OWNERSHIP_PHRASES.iter().any(|p| lower.contains(p))
}

/// The draft's own profile URL, or one derived from `base` and the slug.
pub fn profile_url_for(draft: &OutletDraft, base: Option<&str>) -> Option<String> {
    if let Some(url) = draft.profile_url.as_deref().filter(|u| !u.trim().is_empty()) {
        return Some(url.to_string());
    }
    let base = base?.trim_end_matches('/');
    let slug = if draft.slug.is_empty() {
        slugify(&draft.name)
    } else {
        draft.slug.clone()
    };
    if slug.is_empty() {
        return None;
    }
    Some(format!("{base}/source/{slug}"))
}

fn text_nodes(document: &Html) -> Vec<String> {
    document
        .root_element()
        .text()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Finds `Label: value` in one node or `Label` followed by a value node.
fn labeled_value(nodes: &[String], labels: &[&str]) -> Option<String> {
    for (i, node) in nodes.iter().enumerate() {
        let lower = node.to_lowercase();
        for label in labels {
            if lower.trim_end_matches(':').trim() == *label {
                if let Some(next) = nodes.get(i + 1) {
                    return Some(next.trim_start_matches(':').trim().to_string());
                }
            }
            if let Some(rest) = lower.strip_prefix(label) {
                if let Some(value) = rest.trim_start().strip_prefix(':') {
                    let offset = node.len().saturating_sub(value.len());
                    let value = node.get(offset..).unwrap_or(value).trim();
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

fn json_ld_objects(document: &Html) -> Vec<Value> {
    let Ok(sel) = Selector::parse(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
            debug!("skipping unparseable JSON-LD block");
            continue;
        };
        let mut stack = vec![value];
        while let Some(value) = stack.pop() {
            match value {
                Value::Array(items) => stack.extend(items),
                Value::Object(mut map) => {
                    if let Some(graph) = map.remove("@graph") {
                        stack.push(graph);
                    }
                    out.push(Value::Object(map));
                }
                _ => {}
            }
        }
    }
    out
}

fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(obj) => obj
            .get("url")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn is_social(host: &str) -> bool {
    SOCIAL_HOSTS
        .iter()
        .any(|s| host == *s || host.ends_with(&format!(".{s}")))
}

fn first_external_link(document: &Html, page_url: &Url) -> Option<String> {
    let sel = Selector::parse("a[href]").ok()?;
    let own = newsrec_core::host_of(page_url.as_str());
    document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| page_url.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .find(|u| {
            let host = newsrec_core::host_of(u.as_str());
            host.is_some() && host != own && !host.as_deref().is_some_and(is_social)
        })
        .map(|u| u.to_string())
}

fn parse_year(text: &str) -> Option<i32> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|chunk| chunk.len() == 4)
        .and_then(|y| y.parse().ok())
        .filter(|y| (1600..=2100).contains(y))
}

pub fn parse_profile_page(html: &str, page_url: &Url) -> ProfileData {
    let document = Html::parse_document(html);
    let nodes = text_nodes(&document);

    let mut data = ProfileData {
        bias_rating: labeled_value(&nodes, BIAS_LABELS)
            .map(|v| BiasRating::from_label(&v))
            .unwrap_or_default(),
        factuality: labeled_value(&nodes, FACTUALITY_LABELS)
            .map(|v| Factuality::from_label(&v))
            .unwrap_or_default(),
        ownership: labeled_value(&nodes, OWNERSHIP_LABELS).filter(|v| {
            let locked = is_locked_ownership(v);
            if locked {
                debug!(text = %v, "discarding locked ownership text");
            }
            !locked && newsrec_core::is_known_text(v)
        }),
        country: labeled_value(&nodes, COUNTRY_LABELS).filter(|v| newsrec_core::is_known_text(v)),
        founded_year: labeled_value(&nodes, FOUNDED_LABELS).and_then(|v| parse_year(&v)),
        ..ProfileData::default()
    };

    let objects = json_ld_objects(&document);
    let org = objects
        .iter()
        .find(|o| {
            o.get("@type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.contains("Organization"))
        })
        .or_else(|| objects.first());
    if let Some(org) = org {
        data.name = json_str(org, "name");
        data.website_url = json_str(org, "url")
            .or_else(|| json_str(org, "sameAs"))
            .filter(|u| newsrec_core::host_of(u) != newsrec_core::host_of(page_url.as_str()));
        data.logo_url = json_str(org, "logo").or_else(|| json_str(org, "image"));
        if data.founded_year.is_none() {
            data.founded_year = json_str(org, "foundingDate").and_then(|d| parse_year(&d));
        }
    }
    if data.website_url.is_none() {
        data.website_url = first_external_link(&document, page_url);
    }
    data
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    /// `Ok(None)` when the profile page does not exist.
    async fn fetch_profile(&self, profile_url: &str) -> Result<Option<ProfileData>, ReconcileError>;
}

pub struct HttpProfileLookup {
    fetcher: Arc<HttpFetcher>,
}

impl HttpProfileLookup {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ProfileLookup for HttpProfileLookup {
    async fn fetch_profile(&self, profile_url: &str) -> Result<Option<ProfileData>, ReconcileError> {
        let page_url = Url::parse(profile_url).map_err(|e| ReconcileError::parse(profile_url, e))?;
        match self.fetcher.fetch_text(profile_url).await {
            Ok(html) => Ok(Some(parse_profile_page(&html, &page_url))),
            Err(err) if err.status() == Some(404) => Ok(None),
            Err(source) => Err(ReconcileError::Fetch {
                url: profile_url.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = r#"
        <html><head>
          <script type="application/ld+json">
            {"@context":"https://schema.org","@graph":[
              {"@type":"WebPage","name":"Reuters news source profile"},
              {"@type":"NewsMediaOrganization","name":"Reuters","url":"https://www.reuters.com",
               "logo":{"@type":"ImageObject","url":"https://cdn.site.test/logos/reuters.png"}}
            ]}
          </script>
        </head><body>
          <dl>
            <dt>Bias Rating</dt><dd>Center</dd>
            <dt>Factuality</dt><dd>Very High</dd>
          </dl>
          <p>Ownership: Thomson Reuters Corporation</p>
          <p>Country: <span>United Kingdom</span></p>
          <a href="https://twitter.com/reuters">Twitter</a>
          <a href="https://www.reuters.com/">Website</a>
        </body></html>
    "#;

    fn url() -> Url {
        Url::parse("https://site.test/source/reuters").unwrap()
    }

    #[test]
    fn labeled_fields_and_json_ld_are_read() {
        let data = parse_profile_page(PROFILE, &url());
        assert_eq!(data.bias_rating, BiasRating::Center);
        assert_eq!(data.factuality, Factuality::VeryHigh);
        assert_eq!(data.ownership.as_deref(), Some("Thomson Reuters Corporation"));
        assert_eq!(data.country.as_deref(), Some("United Kingdom"));
        assert_eq!(data.name.as_deref(), Some("Reuters"));
        assert_eq!(data.website_url.as_deref(), Some("https://www.reuters.com"));
        assert_eq!(data.logo_url.as_deref(), Some("https://cdn.site.test/logos/reuters.png"));
    }

    #[test]
    fn locked_ownership_is_discarded_and_website_falls_back_to_first_external_link() {
        let html = r#"
            <p>Ownership: Subscribe to Premium to unlock ownership data</p>
            <a href="/about">About</a>
            <a href="https://facebook.com/paper">fb</a>
            <a href="https://paper.test/">Visit</a>
        "#;
        let data = parse_profile_page(html, &url());
        assert_eq!(data.ownership, None);
        assert_eq!(data.website_url.as_deref(), Some("https://paper.test/"));
        assert_eq!(data.bias_rating, BiasRating::Unknown);
    }

    #[test]
    fn profile_urls_are_derived_from_slug() {
        let mut draft = OutletDraft::new("The Daily Planet", None);
        assert_eq!(
            profile_url_for(&draft, Some("https://site.test/")).as_deref(),
            Some("https://site.test/source/the-daily-planet")
        );
        assert_eq!(profile_url_for(&draft, None), None);
        draft.profile_url = Some("https://site.test/source/planet".into());
        assert_eq!(
            profile_url_for(&draft, None).as_deref(),
            Some("https://site.test/source/planet")
        );
    }
}
