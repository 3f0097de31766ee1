//! Core domain model for newsrec: stories, outlets, archive entries and run records.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsrec-core";

/// Hours after which a `not_found` archive entry may be looked up again.
pub const NOT_FOUND_RETRY_AFTER_HOURS: i64 = 24;

/// Hosts treated as wire services when computing original-reporting share.
pub const WIRE_SERVICE_HOSTS: &[&str] = &["apnews.com", "reuters.com", "afp.com", "upi.com"];

/// True when a free-text field carries real data rather than a placeholder.
pub fn is_known_text(value: &str) -> bool {
    let v = value.trim();
    !(v.is_empty()
        || v.eq_ignore_ascii_case("unknown")
        || v.eq_ignore_ascii_case("unlabeled")
        || v.eq_ignore_ascii_case("n/a"))
}

/// A value that may be "unknown" and can be filled by a lower-confidence source.
pub trait Fillable {
    fn is_missing(&self) -> bool;
}

impl Fillable for Option<String> {
    fn is_missing(&self) -> bool {
        self.as_deref().map(|v| !is_known_text(v)).unwrap_or(true)
    }
}

impl Fillable for Option<i32> {
    fn is_missing(&self) -> bool {
        self.is_none()
    }
}

/// Fill-only-if-unknown: `candidate` replaces `target` only when `target` is
/// missing and `candidate` is not. Returns whether the target changed.
pub fn fill_if_missing<T: Fillable>(target: &mut T, candidate: T) -> bool {
    if target.is_missing() && !candidate.is_missing() {
        *target = candidate;
        true
    } else {
        false
    }
}

fn normalize_label(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    Left,
    Center,
    Right,
    #[default]
    Unknown,
}

impl Bias {
    pub const BUCKETS: [Bias; 3] = [Bias::Left, Bias::Center, Bias::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Center => "center",
            Self::Right => "right",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        BiasRating::from_label(label).bucket()
    }
}

impl Fillable for Bias {
    fn is_missing(&self) -> bool {
        *self == Bias::Unknown
    }
}

/// Seven-point bias scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BiasRating {
    FarLeft,
    Left,
    LeanLeft,
    Center,
    LeanRight,
    Right,
    FarRight,
    #[default]
    Unknown,
}

impl BiasRating {
    pub const SCALE: [BiasRating; 7] = [
        BiasRating::FarLeft,
        BiasRating::Left,
        BiasRating::LeanLeft,
        BiasRating::Center,
        BiasRating::LeanRight,
        BiasRating::Right,
        BiasRating::FarRight,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FarLeft => "far_left",
            Self::Left => "left",
            Self::LeanLeft => "lean_left",
            Self::Center => "center",
            Self::LeanRight => "lean_right",
            Self::Right => "right",
            Self::FarRight => "far_right",
            Self::Unknown => "unknown",
        }
    }

    /// Parses the labels used by the public catalogs and the aggregator profile pages.
    pub fn from_label(label: &str) -> Self {
        match normalize_label(label).as_str() {
            "far left" | "extreme left" | "far_left" => Self::FarLeft,
            "left" => Self::Left,
            "lean left" | "left center" | "center left" | "lean_left" => Self::LeanLeft,
            "center" | "centre" | "least biased" | "pro science" => Self::Center,
            "lean right" | "right center" | "center right" | "lean_right" => Self::LeanRight,
            "right" => Self::Right,
            "far right" | "extreme right" | "far_right" => Self::FarRight,
            other => {
                let squashed = other.replace(' ', "_");
                Self::SCALE
                    .into_iter()
                    .find(|r| r.as_str() == squashed)
                    .unwrap_or(Self::Unknown)
            }
        }
    }

    pub fn bucket(&self) -> Bias {
        match self {
            Self::FarLeft | Self::Left | Self::LeanLeft => Bias::Left,
            Self::Center => Bias::Center,
            Self::LeanRight | Self::Right | Self::FarRight => Bias::Right,
            Self::Unknown => Bias::Unknown,
        }
    }
}

impl Fillable for BiasRating {
    fn is_missing(&self) -> bool {
        *self == BiasRating::Unknown
    }
}

/// Five-point factuality scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Factuality {
    VeryHigh,
    High,
    Mixed,
    Low,
    VeryLow,
    #[default]
    Unknown,
}

impl Factuality {
    pub const SCALE: [Factuality; 5] = [
        Factuality::VeryHigh,
        Factuality::High,
        Factuality::Mixed,
        Factuality::Low,
        Factuality::VeryLow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VeryHigh => "very_high",
            Self::High => "high",
            Self::Mixed => "mixed",
            Self::Low => "low",
            Self::VeryLow => "very_low",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match normalize_label(label).as_str() {
            "very high" | "very_high" => Self::VeryHigh,
            "high" | "mostly factual" => Self::High,
            "mixed" => Self::Mixed,
            "low" => Self::Low,
            "very low" | "very_low" => Self::VeryLow,
            _ => Self::Unknown,
        }
    }
}

impl Fillable for Factuality {
    fn is_missing(&self) -> bool {
        *self == Factuality::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Paywall {
    None,
    Soft,
    Hard,
    #[default]
    Unknown,
}

impl Paywall {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    Local,
    National,
    International,
    #[default]
    Unknown,
}

impl Locality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::National => "national",
            Self::International => "international",
            Self::Unknown => "unknown",
        }
    }
}

/// Coarse ownership category derived from free-text ownership by keyword matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipCategory {
    Government,
    PrivateEquity,
    Telecom,
    MediaConglomerate,
    Independent,
    Individual,
    Corporation,
}

const OWNERSHIP_KEYWORDS: &[(OwnershipCategory, &[&str])] = &[
    (
        OwnershipCategory::Government,
        &[
            "government",
            "state-owned",
            "state owned",
            "public broadcaster",
            "ministry",
            "crown corporation",
            "publicly funded",
        ],
    ),
    (
        OwnershipCategory::PrivateEquity,
        &[
            "private equity",
            "capital management",
            "hedge fund",
            "investment fund",
            "alden global",
            "apollo global",
        ],
    ),
    (
        OwnershipCategory::Telecom,
        &["telecom", "telecommunications", "comcast", "at&t", "verizon", "cable"],
    ),
    (
        OwnershipCategory::MediaConglomerate,
        &[
            "media group",
            "conglomerate",
            "news corp",
            "broadcasting",
            "publishing",
            "gannett",
            "sinclair",
            "nexstar",
            "media company",
            "holdings",
        ],
    ),
    (
        OwnershipCategory::Independent,
        &[
            "independent",
            "nonprofit",
            "non-profit",
            "cooperative",
            "employee-owned",
            "trust",
        ],
    ),
    (
        OwnershipCategory::Individual,
        &["billionaire", "family", "individual", "privately held by"],
    ),
    (
        OwnershipCategory::Corporation,
        &["inc", "corp", "corporation", "company", "plc", "llc", "ltd", "gmbh"],
    ),
];

fn mentions(haystack: &str, needle: &str) -> bool {
    if needle.chars().all(|c| c.is_ascii_alphanumeric()) {
        haystack
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == needle)
    } else {
        haystack.contains(needle)
    }
}

impl OwnershipCategory {
    pub const ALL: [OwnershipCategory; 7] = [
        OwnershipCategory::Government,
        OwnershipCategory::PrivateEquity,
        OwnershipCategory::Telecom,
        OwnershipCategory::MediaConglomerate,
        OwnershipCategory::Independent,
        OwnershipCategory::Individual,
        OwnershipCategory::Corporation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::PrivateEquity => "private_equity",
            Self::Telecom => "telecom",
            Self::MediaConglomerate => "media_conglomerate",
            Self::Independent => "independent",
            Self::Individual => "individual",
            Self::Corporation => "corporation",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Government => "Government",
            Self::PrivateEquity => "Private Equity",
            Self::Telecom => "Telecom",
            Self::MediaConglomerate => "Media Conglomerates",
            Self::Independent => "Independent",
            Self::Individual => "Individual",
            Self::Corporation => "Corporation",
        }
    }

    pub fn classify(text: &str) -> Option<Self> {
        let lower = text.to_ascii_lowercase();
        OWNERSHIP_KEYWORDS
            .iter()
            .find(|(_, needles)| needles.iter().any(|n| mentions(&lower, n)))
            .map(|(category, _)| *category)
    }
}

/// Combines free-text ownership with a derived category: `"text (Category)"` when
/// both exist, the category label alone when the text is unknown.
pub fn label_ownership(text: Option<&str>, category: Option<OwnershipCategory>) -> Option<String> {
    let text = text.filter(|t| is_known_text(t)).map(str::trim);
    match (text, category) {
        (Some(t), Some(c)) if t.contains(&format!("({})", c.label())) => Some(t.to_string()),
        (Some(t), Some(c)) => Some(format!("{t} ({})", c.label())),
        (Some(t), None) => Some(t.to_string()),
        (None, Some(c)) => Some(c.label().to_string()),
        (None, None) => None,
    }
}

/// Lower-cased host without a leading `www.`.
pub fn host_of(raw_url: &str) -> Option<String> {
    let parsed = url::Url::parse(raw_url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Registrable domain of a host per the public suffix list
/// (`news.bbc.co.uk` -> `bbc.co.uk`). Falls back to the last two labels when
/// the host has no registrable part.
pub fn root_domain(host: &str) -> String {
    let host = host.trim_end_matches('.');
    if let Some(domain) = psl::domain_str(host) {
        return domain.to_string();
    }
    let labels = host.split('.').collect::<Vec<_>>();
    if labels.len() <= 2 {
        labels.join(".")
    } else {
        labels[labels.len() - 2..].join(".")
    }
}

pub fn is_wire_service(host: &str) -> bool {
    let root = root_domain(host);
    WIRE_SERVICE_HOSTS.iter().any(|h| *h == root)
}

pub fn slugify(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

/// Display name guessed from a host, e.g. `reuters.com` -> `Reuters`.
pub fn outlet_name_from_host(host: &str) -> String {
    let root = root_domain(host);
    let label = root.split('.').next().unwrap_or(&root);
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Stable id for a source article row, derived from its story and URL.
pub fn source_article_id(story_id: Uuid, url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{story_id}:{url}").as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutletField {
    Bias,
    BiasRating,
    Factuality,
    Ownership,
    Country,
    FoundedYear,
    Website,
    Logo,
}

/// Publisher record as known so far; every enrichment stage only fills gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutletDraft {
    pub name: String,
    pub slug: String,
    pub website_url: Option<String>,
    pub profile_url: Option<String>,
    pub logo_url: Option<String>,
    pub bias: Bias,
    pub bias_rating: BiasRating,
    pub factuality: Factuality,
    pub ownership: Option<String>,
    pub country: Option<String>,
    pub founded_year: Option<i32>,
    pub last_enriched_at: Option<DateTime<Utc>>,
}

impl OutletDraft {
    pub fn new(name: impl Into<String>, website_url: Option<String>) -> Self {
        let name = name.into();
        Self {
            slug: slugify(&name),
            name,
            website_url,
            ..Default::default()
        }
    }

    pub fn host(&self) -> Option<String> {
        self.website_url.as_deref().and_then(host_of)
    }

    pub fn missing_fields(&self) -> Vec<OutletField> {
        let mut out = Vec::new();
        if self.bias.is_missing() {
            out.push(OutletField::Bias);
        }
        if self.bias_rating.is_missing() {
            out.push(OutletField::BiasRating);
        }
        if self.factuality.is_missing() {
            out.push(OutletField::Factuality);
        }
        if self.ownership.is_missing() {
            out.push(OutletField::Ownership);
        }
        if self.country.is_missing() {
            out.push(OutletField::Country);
        }
        if self.founded_year.is_missing() {
            out.push(OutletField::FoundedYear);
        }
        if self.website_url.is_missing() {
            out.push(OutletField::Website);
        }
        if self.logo_url.is_missing() {
            out.push(OutletField::Logo);
        }
        out
    }

    pub fn is_missing(&self, field: OutletField) -> bool {
        self.missing_fields().contains(&field)
    }

    pub fn needs_enrichment(&self) -> bool {
        !self.missing_fields().is_empty()
    }

    /// Fills this draft's gaps from `other`, never touching known fields.
    pub fn fill_from(&mut self, other: &OutletDraft) -> Vec<OutletField> {
        let mut filled = Vec::new();
        if fill_if_missing(&mut self.bias_rating, other.bias_rating) {
            filled.push(OutletField::BiasRating);
        }
        if fill_if_missing(&mut self.bias, other.bias) {
            filled.push(OutletField::Bias);
        }
        if fill_if_missing(&mut self.factuality, other.factuality) {
            filled.push(OutletField::Factuality);
        }
        if fill_if_missing(&mut self.ownership, other.ownership.clone()) {
            filled.push(OutletField::Ownership);
        }
        if fill_if_missing(&mut self.country, other.country.clone()) {
            filled.push(OutletField::Country);
        }
        if fill_if_missing(&mut self.founded_year, other.founded_year) {
            filled.push(OutletField::FoundedYear);
        }
        if fill_if_missing(&mut self.website_url, other.website_url.clone()) {
            filled.push(OutletField::Website);
        }
        if fill_if_missing(&mut self.logo_url, other.logo_url.clone()) {
            filled.push(OutletField::Logo);
        }
        fill_if_missing(&mut self.profile_url, other.profile_url.clone());
        self.normalize();
        filled
    }

    /// Derives the 3-way bucket from the 7-point rating when only the rating is known.
    pub fn normalize(&mut self) {
        if self.slug.is_empty() {
            self.slug = slugify(&self.name);
        }
        fill_if_missing(&mut self.bias, self.bias_rating.bucket());
    }
}

/// Percentages of a story's tracked sources per bias bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct BiasDistribution {
    pub left: f64,
    pub center: f64,
    pub right: f64,
}

impl BiasDistribution {
    pub fn from_buckets(buckets: impl IntoIterator<Item = Bias>) -> Self {
        let (mut l, mut c, mut r) = (0u32, 0u32, 0u32);
        for bucket in buckets {
            match bucket {
                Bias::Left => l += 1,
                Bias::Center => c += 1,
                Bias::Right => r += 1,
                Bias::Unknown => {}
            }
        }
        let total = f64::from(l + c + r);
        if total == 0.0 {
            return Self::default();
        }
        Self {
            left: f64::from(l) * 100.0 / total,
            center: f64::from(c) * 100.0 / total,
            right: f64::from(r) * 100.0 / total,
        }
    }

    pub fn total(&self) -> f64 {
        self.left + self.center + self.right
    }

    pub fn dominant(&self) -> Option<(Bias, f64)> {
        if self.total() == 0.0 {
            return None;
        }
        [
            (Bias::Left, self.left),
            (Bias::Center, self.center),
            (Bias::Right, self.right),
        ]
        .into_iter()
        .fold(None, |best: Option<(Bias, f64)>, (bias, share)| match best {
            Some((_, best_share)) if best_share >= share => best,
            _ => Some((bias, share)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub url: String,
    pub outlet: OutletDraft,
    pub excerpt: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub paywall: Paywall,
    pub locality: Locality,
    pub is_wire_service: bool,
    #[serde(default)]
    pub bias_rating: BiasRating,
    #[serde(default)]
    pub factuality: Factuality,
    #[serde(default)]
    pub ownership: Option<OwnershipCategory>,
    /// Set when the per-source signals were synthesized rather than observed.
    pub signals_synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub occurred_at: Option<DateTime<Utc>>,
    pub headline: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodcastItem {
    pub title: String,
    pub url: String,
    pub duration_seconds: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderLink {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryGeo {
    pub latitude: f64,
    pub longitude: f64,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

/// Explicit story-to-story relation supplied by the candidate itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedRef {
    pub slug: String,
    pub reason: String,
}

/// Story as extracted from the aggregator, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryCandidate {
    pub slug: String,
    pub canonical_url: String,
    pub title: String,
    pub dek: Option<String>,
    pub author: Option<String>,
    pub summary: Option<String>,
    pub topic: Option<String>,
    pub location: Option<String>,
    pub image_url: Option<String>,
    pub tags: Vec<String>,
    pub sources: Vec<SourceCandidate>,
    pub bias: BiasDistribution,
    pub is_blindspot: bool,
    pub is_local: bool,
    pub is_trending: bool,
    pub original_reporting_pct: f64,
    pub homepage_rank: Option<i32>,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub broke_the_news_url: Option<String>,
    pub timeline: Vec<TimelineItem>,
    pub podcasts: Vec<PodcastItem>,
    pub reader_links: Vec<ReaderLink>,
    pub snapshot: Option<serde_json::Value>,
    pub geo: Option<StoryGeo>,
    pub related: Vec<RelatedRef>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("story candidate from {url} has no slug")]
    MissingSlug { url: String },
    #[error("story candidate {slug} has no title")]
    MissingTitle { slug: String },
    #[error("story candidate {slug} lists source {url} twice")]
    DuplicateSource { slug: String, url: String },
}

impl StoryCandidate {
    pub fn new(slug: impl Into<String>, canonical_url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            canonical_url: canonical_url.into(),
            title: title.into(),
            dek: None,
            author: None,
            summary: None,
            topic: None,
            location: None,
            image_url: None,
            tags: Vec::new(),
            sources: Vec::new(),
            bias: BiasDistribution::default(),
            is_blindspot: false,
            is_local: false,
            is_trending: false,
            original_reporting_pct: 0.0,
            homepage_rank: None,
            published_at: None,
            updated_at: None,
            broke_the_news_url: None,
            timeline: Vec::new(),
            podcasts: Vec::new(),
            reader_links: Vec::new(),
            snapshot: None,
            geo: None,
            related: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    /// Rejects candidates that must never be persisted.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.slug.trim().is_empty() {
            return Err(ContractError::MissingSlug {
                url: self.canonical_url.clone(),
            });
        }
        if self.title.trim().is_empty() {
            return Err(ContractError::MissingTitle {
                slug: self.slug.clone(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.url.as_str()) {
                return Err(ContractError::DuplicateSource {
                    slug: self.slug.clone(),
                    url: source.url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Share of sources that are not wire-service copies, in percent.
    pub fn compute_original_reporting_pct(sources: &[SourceCandidate]) -> f64 {
        if sources.is_empty() {
            return 0.0;
        }
        let original = sources.iter().filter(|s| !s.is_wire_service).count();
        original as f64 * 100.0 / sources.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Story,
    Topic,
    Outlet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Success,
    Blocked,
    NotFound,
    Fallback,
    Error,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Blocked => "blocked",
            Self::NotFound => "not_found",
            Self::Fallback => "fallback",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "blocked" => Some(Self::Blocked),
            "not_found" => Some(Self::NotFound),
            "fallback" => Some(Self::Fallback),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archive-host lookup, kept for auditability whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveAttempt {
    pub host: String,
    pub archive_url: String,
    pub status: ArchiveStatus,
    pub error: Option<String>,
    pub headline: Option<String>,
    pub paragraphs: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub original_url: String,
    pub status: ArchiveStatus,
    pub host: Option<String>,
    pub archive_url: Option<String>,
    pub headline: Option<String>,
    pub paragraphs: Vec<String>,
    pub attempts: Vec<ArchiveAttempt>,
    pub resolved_at: DateTime<Utc>,
}

pub fn archive_lookup_url(host: &str, original_url: &str) -> String {
    format!("https://{host}/{original_url}")
}

impl ArchiveEntry {
    /// `not_found` entries expire after a day; every other status is durable.
    pub fn is_reusable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ArchiveStatus::NotFound => {
                now - self.resolved_at < Duration::hours(NOT_FOUND_RETRY_AFTER_HOURS)
            }
            _ => true,
        }
    }

    /// Placeholder served when nothing has been resolved yet for a URL.
    pub fn fallback(original_url: &str, host: Option<&str>) -> Self {
        Self {
            original_url: original_url.to_string(),
            status: ArchiveStatus::Fallback,
            host: host.map(str::to_string),
            archive_url: host.map(|h| archive_lookup_url(h, original_url)),
            headline: None,
            paragraphs: Vec::new(),
            attempts: Vec::new(),
            resolved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Retry,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Retry => "retry",
            Self::Failed => "failed",
        }
    }
}

/// Append-only audit record of one orchestrator attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub attempt: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub route_count: i64,
    pub link_count: i64,
    pub story_count: i64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn placeholders_are_not_known_text() {
        assert!(!is_known_text(""));
        assert!(!is_known_text("  Unknown "));
        assert!(!is_known_text("unlabeled"));
        assert!(is_known_text("Thomson Reuters"));
    }

    #[test]
    fn fill_only_touches_missing_values() {
        let mut known = Some("Thomson Reuters".to_string());
        assert!(!fill_if_missing(&mut known, Some("Someone Else".to_string())));
        assert_eq!(known.as_deref(), Some("Thomson Reuters"));

        let mut placeholder = Some("unknown".to_string());
        assert!(fill_if_missing(&mut placeholder, Some("Nexstar".to_string())));
        assert_eq!(placeholder.as_deref(), Some("Nexstar"));

        let mut rating = BiasRating::Unknown;
        assert!(!fill_if_missing(&mut rating, BiasRating::Unknown));
        assert!(fill_if_missing(&mut rating, BiasRating::LeanLeft));
    }

    #[test]
    fn outlet_fill_is_idempotent_on_complete_records() {
        let mut complete = OutletDraft {
            name: "Reuters".into(),
            slug: "reuters".into(),
            website_url: Some("https://www.reuters.com".into()),
            profile_url: None,
            logo_url: Some("https://logo.example/reuters.png".into()),
            bias: Bias::Center,
            bias_rating: BiasRating::Center,
            factuality: Factuality::VeryHigh,
            ownership: Some("Thomson Reuters (Corporation)".into()),
            country: Some("United Kingdom".into()),
            founded_year: Some(1851),
            last_enriched_at: None,
        };
        let before = complete.clone();
        let noisy = OutletDraft {
            bias: Bias::Left,
            bias_rating: BiasRating::FarLeft,
            factuality: Factuality::Low,
            ownership: Some("Unrelated Holdings".into()),
            country: Some("Nowhere".into()),
            founded_year: Some(2001),
            ..OutletDraft::new("Reuters", Some("https://elsewhere.example".into()))
        };
        assert!(complete.fill_from(&noisy).is_empty());
        assert_eq!(complete, before);
        assert!(!complete.needs_enrichment());
    }

    #[test]
    fn bias_bucket_derives_from_rating() {
        let mut draft = OutletDraft::new("Example Daily", None);
        draft.bias_rating = BiasRating::from_label("Lean Right");
        draft.normalize();
        assert_eq!(draft.bias, Bias::Right);
        assert_eq!(BiasRating::from_label("left-center"), BiasRating::LeanLeft);
        assert_eq!(BiasRating::from_label("Least Biased").bucket(), Bias::Center);
        assert_eq!(Factuality::from_label("Mostly Factual"), Factuality::High);
        assert_eq!(Factuality::from_label("VERY HIGH"), Factuality::VeryHigh);
    }

    #[test]
    fn ownership_categories_follow_keywords() {
        assert_eq!(
            OwnershipCategory::classify("Owned by the federal government"),
            Some(OwnershipCategory::Government)
        );
        assert_eq!(
            OwnershipCategory::classify("Alden Global Capital"),
            Some(OwnershipCategory::PrivateEquity)
        );
        assert_eq!(
            OwnershipCategory::classify("Thomson Reuters Corp"),
            Some(OwnershipCategory::Corporation)
        );
        assert_eq!(OwnershipCategory::classify("Incredible"), None);
        assert_eq!(
            label_ownership(Some("Nexstar Media Group"), Some(OwnershipCategory::MediaConglomerate)).as_deref(),
            Some("Nexstar Media Group (Media Conglomerates)")
        );
        assert_eq!(
            label_ownership(Some("unknown"), Some(OwnershipCategory::Independent)).as_deref(),
            Some("Independent")
        );
    }

    #[test]
    fn host_helpers_strip_www_and_take_root() {
        assert_eq!(host_of("https://www.Reuters.com/world/x").as_deref(), Some("reuters.com"));
        assert_eq!(root_domain("edition.cnn.com"), "cnn.com");
        assert_eq!(root_domain("news.bbc.co.uk"), "bbc.co.uk");
        assert_eq!(root_domain("www.smh.com.au"), "smh.com.au");
        assert_ne!(root_domain("dailyexample.co.uk"), root_domain("bbc.co.uk"));
        assert!(is_wire_service("apnews.com"));
        assert_eq!(outlet_name_from_host("www.reuters.com"), "Reuters");
        assert_eq!(slugify("The New York Times"), "the-new-york-times");
    }

    #[test]
    fn not_found_entries_expire_after_a_day() {
        let mut entry = ArchiveEntry::fallback("https://example.com/a", Some("archive.ph"));
        entry.status = ArchiveStatus::NotFound;
        entry.resolved_at = ts(0);
        assert!(entry.is_reusable(ts(23)));
        assert!(!entry.is_reusable(ts(0) + Duration::hours(25)));

        entry.status = ArchiveStatus::Blocked;
        assert!(entry.is_reusable(ts(0) + Duration::days(30)));
    }

    #[test]
    fn bias_distribution_sums_to_hundred() {
        let dist = BiasDistribution::from_buckets([Bias::Left, Bias::Left, Bias::Right, Bias::Unknown]);
        assert!((dist.total() - 100.0).abs() < 1e-9);
        let (dominant, share) = dist.dominant().unwrap();
        assert_eq!(dominant, Bias::Left);
        assert!(share > 66.0);
        assert!(BiasDistribution::from_buckets([]).dominant().is_none());
    }

    #[test]
    fn candidate_without_title_is_rejected() {
        let story = StoryCandidate::new("city-budget", "https://site.example/story/city-budget", " ");
        assert_eq!(
            story.validate(),
            Err(ContractError::MissingTitle {
                slug: "city-budget".into()
            })
        );
        let story = StoryCandidate::new("", "https://site.example/story/", "Title");
        assert!(matches!(story.validate(), Err(ContractError::MissingSlug { .. })));
    }
}
