//! Knowledge-graph entity search and scored disambiguation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use newsrec_core::{host_of, root_domain};
use newsrec_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strsim::jaro_winkler;
use tracing::debug;
use url::Url;

use crate::catalog::normalize_outlet_name;
use crate::ReconcileError;

pub const MAX_CANDIDATES: usize = 12;
pub const MEDIA_DESCRIPTION_WEIGHT: i32 = 4;
pub const NAME_MATCH_WEIGHT: i32 = 5;
pub const EXACT_HOST_WEIGHT: i32 = 18;
pub const ROOT_DOMAIN_WEIGHT: i32 = 13;
pub const NO_HOST_NO_NAME_PENALTY: i32 = -10;
pub const NO_MEDIA_NO_HOST_PENALTY: i32 = -6;
pub const ACCEPT_THRESHOLD: i32 = 7;

const NAME_SIMILARITY: f64 = 0.93;
const NAME_STOPWORDS: &[&str] = &["the", "news", "media", "network", "group", "online"];
const MEDIA_TERMS: &[&str] = &[
    "news",
    "newspaper",
    "media",
    "broadcaster",
    "broadcasting",
    "magazine",
    "journal",
    "television",
    "radio",
    "publication",
    "publisher",
    "press agency",
    "tabloid",
];

const WEBSITE_PROP: &str = "P856";
const OWNER_PROP: &str = "P127";
const COUNTRY_PROP: &str = "P17";
const INCEPTION_PROP: &str = "P571";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KgCandidate {
    pub id: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub websites: Vec<String>,
    pub owner_ids: Vec<String>,
    pub country_ids: Vec<String>,
    pub inception_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSignals {
    pub name: String,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub score: i32,
    pub media_description: bool,
    pub name_match: bool,
    pub exact_host: bool,
    pub root_domain_match: bool,
}

impl ScoreBreakdown {
    pub fn has_host_evidence(&self) -> bool {
        self.exact_host || self.root_domain_match
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KgMatch {
    pub entity_id: String,
    pub label: Option<String>,
    pub description: Option<String>,
    pub score: i32,
    pub website_url: Option<String>,
    pub ownership: Option<String>,
    pub country: Option<String>,
    pub founded_year: Option<i32>,
}

fn strip_stopwords(name: &str) -> String {
    name.split_whitespace()
        .filter(|w| !NAME_STOPWORDS.contains(&w.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Search strings, most specific first: the name without news/media
/// stopwords, the root-domain token, then the bare host.
pub fn derive_queries(name: &str, host: Option<&str>) -> Vec<String> {
    let mut queries = Vec::new();
    let stripped = strip_stopwords(name);
    queries.push(if stripped.is_empty() {
        name.trim().to_string()
    } else {
        stripped
    });
    if let Some(host) = host {
        let root = root_domain(host);
        if let Some(token) = root.split('.').next() {
            queries.push(token.to_string());
        }
        queries.push(host.to_string());
    }

    let mut seen = HashSet::new();
    queries
        .into_iter()
        .filter(|q| !q.trim().is_empty())
        .filter(|q| seen.insert(q.to_lowercase()))
        .collect()
}

fn names_match(candidate: &str, target: &str) -> bool {
    let a = normalize_outlet_name(candidate);
    let b = normalize_outlet_name(target);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b || normalize_outlet_name(&strip_stopwords(candidate)) == normalize_outlet_name(&strip_stopwords(target)) {
        return true;
    }
    jaro_winkler(&a, &b) >= NAME_SIMILARITY
}

fn is_media_description(description: &str) -> bool {
    let lower = description.to_lowercase();
    MEDIA_TERMS.iter().any(|t| lower.contains(t))
}

pub fn score_candidate(candidate: &KgCandidate, target: &TargetSignals) -> ScoreBreakdown {
    let mut b = ScoreBreakdown {
        media_description: candidate
            .description
            .as_deref()
            .is_some_and(is_media_description),
        name_match: candidate
            .label
            .iter()
            .chain(candidate.aliases.iter())
            .any(|l| names_match(l, &target.name)),
        ..ScoreBreakdown::default()
    };

    if let Some(target_host) = target.host.as_deref() {
        let hosts = candidate
            .websites
            .iter()
            .filter_map(|w| host_of(w))
            .collect::<Vec<_>>();
        if hosts.iter().any(|h| h == target_host) {
            b.exact_host = true;
        } else if hosts.iter().any(|h| root_domain(h) == root_domain(target_host)) {
            b.root_domain_match = true;
        }
    }

    if b.media_description {
        b.score += MEDIA_DESCRIPTION_WEIGHT;
    }
    if b.name_match {
        b.score += NAME_MATCH_WEIGHT;
    }
    if b.exact_host {
        b.score += EXACT_HOST_WEIGHT;
    } else if b.root_domain_match {
        b.score += ROOT_DOMAIN_WEIGHT;
    }
    if !b.has_host_evidence() && !b.name_match {
        b.score += NO_HOST_NO_NAME_PENALTY;
    }
    if !b.has_host_evidence() && !b.media_description {
        b.score += NO_MEDIA_NO_HOST_PENALTY;
    }
    b
}

/// Host evidence, or a name match backed by a media description, plus the
/// minimum score.
pub fn accept_candidate(b: &ScoreBreakdown) -> bool {
    let evidence = b.has_host_evidence() || (b.name_match && b.media_description);
    evidence && b.score >= ACCEPT_THRESHOLD
}

/// Highest-scoring accepted candidate; earlier candidates win ties.
pub fn choose_best<'a>(
    candidates: &'a [KgCandidate],
    target: &TargetSignals,
) -> Option<(&'a KgCandidate, ScoreBreakdown)> {
    let mut best: Option<(&KgCandidate, ScoreBreakdown)> = None;
    for candidate in candidates {
        let b = score_candidate(candidate, target);
        debug!(id = %candidate.id, label = ?candidate.label, score = b.score, "scored entity");
        if !accept_candidate(&b) {
            continue;
        }
        match &best {
            Some((_, current)) if current.score >= b.score => {}
            _ => best = Some((candidate, b)),
        }
    }
    best
}

#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ReconcileError>;
    async fn entities(&self, ids: &[String]) -> Result<Vec<KgCandidate>, ReconcileError>;
    async fn labels(&self, ids: &[String]) -> Result<HashMap<String, String>, ReconcileError>;
}

/// Searches, scores and, on acceptance, resolves owner/country labels in one bulk call.
pub async fn find_entity(kg: &dyn KnowledgeGraph, target: &TargetSignals) -> Result<Option<KgMatch>, ReconcileError> {
    let mut ids: Vec<String> = Vec::new();
    for query in derive_queries(&target.name, target.host.as_deref()) {
        if ids.len() >= MAX_CANDIDATES {
            break;
        }
        for id in kg.search(&query, MAX_CANDIDATES).await? {
            if ids.len() < MAX_CANDIDATES && !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if ids.is_empty() {
        return Ok(None);
    }

    let candidates = kg.entities(&ids).await?;
    let Some((best, breakdown)) = choose_best(&candidates, target) else {
        debug!(name = %target.name, candidates = candidates.len(), "no entity accepted");
        return Ok(None);
    };

    let mut label_ids = best.owner_ids.clone();
    label_ids.extend(best.country_ids.iter().cloned());
    let labels = if label_ids.is_empty() {
        HashMap::new()
    } else {
        kg.labels(&label_ids).await?
    };
    let owners = best
        .owner_ids
        .iter()
        .filter_map(|id| labels.get(id).cloned())
        .collect::<Vec<_>>();

    Ok(Some(KgMatch {
        entity_id: best.id.clone(),
        label: best.label.clone(),
        description: best.description.clone(),
        score: breakdown.score,
        website_url: best.websites.first().cloned(),
        ownership: (!owners.is_empty()).then(|| owners.join(", ")),
        country: best.country_ids.iter().find_map(|id| labels.get(id).cloned()),
        founded_year: best.inception_year,
    }))
}

pub struct WikidataClient {
    fetcher: Arc<HttpFetcher>,
    api_url: String,
    language: String,
}

impl WikidataClient {
    pub const DEFAULT_API_URL: &'static str = "https://www.wikidata.org/w/api.php";

    pub fn new(fetcher: Arc<HttpFetcher>, api_url: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_url: api_url.into(),
            language: "en".to_string(),
        }
    }

    fn url(&self, params: &[(&str, &str)]) -> Result<String, ReconcileError> {
        Url::parse_with_params(&self.api_url, params)
            .map(|u| u.to_string())
            .map_err(|e| ReconcileError::parse("wikidata api url", e))
    }

    async fn get(&self, url: String) -> Result<Value, ReconcileError> {
        self.fetcher
            .fetch_json::<Value>(&url)
            .await
            .map_err(|source| ReconcileError::Fetch { url, source })
    }
}

fn lang_value(entity: &Value, field: &str, lang: &str) -> Option<String> {
    entity
        .get(field)?
        .get(lang)?
        .get("value")?
        .as_str()
        .map(str::to_string)
}

fn claim_values<'a>(entity: &'a Value, prop: &str) -> Vec<&'a Value> {
    entity
        .get("claims")
        .and_then(|c| c.get(prop))
        .and_then(Value::as_array)
        .map(|claims| {
            claims
                .iter()
                .filter_map(|c| c.get("mainsnak")?.get("datavalue")?.get("value"))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_inception(value: &Value) -> Option<i32> {
    let time = value.get("time")?.as_str()?;
    let digits = time.trim_start_matches(['+', '-']);
    digits.split('-').next()?.parse().ok()
}

pub(crate) fn parse_entity(id: &str, entity: &Value, lang: &str) -> KgCandidate {
    KgCandidate {
        id: id.to_string(),
        label: lang_value(entity, "labels", lang),
        description: lang_value(entity, "descriptions", lang),
        aliases: entity
            .get("aliases")
            .and_then(|a| a.get(lang))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|a| a.get("value").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        websites: claim_values(entity, WEBSITE_PROP)
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        owner_ids: claim_values(entity, OWNER_PROP)
            .into_iter()
            .filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .collect(),
        country_ids: claim_values(entity, COUNTRY_PROP)
            .into_iter()
            .filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .collect(),
        inception_year: claim_values(entity, INCEPTION_PROP)
            .into_iter()
            .find_map(parse_inception),
    }
}

#[async_trait]
impl KnowledgeGraph for WikidataClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, ReconcileError> {
        let limit = limit.to_string();
        let url = self.url(&[
            ("action", "wbsearchentities"),
            ("search", query),
            ("language", &self.language),
            ("type", "item"),
            ("limit", &limit),
            ("format", "json"),
        ])?;
        let body = self.get(url).await?;
        Ok(body
            .get("search")
            .and_then(Value::as_array)
            .map(|hits| {
                hits.iter()
                    .filter_map(|h| h.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn entities(&self, ids: &[String]) -> Result<Vec<KgCandidate>, ReconcileError> {
        let joined = ids.join("|");
        let url = self.url(&[
            ("action", "wbgetentities"),
            ("ids", &joined),
            ("props", "labels|descriptions|aliases|claims"),
            ("languages", &self.language),
            ("format", "json"),
        ])?;
        let body = self.get(url).await?;
        let entities = body.get("entities").and_then(Value::as_object);
        // Keep search order; the response map is unordered.
        Ok(ids
            .iter()
            .filter_map(|id| entities.and_then(|e| e.get(id)).map(|v| parse_entity(id, v, &self.language)))
            .collect())
    }

    async fn labels(&self, ids: &[String]) -> Result<HashMap<String, String>, ReconcileError> {
        let joined = ids.join("|");
        let url = self.url(&[
            ("action", "wbgetentities"),
            ("ids", &joined),
            ("props", "labels"),
            ("languages", &self.language),
            ("format", "json"),
        ])?;
        let body = self.get(url).await?;
        Ok(body
            .get("entities")
            .and_then(Value::as_object)
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|(id, e)| lang_value(e, "labels", &self.language).map(|l| (id.clone(), l)))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(label: &str, description: &str, websites: &[&str]) -> KgCandidate {
        KgCandidate {
            id: format!("Q-{label}"),
            label: Some(label.to_string()),
            description: Some(description.to_string()),
            websites: websites.iter().map(|w| w.to_string()).collect(),
            ..KgCandidate::default()
        }
    }

    fn target(name: &str, host: Option<&str>) -> TargetSignals {
        TargetSignals {
            name: name.to_string(),
            host: host.map(str::to_string),
        }
    }

    #[test]
    fn queries_strip_stopwords_and_add_host_tokens() {
        assert_eq!(
            derive_queries("The Reuters News", Some("uk.reuters.com")),
            vec!["Reuters", "uk.reuters.com"]
        );
        assert_eq!(derive_queries("News", None), vec!["News"]);
    }

    #[test]
    fn exact_host_outscores_root_domain() {
        let t = target("Reuters", Some("reuters.com"));
        let exact = score_candidate(&candidate("Reuters", "international news agency", &["https://www.reuters.com"]), &t);
        assert_eq!(exact.score, MEDIA_DESCRIPTION_WEIGHT + NAME_MATCH_WEIGHT + EXACT_HOST_WEIGHT);
        let root = score_candidate(&candidate("Reuters", "company", &["https://agency.reuters.com"]), &t);
        assert!(root.root_domain_match && !root.exact_host);
        assert_eq!(root.score, NAME_MATCH_WEIGHT + ROOT_DOMAIN_WEIGHT);
        assert!(accept_candidate(&exact) && accept_candidate(&root));
    }

    #[test]
    fn shared_public_suffix_is_not_host_evidence() {
        let t = target("Daily Example", Some("dailyexample.co.uk"));
        let builder = candidate("Harbour Bridge Ltd", "construction company", &["https://bbc.co.uk"]);
        let b = score_candidate(&builder, &t);
        assert!(!b.root_domain_match && !b.exact_host);
        assert!(!accept_candidate(&b));
        assert_eq!(
            derive_queries("Daily Example", Some("dailyexample.co.uk")),
            vec!["Daily Example", "dailyexample", "dailyexample.co.uk"]
        );

        let sister = candidate("Daily Example", "british newspaper", &["https://news.dailyexample.co.uk"]);
        assert!(score_candidate(&sister, &t).root_domain_match);
    }

    #[test]
    fn generic_name_with_non_media_description_is_rejected() {
        let t = target("Phoenix", None);
        let bird = candidate("Phoenix", "mythological bird", &[]);
        let b = score_candidate(&bird, &t);
        assert_eq!(b.score, NAME_MATCH_WEIGHT + NO_MEDIA_NO_HOST_PENALTY);
        assert!(!accept_candidate(&b));
        assert!(choose_best(&[bird], &t).is_none());
    }

    #[test]
    fn name_and_media_description_is_enough_without_host() {
        let t = target("Phoenix New Times", None);
        let paper = candidate("Phoenix New Times", "alternative weekly newspaper", &[]);
        let b = score_candidate(&paper, &t);
        assert_eq!(b.score, MEDIA_DESCRIPTION_WEIGHT + NAME_MATCH_WEIGHT);
        assert!(accept_candidate(&b));
    }

    #[test]
    fn unrelated_candidate_takes_both_penalties() {
        let t = target("Reuters", Some("reuters.com"));
        let b = score_candidate(&candidate("Paris", "capital of France", &["https://paris.fr"]), &t);
        assert_eq!(b.score, NO_HOST_NO_NAME_PENALTY + NO_MEDIA_NO_HOST_PENALTY);
    }

    #[test]
    fn entity_claims_are_parsed() {
        let entity = json!({
            "labels": {"en": {"value": "Reuters"}},
            "descriptions": {"en": {"value": "news agency"}},
            "aliases": {"en": [{"value": "Reuters News"}]},
            "claims": {
                "P856": [{"mainsnak": {"datavalue": {"value": "https://www.reuters.com/"}}}],
                "P127": [{"mainsnak": {"datavalue": {"value": {"id": "Q1"}}}}],
                "P17": [{"mainsnak": {"datavalue": {"value": {"id": "Q145"}}}}],
                "P571": [{"mainsnak": {"datavalue": {"value": {"time": "+1851-10-01T00:00:00Z"}}}}]
            }
        });
        let parsed = parse_entity("Q130879", &entity, "en");
        assert_eq!(parsed.label.as_deref(), Some("Reuters"));
        assert_eq!(parsed.aliases, vec!["Reuters News"]);
        assert_eq!(parsed.websites, vec!["https://www.reuters.com/"]);
        assert_eq!(parsed.owner_ids, vec!["Q1"]);
        assert_eq!(parsed.country_ids, vec!["Q145"]);
        assert_eq!(parsed.inception_year, Some(1851));
    }

    struct FakeGraph {
        candidates: Vec<KgCandidate>,
    }

    #[async_trait]
    impl KnowledgeGraph for FakeGraph {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, ReconcileError> {
            Ok(self.candidates.iter().map(|c| c.id.clone()).collect())
        }

        async fn entities(&self, ids: &[String]) -> Result<Vec<KgCandidate>, ReconcileError> {
            Ok(self
                .candidates
                .iter()
                .filter(|c| ids.contains(&c.id))
                .cloned()
                .collect())
        }

        async fn labels(&self, ids: &[String]) -> Result<HashMap<String, String>, ReconcileError> {
            Ok(ids
                .iter()
                .map(|id| (id.clone(), format!("label-{id}")))
                .collect())
        }
    }

    #[tokio::test]
    async fn find_entity_resolves_owner_and_country_labels() {
        let mut best = candidate("Reuters", "news agency", &["https://www.reuters.com"]);
        best.owner_ids = vec!["Q1".into()];
        best.country_ids = vec!["Q145".into()];
        let graph = FakeGraph {
            candidates: vec![candidate("Reuters Plaza", "building", &[]), best],
        };
        let found = find_entity(&graph, &target("Reuters", Some("reuters.com")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.entity_id, "Q-Reuters");
        assert_eq!(found.ownership.as_deref(), Some("label-Q1"));
        assert_eq!(found.country.as_deref(), Some("label-Q145"));
    }
}
