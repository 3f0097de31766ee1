use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use newsrec_core::{
    is_known_text, label_ownership, Fillable, OutletDraft, OutletField, OwnershipCategory,
};
use newsrec_storage::{DiskCache, HttpFetcher, MemoCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::catalog::{normalize_outlet_name, CatalogLookup, PublicCatalog, CATALOG_TTL};
use crate::knowledge::{find_entity, KgMatch, KnowledgeGraph, TargetSignals, WikidataClient};
use crate::profile::{profile_url_for, HttpProfileLookup, ProfileData, ProfileLookup};
use crate::ReconcileError;

const CATALOG_FIELDS: &[OutletField] = &[OutletField::Bias, OutletField::BiasRating, OutletField::Factuality];
const PROFILE_FIELDS: &[OutletField] = &[
    OutletField::Bias,
    OutletField::Factuality,
    OutletField::Ownership,
    OutletField::Website,
    OutletField::Logo,
];
const KNOWLEDGE_FIELDS: &[OutletField] = &[
    OutletField::Ownership,
    OutletField::Country,
    OutletField::FoundedYear,
    OutletField::Website,
];

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub profile_base_url: Option<String>,
    pub catalog_domain_csv_url: String,
    pub catalog_name_csv_url: String,
    pub wikidata_api_url: String,
    pub cache_dir: PathBuf,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            profile_base_url: None,
            catalog_domain_csv_url:
                "https://raw.githubusercontent.com/media-bias-data/catalog/main/domains.csv".to_string(),
            catalog_name_csv_url:
                "https://raw.githubusercontent.com/media-bias-data/catalog/main/names.csv".to_string(),
            wikidata_api_url: WikidataClient::DEFAULT_API_URL.to_string(),
            cache_dir: PathBuf::from("./cache/catalog"),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let workspace = std::env::var("NEWSREC_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            profile_base_url: std::env::var("NEWSREC_PROFILE_BASE_URL")
                .or_else(|_| std::env::var("NEWSREC_SITE_BASE_URL"))
                .ok()
                .filter(|v| !v.trim().is_empty()),
            catalog_domain_csv_url: std::env::var("NEWSREC_CATALOG_DOMAIN_CSV_URL")
                .unwrap_or(defaults.catalog_domain_csv_url),
            catalog_name_csv_url: std::env::var("NEWSREC_CATALOG_NAME_CSV_URL")
                .unwrap_or(defaults.catalog_name_csv_url),
            wikidata_api_url: std::env::var("WIKIDATA_API_URL").unwrap_or(defaults.wikidata_api_url),
            cache_dir: workspace.join("cache").join("catalog"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Catalog,
    Profile,
    KnowledgeGraph,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedOutlet {
    pub outlet: OutletDraft,
    /// Stages whose trigger fired, in run order.
    pub stages: Vec<Stage>,
    pub filled: Vec<OutletField>,
}

pub fn favicon_url(host: &str) -> String {
    format!("https://www.google.com/s2/favicons?domain={host}&sz=128")
}

fn any_missing(draft: &OutletDraft, fields: &[OutletField]) -> bool {
    fields.iter().any(|f| draft.is_missing(*f))
}

/// Fill-only merge of catalog, profile and knowledge-graph data into an
/// outlet draft. Lookups are memoized for the lifetime of the reconciler, so
/// one instance should be shared across a pipeline run.
pub struct OutletReconciler {
    catalog: Arc<dyn CatalogLookup>,
    profiles: Arc<dyn ProfileLookup>,
    knowledge: Arc<dyn KnowledgeGraph>,
    profile_base_url: Option<String>,
    profile_memo: MemoCache<String, Option<ProfileData>>,
    knowledge_memo: MemoCache<(String, String), Option<KgMatch>>,
}

impl OutletReconciler {
    pub fn new(
        catalog: Arc<dyn CatalogLookup>,
        profiles: Arc<dyn ProfileLookup>,
        knowledge: Arc<dyn KnowledgeGraph>,
        profile_base_url: Option<String>,
    ) -> Self {
        Self {
            catalog,
            profiles,
            knowledge,
            profile_base_url,
            profile_memo: MemoCache::default(),
            knowledge_memo: MemoCache::default(),
        }
    }

    pub fn from_config(config: &ReconcilerConfig, fetcher: Arc<HttpFetcher>) -> Self {
        let catalog = PublicCatalog::new(
            fetcher.clone(),
            DiskCache::new(config.cache_dir.clone(), CATALOG_TTL),
            config.catalog_domain_csv_url.clone(),
            config.catalog_name_csv_url.clone(),
        );
        Self::new(
            Arc::new(catalog),
            Arc::new(HttpProfileLookup::new(fetcher.clone())),
            Arc::new(WikidataClient::new(fetcher, config.wikidata_api_url.clone())),
            config.profile_base_url.clone(),
        )
    }

    async fn profile(&self, url: &str) -> Result<Option<ProfileData>, ReconcileError> {
        self.profile_memo
            .get_or_try_init(url.to_string(), || self.profiles.fetch_profile(url))
            .await
    }

    async fn entity(&self, target: TargetSignals) -> Result<Option<KgMatch>, ReconcileError> {
        let key = (
            target.host.clone().unwrap_or_default(),
            normalize_outlet_name(&target.name),
        );
        self.knowledge_memo
            .get_or_try_init(key, || async move { find_entity(self.knowledge.as_ref(), &target).await })
            .await
    }

    /// Never fails: a stage that errors is logged and skipped.
    pub async fn enrich(&self, draft: OutletDraft) -> EnrichedOutlet {
        let span = info_span!("enrich_outlet", outlet = %draft.name);
        self.enrich_inner(draft).instrument(span).await
    }

    async fn enrich_inner(&self, mut outlet: OutletDraft) -> EnrichedOutlet {
        outlet.normalize();
        let ownership_known = !outlet.ownership.is_missing();
        let mut stages = Vec::new();
        let mut filled = Vec::new();
        let mut kg_description = None;

        if any_missing(&outlet, CATALOG_FIELDS) {
            stages.push(Stage::Catalog);
            match self.catalog.lookup(outlet.host().as_deref(), &outlet.name).await {
                Ok(Some(record)) => {
                    let mut found = OutletDraft {
                        bias_rating: record.bias_rating,
                        factuality: record.factuality,
                        ..OutletDraft::default()
                    };
                    found.normalize();
                    filled.extend(outlet.fill_from(&found));
                }
                Ok(None) => debug!("no catalog record"),
                Err(err) => warn!(error = %err, "catalog lookup failed"),
            }
        }

        if any_missing(&outlet, PROFILE_FIELDS) {
            if let Some(url) = profile_url_for(&outlet, self.profile_base_url.as_deref()) {
                stages.push(Stage::Profile);
                match self.profile(&url).await {
                    Ok(Some(data)) => {
                        let found = data.to_draft(&outlet, &url);
                        filled.extend(outlet.fill_from(&found));
                    }
                    Ok(None) => debug!(url = %url, "no profile page"),
                    Err(err) => warn!(url = %url, error = %err, "profile lookup failed"),
                }
            }
        }

        if any_missing(&outlet, KNOWLEDGE_FIELDS) {
            stages.push(Stage::KnowledgeGraph);
            let target = TargetSignals {
                name: outlet.name.clone(),
                host: outlet.host(),
            };
            match self.entity(target).await {
                Ok(Some(found)) => {
                    let draft = OutletDraft {
                        website_url: found.website_url.clone(),
                        ownership: found.ownership.clone(),
                        country: found.country.clone(),
                        founded_year: found.founded_year,
                        ..OutletDraft::default()
                    };
                    filled.extend(outlet.fill_from(&draft));
                    kg_description = found.description;
                }
                Ok(None) => debug!("no knowledge-graph entity accepted"),
                Err(err) => warn!(error = %err, "knowledge-graph lookup failed"),
            }
        }

        if !ownership_known {
            let category = outlet
                .ownership
                .as_deref()
                .filter(|o| is_known_text(o))
                .and_then(OwnershipCategory::classify)
                .or_else(|| kg_description.as_deref().and_then(OwnershipCategory::classify));
            if let Some(labeled) = label_ownership(outlet.ownership.as_deref(), category) {
                if outlet.ownership.is_missing() {
                    filled.push(OutletField::Ownership);
                }
                outlet.ownership = Some(labeled);
            }
        }

        if outlet.logo_url.is_missing() {
            if let Some(host) = outlet.host() {
                outlet.logo_url = Some(favicon_url(&host));
                filled.push(OutletField::Logo);
            }
        }

        if !stages.is_empty() {
            outlet.last_enriched_at = Some(Utc::now());
        }
        EnrichedOutlet {
            outlet,
            stages,
            filled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use newsrec_core::{Bias, BiasRating, Factuality};

    use crate::catalog::{CatalogDataset, CatalogRecord};
    use crate::knowledge::KgCandidate;

    #[derive(Default)]
    struct FakeCatalog {
        calls: AtomicUsize,
        records: Vec<CatalogRecord>,
        fail: bool,
    }

    #[async_trait]
    impl CatalogLookup for FakeCatalog {
        async fn lookup(&self, host: Option<&str>, _name: &str) -> Result<Option<CatalogRecord>, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ReconcileError::Cache("disk full".into()));
            }
            Ok(self
                .records
                .iter()
                .find(|r| r.host.as_deref() == host)
                .cloned())
        }
    }

    #[derive(Default)]
    struct FakeProfiles {
        calls: AtomicUsize,
        data: Option<ProfileData>,
    }

    #[async_trait]
    impl ProfileLookup for FakeProfiles {
        async fn fetch_profile(&self, _url: &str) -> Result<Option<ProfileData>, ReconcileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(self.data.clone())
        }
    }

    #[derive(Default)]
    struct FakeGraph {
        searches: AtomicUsize,
        candidates: Vec<KgCandidate>,
    }

    #[async_trait]
    impl KnowledgeGraph for FakeGraph {
        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, ReconcileError> {
            self.searches.fetch_add(1, Ordering::SeqCst);
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
            let known = HashMap::from([("Q1", "Thomson Reuters"), ("Q145", "United Kingdom")]);
            Ok(ids
                .iter()
                .filter_map(|id| known.get(id.as_str()).map(|l| (id.clone(), l.to_string())))
                .collect())
        }
    }

    fn reuters_record() -> CatalogRecord {
        CatalogRecord {
            dataset: CatalogDataset::Domain,
            name: Some("Reuters".into()),
            host: Some("reuters.com".into()),
            bias_rating: BiasRating::Center,
            factuality: Factuality::VeryHigh,
        }
    }

    fn reconciler(
        catalog: Arc<FakeCatalog>,
        profiles: Arc<FakeProfiles>,
        graph: Arc<FakeGraph>,
    ) -> OutletReconciler {
        OutletReconciler::new(catalog, profiles, graph, Some("https://site.test".into()))
    }

    #[tokio::test]
    async fn catalog_hit_short_circuits_later_stages() {
        let catalog = Arc::new(FakeCatalog {
            records: vec![reuters_record()],
            ..FakeCatalog::default()
        });
        let profiles = Arc::new(FakeProfiles::default());
        let graph = Arc::new(FakeGraph::default());
        let r = reconciler(catalog.clone(), profiles.clone(), graph.clone());

        let mut draft = OutletDraft::new("Reuters", Some("https://www.reuters.com/world/story".into()));
        draft.ownership = Some("Thomson Reuters".into());
        draft.country = Some("United Kingdom".into());
        draft.founded_year = Some(1851);
        draft.logo_url = Some("https://cdn.test/reuters.png".into());

        let enriched = r.enrich(draft).await;
        assert_eq!(enriched.stages, vec![Stage::Catalog]);
        assert_eq!(enriched.outlet.bias_rating, BiasRating::Center);
        assert_eq!(enriched.outlet.bias, Bias::Center);
        assert_eq!(enriched.outlet.factuality, Factuality::VeryHigh);
        assert_eq!(enriched.outlet.ownership.as_deref(), Some("Thomson Reuters"));
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 0);
        assert_eq!(graph.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn complete_record_is_left_untouched() {
        let catalog = Arc::new(FakeCatalog::default());
        let profiles = Arc::new(FakeProfiles::default());
        let graph = Arc::new(FakeGraph::default());
        let r = reconciler(catalog.clone(), profiles, graph);

        let mut draft = OutletDraft::new("Example Daily", Some("https://example.test".into()));
        draft.bias_rating = BiasRating::LeanRight;
        draft.factuality = Factuality::Mixed;
        draft.ownership = Some("Example Holdings".into());
        draft.country = Some("Canada".into());
        draft.founded_year = Some(1990);
        draft.logo_url = Some("https://example.test/logo.png".into());
        draft.normalize();

        let enriched = r.enrich(draft.clone()).await;
        assert!(enriched.stages.is_empty());
        assert!(enriched.filled.is_empty());
        assert_eq!(enriched.outlet, draft);
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn later_stages_fill_gaps_and_label_ownership() {
        let catalog = Arc::new(FakeCatalog {
            records: vec![reuters_record()],
            ..FakeCatalog::default()
        });
        let profiles = Arc::new(FakeProfiles {
            data: Some(ProfileData {
                bias_rating: BiasRating::Left,
                ownership: Some("Thomson Reuters Corporation".into()),
                ..ProfileData::default()
            }),
            ..FakeProfiles::default()
        });
        let graph = Arc::new(FakeGraph {
            candidates: vec![KgCandidate {
                id: "Q130879".into(),
                label: Some("Reuters".into()),
                description: Some("international news agency".into()),
                websites: vec!["https://www.reuters.com".into()],
                owner_ids: vec!["Q1".into()],
                country_ids: vec!["Q145".into()],
                inception_year: Some(1851),
                ..KgCandidate::default()
            }],
            ..FakeGraph::default()
        });
        let r = reconciler(catalog, profiles, graph);

        let enriched = r
            .enrich(OutletDraft::new("Reuters", Some("https://reuters.com/a".into())))
            .await;
        assert_eq!(
            enriched.stages,
            vec![Stage::Catalog, Stage::Profile, Stage::KnowledgeGraph]
        );
        // Catalog value wins over the profile's.
        assert_eq!(enriched.outlet.bias_rating, BiasRating::Center);
        assert_eq!(
            enriched.outlet.ownership.as_deref(),
            Some("Thomson Reuters Corporation (Corporation)")
        );
        assert_eq!(enriched.outlet.country.as_deref(), Some("United Kingdom"));
        assert_eq!(enriched.outlet.founded_year, Some(1851));
        assert_eq!(
            enriched.outlet.logo_url.as_deref(),
            Some("https://www.google.com/s2/favicons?domain=reuters.com&sz=128")
        );
        assert_eq!(
            enriched.outlet.profile_url.as_deref(),
            Some("https://site.test/source/reuters")
        );
        assert!(enriched.outlet.last_enriched_at.is_some());
    }

    #[tokio::test]
    async fn unrelated_entity_is_not_attached() {
        let catalog = Arc::new(FakeCatalog::default());
        let profiles = Arc::new(FakeProfiles::default());
        let graph = Arc::new(FakeGraph {
            candidates: vec![KgCandidate {
                id: "Q1".into(),
                label: Some("Phoenix".into()),
                description: Some("mythological bird".into()),
                owner_ids: vec!["Q1".into()],
                ..KgCandidate::default()
            }],
            ..FakeGraph::default()
        });
        let r = reconciler(catalog, profiles, graph);

        let enriched = r.enrich(OutletDraft::new("Phoenix", None)).await;
        assert!(enriched.stages.contains(&Stage::KnowledgeGraph));
        assert!(enriched.outlet.ownership.is_none());
        assert!(enriched.outlet.country.is_none());
        assert!(enriched.outlet.logo_url.is_none());
    }

    #[tokio::test]
    async fn failing_stage_does_not_stop_the_rest() {
        let catalog = Arc::new(FakeCatalog {
            fail: true,
            ..FakeCatalog::default()
        });
        let profiles = Arc::new(FakeProfiles {
            data: Some(ProfileData {
                factuality: Factuality::High,
                ..ProfileData::default()
            }),
            ..FakeProfiles::default()
        });
        let r = reconciler(catalog, profiles.clone(), Arc::new(FakeGraph::default()));

        let enriched = r.enrich(OutletDraft::new("Local Ledger", None)).await;
        assert_eq!(enriched.outlet.factuality, Factuality::High);
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_lookups_for_one_outlet_are_shared() {
        let profiles = Arc::new(FakeProfiles {
            data: Some(ProfileData::default()),
            ..FakeProfiles::default()
        });
        let graph = Arc::new(FakeGraph::default());
        let r = reconciler(Arc::new(FakeCatalog::default()), profiles.clone(), graph.clone());

        let draft = OutletDraft::new("Metro Wire", Some("https://metrowire.test".into()));
        let (a, b) = tokio::join!(r.enrich(draft.clone()), r.enrich(draft.clone()));
        assert_eq!(a.outlet.logo_url, b.outlet.logo_url);
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
        let searches = graph.searches.load(Ordering::SeqCst);

        r.enrich(draft).await;
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
        assert_eq!(graph.searches.load(Ordering::SeqCst), searches);
    }
}
