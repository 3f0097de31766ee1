//! Outlet metadata reconciliation across the public catalog, the aggregator's
//! profile pages and the Wikidata knowledge graph.

mod catalog;
mod knowledge;
mod profile;
mod reconciler;

use newsrec_storage::FetchError;
use thiserror::Error;

pub use catalog::{
    normalize_outlet_name, parse_catalog_csv, CatalogDataset, CatalogIndex, CatalogLookup,
    CatalogRecord, PublicCatalog, CATALOG_TTL,
};
pub use knowledge::{
    accept_candidate, choose_best, derive_queries, find_entity, score_candidate, KgCandidate,
    KgMatch, KnowledgeGraph, ScoreBreakdown, TargetSignals, WikidataClient, ACCEPT_THRESHOLD,
    EXACT_HOST_WEIGHT, MAX_CANDIDATES, MEDIA_DESCRIPTION_WEIGHT, NAME_MATCH_WEIGHT,
    NO_HOST_NO_NAME_PENALTY, NO_MEDIA_NO_HOST_PENALTY, ROOT_DOMAIN_WEIGHT,
};
pub use profile::{
    is_locked_ownership, parse_profile_page, profile_url_for, HttpProfileLookup, ProfileData,
    ProfileLookup,
};
pub use reconciler::{
    favicon_url, EnrichedOutlet, OutletReconciler, ReconcilerConfig, Stage,
};

pub const CRATE_NAME: &str = "newsrec-outlets";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing {what}: {message}")]
    Parse { what: String, message: String },
    #[error("catalog cache: {0}")]
    Cache(String),
}

impl ReconcileError {
    pub(crate) fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }
}
