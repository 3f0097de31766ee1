use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use newsrec_core::{root_domain, BiasRating, Factuality, Fillable};
use newsrec_storage::{DiskCache, HttpFetcher};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::ReconcileError;

pub const CATALOG_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DOMAIN_COLUMNS: &[&str] = &["domain", "source_url", "url", "website", "host"];
const NAME_COLUMNS: &[&str] = &["name", "news_source", "source", "outlet"];
const BIAS_COLUMNS: &[&str] = &["bias_rating", "bias", "rating"];
const FACTUALITY_COLUMNS: &[&str] = &["factuality", "factual_reporting", "factual"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogDataset {
    /// Bias and factuality keyed by domain.
    Domain,
    /// Bias keyed by outlet name.
    Name,
}

impl CatalogDataset {
    fn cache_file(&self) -> &'static str {
        match self {
            Self::Domain => "catalog_domains.csv",
            Self::Name => "catalog_names.csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub dataset: CatalogDataset,
    pub name: Option<String>,
    pub host: Option<String>,
    pub bias_rating: BiasRating,
    pub factuality: Factuality,
}

impl CatalogRecord {
    fn richness(&self) -> u8 {
        u8::from(!self.bias_rating.is_missing()) + u8::from(!self.factuality.is_missing())
    }
}

/// Lower-cased alphanumerics with a leading "the" dropped.
pub fn normalize_outlet_name(name: &str) -> String {
    let words = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let mut words = words.split_whitespace().collect::<Vec<_>>();
    if words.len() > 1 && words[0] == "the" {
        words.remove(0);
    }
    words.join("")
}

fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    newsrec_core::host_of(&with_scheme)
}

fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        names.contains(&h.as_str())
    })
}

pub fn parse_catalog_csv(bytes: &[u8], dataset: CatalogDataset) -> Result<Vec<CatalogRecord>, ReconcileError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| ReconcileError::parse("catalog headers", e))?
        .clone();
    let domain_col = column(&headers, DOMAIN_COLUMNS);
    let name_col = column(&headers, NAME_COLUMNS);
    let bias_col = column(&headers, BIAS_COLUMNS);
    let fact_col = column(&headers, FACTUALITY_COLUMNS);
    if domain_col.is_none() && name_col.is_none() {
        return Err(ReconcileError::parse(
            "catalog headers",
            "no domain or name column",
        ));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                debug!(error = %err, "skipping malformed catalog row");
                continue;
            }
        };
        let get = |idx: Option<usize>| idx.and_then(|i| row.get(i)).map(str::trim).filter(|v| !v.is_empty());
        let record = CatalogRecord {
            dataset,
            name: get(name_col).map(str::to_string),
            host: get(domain_col).and_then(normalize_host),
            bias_rating: get(bias_col).map(BiasRating::from_label).unwrap_or_default(),
            factuality: get(fact_col).map(Factuality::from_label).unwrap_or_default(),
        };
        if record.richness() > 0 && (record.name.is_some() || record.host.is_some()) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Catalog records indexed by exact host, root domain and normalized name.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    by_host: HashMap<String, Vec<usize>>,
    by_root: HashMap<String, Vec<usize>>,
    by_name: HashMap<String, Vec<usize>>,
    records: Vec<CatalogRecord>,
}

impl CatalogIndex {
    pub fn new(records: Vec<CatalogRecord>) -> Self {
        let mut index = Self::default();
        for (i, record) in records.iter().enumerate() {
            if let Some(host) = &record.host {
                index.by_host.entry(host.clone()).or_default().push(i);
                index.by_root.entry(root_domain(host)).or_default().push(i);
            }
            if let Some(name) = &record.name {
                let key = normalize_outlet_name(name);
                if !key.is_empty() {
                    index.by_name.entry(key).or_default().push(i);
                }
            }
        }
        index.records = records;
        index
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Best match for an outlet. Host beats root domain beats name, except
    /// that a record carrying both bias and factuality beats a sparser one.
    pub fn lookup(&self, host: Option<&str>, name: &str) -> Option<&CatalogRecord> {
        let mut ordered: Vec<usize> = Vec::new();
        if let Some(host) = host {
            ordered.extend(self.by_host.get(host).into_iter().flatten());
            ordered.extend(self.by_root.get(&root_domain(host)).into_iter().flatten());
        }
        ordered.extend(self.by_name.get(&normalize_outlet_name(name)).into_iter().flatten());

        let mut best: Option<&CatalogRecord> = None;
        for record in ordered.into_iter().filter_map(|i| self.records.get(i)) {
            match best {
                Some(current) if current.richness() >= record.richness() => {}
                _ => best = Some(record),
            }
        }
        best
    }
}

#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn lookup(&self, host: Option<&str>, name: &str) -> Result<Option<CatalogRecord>, ReconcileError>;
}

/// The two public CSV datasets, downloaded on first use and cached on disk.
pub struct PublicCatalog {
    fetcher: Arc<HttpFetcher>,
    cache: DiskCache,
    sources: Vec<(CatalogDataset, String)>,
    index: OnceCell<Arc<CatalogIndex>>,
}

impl PublicCatalog {
    pub fn new(fetcher: Arc<HttpFetcher>, cache: DiskCache, domain_csv_url: String, name_csv_url: String) -> Self {
        Self {
            fetcher,
            cache,
            sources: vec![
                (CatalogDataset::Domain, domain_csv_url),
                (CatalogDataset::Name, name_csv_url),
            ],
            index: OnceCell::new(),
        }
    }

    async fn dataset_bytes(&self, dataset: CatalogDataset, url: &str) -> Result<Option<Vec<u8>>, ReconcileError> {
        let file = dataset.cache_file();
        let cached = self
            .cache
            .read_fresh(file)
            .await
            .map_err(|e| ReconcileError::Cache(format!("{e:#}")))?;
        if let Some(bytes) = cached {
            debug!(?dataset, "catalog cache hit");
            return Ok(Some(bytes));
        }

        match self.fetcher.fetch_bytes(url).await {
            Ok(resp) => {
                if let Err(err) = self.cache.write(file, &resp.body).await {
                    warn!(?dataset, error = %format!("{err:#}"), "failed to cache catalog");
                }
                info!(?dataset, bytes = resp.body.len(), "catalog downloaded");
                Ok(Some(resp.body))
            }
            Err(err) => {
                warn!(?dataset, url, error = %err, "catalog download failed; trying stale copy");
                self.cache
                    .read_stale(file)
                    .await
                    .map_err(|e| ReconcileError::Cache(format!("{e:#}")))
            }
        }
    }

    async fn build_index(&self) -> Result<Arc<CatalogIndex>, ReconcileError> {
        let mut records = Vec::new();
        for (dataset, url) in &self.sources {
            match self.dataset_bytes(*dataset, url).await? {
                Some(bytes) => match parse_catalog_csv(&bytes, *dataset) {
                    Ok(parsed) => records.extend(parsed),
                    Err(err) => warn!(?dataset, error = %err, "catalog unparseable; skipping"),
                },
                None => warn!(?dataset, "catalog unavailable"),
            }
        }
        info!(records = records.len(), "catalog index built");
        Ok(Arc::new(CatalogIndex::new(records)))
    }

    pub async fn index(&self) -> Result<Arc<CatalogIndex>, ReconcileError> {
        self.index
            .get_or_try_init(|| self.build_index())
            .await
            .cloned()
    }
}

#[async_trait]
impl CatalogLookup for PublicCatalog {
    async fn lookup(&self, host: Option<&str>, name: &str) -> Result<Option<CatalogRecord>, ReconcileError> {
        Ok(self.index().await?.lookup(host, name).cloned())
    }
}
