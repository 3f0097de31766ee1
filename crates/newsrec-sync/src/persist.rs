use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use newsrec_core::{
    is_known_text, slugify, source_article_id, Bias, BiasRating, Factuality, OutletDraft,
    OwnershipCategory, PodcastItem, ReaderLink, SourceCandidate, StoryCandidate, StoryGeo,
    TimelineItem,
};
use newsrec_outlets::OutletReconciler;
use serde::Serialize;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::PersistError;

pub const RELATED_LIMIT: usize = 5;
pub const TOPIC_WEIGHT: i32 = 3;
pub const SHARED_TAG_WEIGHT: i32 = 1;

const OWNERSHIP_SEPARATORS: &[&str] = &[", owned by ", " owned by ", " Owned by ", " -> ", " > ", ";"];

pub fn story_row_id(slug: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("story:{slug}").as_bytes())
}

pub fn outlet_row_id(slug: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("outlet:{slug}").as_bytes())
}

pub fn outlet_slug(outlet: &OutletDraft) -> String {
    if outlet.slug.is_empty() {
        slugify(&outlet.name)
    } else {
        outlet.slug.clone()
    }
}

/// The explicit "broke the news" URL when it is one of the story's sources,
/// otherwise the earliest-published source.
pub fn broke_the_news_url(candidate: &StoryCandidate) -> Option<&str> {
    if let Some(explicit) = candidate.broke_the_news_url.as_deref() {
        if candidate.sources.iter().any(|s| s.url == explicit) {
            return Some(explicit);
        }
    }
    candidate
        .sources
        .iter()
        .filter_map(|s| s.published_at.map(|at| (at, s.url.as_str())))
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
        .map(|(_, url)| url)
}

/// Ids a story's sources must end up with; anything else attached to the
/// story is stale.
pub fn source_ids_for(story_id: Uuid, sources: &[SourceCandidate]) -> Vec<Uuid> {
    sources
        .iter()
        .map(|s| source_article_id(story_id, &s.url))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipLink {
    pub name: String,
    pub category: Option<String>,
    /// 0 is the direct owner; each step up the chain adds one.
    pub depth: i32,
}

/// Splits ownership text such as `"Fox News Media, owned by Fox Corporation
/// (Media Conglomerates)"` into a chain, direct owner first. A trailing
/// category label is attached to the ultimate owner.
pub fn parse_ownership_chain(text: &str) -> Vec<OwnershipLink> {
    if !is_known_text(text) {
        return Vec::new();
    }
    let mut body = text.trim().to_string();
    let mut category = None;
    if let Some(open) = body.rfind('(') {
        let inner = body[open + 1..].trim_end_matches(')').trim().to_string();
        if body.ends_with(')') && OwnershipCategory::ALL.iter().any(|c| c.label() == inner) {
            category = Some(inner);
            body = body[..open].trim().to_string();
        }
    }

    for sep in OWNERSHIP_SEPARATORS {
        body = body.replace(sep, "\u{1}");
    }
    let names = body
        .split('\u{1}')
        .map(|n| n.trim().trim_matches(',').trim())
        .filter(|n| !n.is_empty() && is_known_text(n))
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut chain = names
        .into_iter()
        .enumerate()
        .map(|(i, name)| OwnershipLink {
            name,
            category: None,
            depth: i as i32,
        })
        .collect::<Vec<_>>();
    if let Some(last) = chain.last_mut() {
        last.category = category;
    }
    chain
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedEdge {
    pub from_slug: String,
    pub to_slug: String,
    pub reason: String,
    pub score: i32,
}

fn relatedness(a: &StoryCandidate, b: &StoryCandidate) -> (i32, &'static str) {
    let same_topic = match (a.topic.as_deref(), b.topic.as_deref()) {
        (Some(x), Some(y)) => !x.trim().is_empty() && x.trim().eq_ignore_ascii_case(y.trim()),
        _ => false,
    };
    let tags = a
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .collect::<HashSet<_>>();
    let shared = b
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .collect::<HashSet<_>>()
        .intersection(&tags)
        .count() as i32;

    let score = (if same_topic { TOPIC_WEIGHT } else { 0 }) + shared * SHARED_TAG_WEIGHT;
    let reason = match (same_topic, shared > 0) {
        (true, true) => "topic+tags",
        (true, false) => "topic",
        _ => "tags",
    };
    (score, reason)
}

/// Explicit relations plus up to [`RELATED_LIMIT`] inferred ones per story,
/// scored by topic and tag overlap within the batch.
pub fn related_edges(batch: &[&StoryCandidate]) -> Vec<RelatedEdge> {
    let mut edges = Vec::new();
    for story in batch.iter().copied() {
        let mut linked = HashSet::new();
        linked.insert(story.slug.clone());
        for rel in &story.related {
            if linked.insert(rel.slug.clone()) {
                edges.push(RelatedEdge {
                    from_slug: story.slug.clone(),
                    to_slug: rel.slug.clone(),
                    reason: rel.reason.clone(),
                    score: 0,
                });
            }
        }

        let mut inferred = batch
            .iter()
            .copied()
            .filter(|other| !linked.contains(&other.slug))
            .map(|other| (other, relatedness(story, other)))
            .filter(|(_, (score, _))| *score > 0)
            .collect::<Vec<_>>();
        inferred.sort_by(|(a, (sa, _)), (b, (sb, _))| sb.cmp(sa).then_with(|| a.slug.cmp(&b.slug)));
        for (other, (score, reason)) in inferred.into_iter().take(RELATED_LIMIT) {
            if linked.insert(other.slug.clone()) {
                edges.push(RelatedEdge {
                    from_slug: story.slug.clone(),
                    to_slug: other.slug.clone(),
                    reason: reason.to_string(),
                    score,
                });
            }
        }
    }
    edges
}

/// One set of child rows, replaced wholesale for a story.
pub enum ChildRows<'a> {
    Timeline(&'a [TimelineItem]),
    Podcasts(&'a [PodcastItem]),
    ReaderLinks(&'a [ReaderLink]),
    Snapshot(Option<&'a serde_json::Value>),
}

impl ChildRows<'_> {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Timeline(_) => "story_timeline_items",
            Self::Podcasts(_) => "story_podcasts",
            Self::ReaderLinks(_) => "story_reader_links",
            Self::Snapshot(_) => "story_snapshots",
        }
    }
}

/// Delete-then-insert inside a savepoint, so a failed insert never leaves the
/// story with its old rows deleted.
pub async fn replace_children(
    conn: &mut PgConnection,
    story_id: Uuid,
    rows: ChildRows<'_>,
) -> Result<usize, PersistError> {
    let mut sp = sqlx::Connection::begin(&mut *conn).await?;
    sqlx::query(&format!("DELETE FROM {} WHERE story_id = $1", rows.table()))
        .bind(story_id)
        .execute(&mut *sp)
        .await?;

    let inserted = match rows {
        ChildRows::Timeline(items) => {
            for (pos, item) in items.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO story_timeline_items (id, story_id, position, occurred_at, headline, body)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(story_id)
                .bind(pos as i32)
                .bind(item.occurred_at)
                .bind(&item.headline)
                .bind(&item.body)
                .execute(&mut *sp)
                .await?;
            }
            items.len()
        }
        ChildRows::Podcasts(items) => {
            for (pos, item) in items.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO story_podcasts (id, story_id, position, title, url, duration_seconds)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(story_id)
                .bind(pos as i32)
                .bind(&item.title)
                .bind(&item.url)
                .bind(item.duration_seconds)
                .execute(&mut *sp)
                .await?;
            }
            items.len()
        }
        ChildRows::ReaderLinks(items) => {
            for (pos, item) in items.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO story_reader_links (id, story_id, position, label, url)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(story_id)
                .bind(pos as i32)
                .bind(&item.label)
                .bind(&item.url)
                .execute(&mut *sp)
                .await?;
            }
            items.len()
        }
        ChildRows::Snapshot(payload) => match payload {
            Some(payload) => {
                sqlx::query(
                    r#"
                    INSERT INTO story_snapshots (id, story_id, captured_at, payload)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(story_id)
                .bind(Utc::now())
                .bind(payload)
                .execute(&mut *sp)
                .await?;
                1
            }
            None => 0,
        },
    };
    sp.commit().await?;
    Ok(inserted)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistSummary {
    pub stories: usize,
    pub rejected: usize,
    pub outlets: usize,
    pub sources: usize,
    pub stale_sources_removed: u64,
    pub related_edges: usize,
}

/// Writes story batches and their subgraphs to Postgres.
pub struct StoryStore {
    pool: PgPool,
    tx_timeout: Duration,
}

impl StoryStore {
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self {
        Self { pool, tx_timeout }
    }

    /// Reconciles every distinct outlet in the batch, then writes the whole
    /// batch in one transaction. Candidates failing validation are skipped.
    pub async fn persist_batch(
        &self,
        candidates: &[StoryCandidate],
        reconciler: &OutletReconciler,
    ) -> Result<PersistSummary, PersistError> {
        let mut valid = Vec::with_capacity(candidates.len());
        let mut rejected = 0;
        for candidate in candidates {
            match candidate.validate() {
                Ok(()) => valid.push(candidate),
                Err(err) => {
                    warn!(error = %err, "rejecting story candidate");
                    rejected += 1;
                }
            }
        }

        let outlets = self.prepare_outlets(&valid, reconciler).await?;
        let seconds = self.tx_timeout.as_secs();
        let span = info_span!("persist_batch", stories = valid.len(), outlets = outlets.len());
        let mut summary = tokio::time::timeout(self.tx_timeout, self.write_batch(&valid, &outlets))
            .instrument(span)
            .await
            .map_err(|_| PersistError::Timeout { seconds })??;
        summary.rejected = rejected;
        info!(
            stories = summary.stories,
            rejected,
            sources = summary.sources,
            stale = summary.stale_sources_removed,
            related = summary.related_edges,
            "batch persisted"
        );
        Ok(summary)
    }

    async fn prepare_outlets(
        &self,
        candidates: &[&StoryCandidate],
        reconciler: &OutletReconciler,
    ) -> Result<BTreeMap<String, OutletDraft>, PersistError> {
        let mut drafts: BTreeMap<String, OutletDraft> = BTreeMap::new();
        for source in candidates.iter().flat_map(|c| c.sources.iter()) {
            let mut draft = source.outlet.clone();
            draft.slug = outlet_slug(&draft);
            draft.normalize();
            match drafts.get_mut(&draft.slug) {
                Some(existing) => {
                    existing.fill_from(&draft);
                }
                None => {
                    drafts.insert(draft.slug.clone(), draft);
                }
            }
        }

        let slugs = drafts.keys().cloned().collect::<Vec<_>>();
        let stored = load_outlets(&self.pool, &slugs).await?;
        let merged = drafts
            .into_iter()
            .map(|(slug, draft)| match stored.get(&slug) {
                Some(row) => {
                    let mut row = row.clone();
                    row.fill_from(&draft);
                    row
                }
                None => draft,
            })
            .collect::<Vec<_>>();

        let enriched = join_all(merged.into_iter().map(|draft| async move {
            if draft.needs_enrichment() {
                reconciler.enrich(draft).await.outlet
            } else {
                draft
            }
        }))
        .await;
        Ok(enriched.into_iter().map(|o| (o.slug.clone(), o)).collect())
    }

    async fn write_batch(
        &self,
        candidates: &[&StoryCandidate],
        outlets: &BTreeMap<String, OutletDraft>,
    ) -> Result<PersistSummary, PersistError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.tx_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;

        let mut summary = PersistSummary::default();
        let mut outlet_ids = HashMap::new();
        for (slug, outlet) in outlets {
            let id = upsert_outlet(&mut tx, outlet).await?;
            outlet_ids.insert(slug.clone(), id);
        }
        summary.outlets = outlet_ids.len();

        let mut story_ids: HashMap<String, Uuid> = HashMap::new();
        for candidate in candidates {
            let story_id = upsert_story(&mut tx, candidate).await?;
            story_ids.insert(candidate.slug.clone(), story_id);
            replace_tags(&mut tx, story_id, &candidate.tags).await?;

            let mut kept = Vec::with_capacity(candidate.sources.len());
            let mut ids_by_url = HashMap::new();
            for source in &candidate.sources {
                let Some(outlet_id) = outlet_ids.get(&outlet_slug(&source.outlet)) else {
                    warn!(url = %source.url, "source outlet missing from batch; skipping");
                    continue;
                };
                let id = upsert_source(&mut tx, story_id, *outlet_id, source).await?;
                ids_by_url.insert(source.url.as_str(), id);
                kept.push(id);
            }
            summary.sources += kept.len();

            let removed = sqlx::query("DELETE FROM source_articles WHERE story_id = $1 AND NOT (id = ANY($2))")
                .bind(story_id)
                .bind(&kept)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            summary.stale_sources_removed += removed;

            let broke = broke_the_news_url(candidate).and_then(|url| ids_by_url.get(url).copied());
            sqlx::query("UPDATE stories SET broke_the_news_source_id = $2 WHERE id = $1")
                .bind(story_id)
                .bind(broke)
                .execute(&mut *tx)
                .await?;

            replace_children(&mut tx, story_id, ChildRows::Timeline(&candidate.timeline)).await?;
            replace_children(&mut tx, story_id, ChildRows::Podcasts(&candidate.podcasts)).await?;
            replace_children(&mut tx, story_id, ChildRows::ReaderLinks(&candidate.reader_links)).await?;
            replace_children(&mut tx, story_id, ChildRows::Snapshot(candidate.snapshot.as_ref())).await?;
            if let Some(geo) = &candidate.geo {
                upsert_geo(&mut tx, story_id, geo).await?;
            }
            summary.stories += 1;
            debug!(slug = %candidate.slug, sources = kept.len(), removed, "story written");
        }

        for (slug, outlet) in outlets {
            if let Some(outlet_id) = outlet_ids.get(slug) {
                rebuild_ownership(&mut tx, *outlet_id, outlet.ownership.as_deref()).await?;
            }
        }

        summary.related_edges = replace_related(&mut tx, candidates, &story_ids).await?;

        tx.commit().await?;
        Ok(summary)
    }
}

fn known(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| is_known_text(v))
}

async fn load_outlets(pool: &PgPool, slugs: &[String]) -> Result<HashMap<String, OutletDraft>, PersistError> {
    if slugs.is_empty() {
        return Ok(HashMap::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT slug, name, website_url, profile_url, logo_url, bias, bias_rating, factuality,
               ownership, country, founded_year, last_enriched_at
          FROM outlets
         WHERE slug = ANY($1)
        "#,
    )
    .bind(slugs)
    .fetch_all(pool)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let bias: String = row.try_get("bias")?;
        let bias_rating: String = row.try_get("bias_rating")?;
        let factuality: String = row.try_get("factuality")?;
        let outlet = OutletDraft {
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            website_url: row.try_get("website_url")?,
            profile_url: row.try_get("profile_url")?,
            logo_url: row.try_get("logo_url")?,
            bias: Bias::from_label(&bias),
            bias_rating: BiasRating::from_label(&bias_rating),
            factuality: Factuality::from_label(&factuality),
            ownership: row.try_get("ownership")?,
            country: row.try_get("country")?,
            founded_year: row.try_get("founded_year")?,
            last_enriched_at: row.try_get("last_enriched_at")?,
        };
        out.insert(outlet.slug.clone(), outlet);
    }
    Ok(out)
}

async fn upsert_outlet(conn: &mut PgConnection, outlet: &OutletDraft) -> Result<Uuid, PersistError> {
    let row = sqlx::query(
        r#"
        INSERT INTO outlets (id, slug, name, website_url, profile_url, logo_url, bias, bias_rating,
                             factuality, ownership, country, founded_year, last_enriched_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
        ON CONFLICT (slug) DO UPDATE SET
            name = EXCLUDED.name,
            website_url = EXCLUDED.website_url,
            profile_url = EXCLUDED.profile_url,
            logo_url = EXCLUDED.logo_url,
            bias = EXCLUDED.bias,
            bias_rating = EXCLUDED.bias_rating,
            factuality = EXCLUDED.factuality,
            ownership = EXCLUDED.ownership,
            country = EXCLUDED.country,
            founded_year = EXCLUDED.founded_year,
            last_enriched_at = COALESCE(EXCLUDED.last_enriched_at, outlets.last_enriched_at),
            updated_at = NOW()
        RETURNING id
        "#,
    )
    .bind(outlet_row_id(&outlet.slug))
    .bind(&outlet.slug)
    .bind(&outlet.name)
    .bind(known(&outlet.website_url))
    .bind(known(&outlet.profile_url))
    .bind(known(&outlet.logo_url))
    .bind(outlet.bias.as_str())
    .bind(outlet.bias_rating.as_str())
    .bind(outlet.factuality.as_str())
    .bind(known(&outlet.ownership))
    .bind(known(&outlet.country))
    .bind(outlet.founded_year)
    .bind(outlet.last_enriched_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("id")?)
}

async fn upsert_story(conn: &mut PgConnection, story: &StoryCandidate) -> Result<Uuid, PersistError> {
    let row = sqlx::query(
        r#"
        INSERT INTO stories (id, slug, canonical_url, title, dek, author, summary, topic, location,
                             image_url, bias_left, bias_center, bias_right, is_blindspot, is_local,
                             is_trending, original_reporting_pct, homepage_rank, published_at,
                             updated_at, fetched_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                $19, $20, $21)
        ON CONFLICT (slug) DO UPDATE SET
            canonical_url = EXCLUDED.canonical_url,
            title = EXCLUDED.title,
            dek = COALESCE(EXCLUDED.dek, stories.dek),
            author = COALESCE(EXCLUDED.author, stories.author),
            summary = COALESCE(EXCLUDED.summary, stories.summary),
            topic = COALESCE(EXCLUDED.topic, stories.topic),
            location = COALESCE(EXCLUDED.location, stories.location),
            image_url = COALESCE(EXCLUDED.image_url, stories.image_url),
            bias_left = EXCLUDED.bias_left,
            bias_center = EXCLUDED.bias_center,
            bias_right = EXCLUDED.bias_right,
            is_blindspot = EXCLUDED.is_blindspot,
            is_local = EXCLUDED.is_local,
            is_trending = EXCLUDED.is_trending,
            original_reporting_pct = EXCLUDED.original_reporting_pct,
            homepage_rank = EXCLUDED.homepage_rank,
            published_at = COALESCE(EXCLUDED.published_at, stories.published_at),
            updated_at = COALESCE(EXCLUDED.updated_at, stories.updated_at),
            fetched_at = EXCLUDED.fetched_at
        RETURNING id
        "#,
    )
    .bind(story_row_id(&story.slug))
    .bind(&story.slug)
    .bind(&story.canonical_url)
    .bind(&story.title)
    .bind(&story.dek)
    .bind(&story.author)
    .bind(&story.summary)
    .bind(&story.topic)
    .bind(&story.location)
    .bind(&story.image_url)
    .bind(story.bias.left)
    .bind(story.bias.center)
    .bind(story.bias.right)
    .bind(story.is_blindspot)
    .bind(story.is_local)
    .bind(story.is_trending)
    .bind(story.original_reporting_pct)
    .bind(story.homepage_rank)
    .bind(story.published_at)
    .bind(story.updated_at)
    .bind(story.fetched_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("id")?)
}

async fn replace_tags(conn: &mut PgConnection, story_id: Uuid, tags: &[String]) -> Result<(), PersistError> {
    sqlx::query("DELETE FROM story_tags WHERE story_id = $1")
        .bind(story_id)
        .execute(&mut *conn)
        .await?;
    for tag in tags {
        sqlx::query("INSERT INTO story_tags (story_id, tag) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(story_id)
            .bind(tag)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn upsert_source(
    conn: &mut PgConnection,
    story_id: Uuid,
    outlet_id: Uuid,
    source: &SourceCandidate,
) -> Result<Uuid, PersistError> {
    let row = sqlx::query(
        r#"
        INSERT INTO source_articles (id, story_id, outlet_id, url, excerpt, published_at, paywall,
                                     locality, is_wire_service, bias_rating, factuality,
                                     ownership_category, signals_synthetic)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (story_id, url) DO UPDATE SET
            outlet_id = EXCLUDED.outlet_id,
            excerpt = COALESCE(EXCLUDED.excerpt, source_articles.excerpt),
            published_at = COALESCE(EXCLUDED.published_at, source_articles.published_at),
            paywall = EXCLUDED.paywall,
            locality = EXCLUDED.locality,
            is_wire_service = EXCLUDED.is_wire_service,
            bias_rating = EXCLUDED.bias_rating,
            factuality = EXCLUDED.factuality,
            ownership_category = EXCLUDED.ownership_category,
            signals_synthetic = EXCLUDED.signals_synthetic
        RETURNING id
        "#,
    )
    .bind(source_article_id(story_id, &source.url))
    .bind(story_id)
    .bind(outlet_id)
    .bind(&source.url)
    .bind(&source.excerpt)
    .bind(source.published_at)
    .bind(source.paywall.as_str())
    .bind(source.locality.as_str())
    .bind(source.is_wire_service)
    .bind(source.bias_rating.as_str())
    .bind(source.factuality.as_str())
    .bind(source.ownership.map(|c| c.as_str()))
    .bind(source.signals_synthetic)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("id")?)
}

async fn upsert_geo(conn: &mut PgConnection, story_id: Uuid, geo: &StoryGeo) -> Result<(), PersistError> {
    sqlx::query(
        r#"
        INSERT INTO story_geos (story_id, latitude, longitude, locality, region, country)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (story_id) DO UPDATE SET
            latitude = EXCLUDED.latitude,
            longitude = EXCLUDED.longitude,
            locality = EXCLUDED.locality,
            region = EXCLUDED.region,
            country = EXCLUDED.country
        "#,
    )
    .bind(story_id)
    .bind(geo.latitude)
    .bind(geo.longitude)
    .bind(&geo.locality)
    .bind(&geo.region)
    .bind(&geo.country)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn rebuild_ownership(
    conn: &mut PgConnection,
    outlet_id: Uuid,
    ownership: Option<&str>,
) -> Result<(), PersistError> {
    sqlx::query("DELETE FROM outlet_ownership_edges WHERE outlet_id = $1")
        .bind(outlet_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM outlet_ownership_entities WHERE outlet_id = $1")
        .bind(outlet_id)
        .execute(&mut *conn)
        .await?;

    let chain = ownership.map(parse_ownership_chain).unwrap_or_default();
    let mut previous: Option<Uuid> = None;
    for link in chain {
        let entity_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO outlet_ownership_entities (id, outlet_id, name, category, depth) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entity_id)
        .bind(outlet_id)
        .bind(&link.name)
        .bind(&link.category)
        .bind(link.depth)
        .execute(&mut *conn)
        .await?;
        sqlx::query(
            "INSERT INTO outlet_ownership_edges (id, outlet_id, owner_entity_id, owned_entity_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(outlet_id)
        .bind(entity_id)
        .bind(previous)
        .execute(&mut *conn)
        .await?;
        previous = Some(entity_id);
    }
    Ok(())
}

/// Replaces every outgoing related edge of the batch's stories. Target slugs
/// resolve against the batch first, then the stored stories.
async fn replace_related(
    conn: &mut PgConnection,
    batch: &[&StoryCandidate],
    story_ids: &HashMap<String, Uuid>,
) -> Result<usize, PersistError> {
    let edges = related_edges(batch);
    let mut ids = story_ids.clone();
    let missing = edges
        .iter()
        .map(|e| e.to_slug.clone())
        .filter(|slug| !ids.contains_key(slug))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        let rows = sqlx::query("SELECT id, slug FROM stories WHERE slug = ANY($1)")
            .bind(&missing)
            .fetch_all(&mut *conn)
            .await?;
        for row in rows {
            ids.insert(row.try_get("slug")?, row.try_get("id")?);
        }
    }

    let touched = story_ids.values().copied().collect::<Vec<_>>();
    sqlx::query("DELETE FROM story_related_stories WHERE story_id = ANY($1)")
        .bind(&touched)
        .execute(&mut *conn)
        .await?;

    let mut written = 0;
    for edge in &edges {
        let (Some(from), Some(to)) = (ids.get(&edge.from_slug), ids.get(&edge.to_slug)) else {
            debug!(from = %edge.from_slug, to = %edge.to_slug, "related story not stored yet");
            continue;
        };
        if from == to {
            continue;
        }
        written += sqlx::query(
            r#"
            INSERT INTO story_related_stories (story_id, related_story_id, reason, score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(&edge.reason)
        .bind(edge.score)
        .execute(&mut *conn)
        .await?
        .rows_affected() as usize;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use newsrec_core::{BiasRating, Factuality, Locality, Paywall, RelatedRef};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, hour, 0, 0).single().unwrap()
    }

    fn source(url: &str, published_at: Option<DateTime<Utc>>) -> SourceCandidate {
        SourceCandidate {
            url: url.to_string(),
            outlet: OutletDraft::new("Example", Some("https://example.test".into())),
            excerpt: None,
            published_at,
            paywall: Paywall::Unknown,
            locality: Locality::Unknown,
            is_wire_service: false,
            bias_rating: BiasRating::Unknown,
            factuality: Factuality::Unknown,
            ownership: None,
            signals_synthetic: true,
        }
    }

    fn story(slug: &str, topic: Option<&str>, tags: &[&str]) -> StoryCandidate {
        let mut s = StoryCandidate::new(slug, format!("https://site.test/story/{slug}"), slug);
        s.topic = topic.map(str::to_string);
        s.tags = tags.iter().map(|t| t.to_string()).collect();
        s
    }

    #[test]
    fn broke_the_news_prefers_explicit_surviving_source() {
        let mut s = story("budget", None, &[]);
        s.sources = vec![
            source("https://a.test/1", Some(at(9))),
            source("https://b.test/1", Some(at(7))),
            source("https://c.test/1", None),
        ];
        assert_eq!(broke_the_news_url(&s), Some("https://b.test/1"));

        s.broke_the_news_url = Some("https://a.test/1".into());
        assert_eq!(broke_the_news_url(&s), Some("https://a.test/1"));

        s.broke_the_news_url = Some("https://gone.test/1".into());
        assert_eq!(broke_the_news_url(&s), Some("https://b.test/1"));

        s.sources.retain(|src| src.published_at.is_none());
        assert_eq!(broke_the_news_url(&s), None);
    }

    #[test]
    fn reingest_with_new_sources_keeps_only_new_ids() {
        let story_id = story_row_id("budget");
        let before = source_ids_for(story_id, &[source("https://a.test/1", None), source("https://b.test/1", None)]);
        let after = source_ids_for(story_id, &[source("https://b.test/1", None), source("https://c.test/1", None)]);
        let stale = before.iter().filter(|id| !after.contains(id)).collect::<Vec<_>>();
        assert_eq!(stale, vec![&source_article_id(story_id, "https://a.test/1")]);
        assert_eq!(after[0], before[1]);
    }

    #[test]
    fn ownership_chain_splits_owners_and_keeps_category_on_top() {
        let chain = parse_ownership_chain("Fox News Media, owned by Fox Corporation (Media Conglomerates)");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].name, "Fox News Media");
        assert_eq!(chain[0].category, None);
        assert_eq!(chain[1].name, "Fox Corporation");
        assert_eq!(chain[1].depth, 1);
        assert_eq!(chain[1].category.as_deref(), Some("Media Conglomerates"));

        let single = parse_ownership_chain("Thomson Reuters Corporation (Corporation)");
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].category.as_deref(), Some("Corporation"));
    }

    #[test]
    fn ownership_chain_ignores_unknown_and_bare_category() {
        assert!(parse_ownership_chain("Unknown").is_empty());
        assert!(parse_ownership_chain("").is_empty());
        assert!(parse_ownership_chain("(Government)").is_empty());
        let plain = parse_ownership_chain("Public (listed on NYSE)");
        assert_eq!(plain[0].name, "Public (listed on NYSE)");
    }

    #[test]
    fn related_edges_rank_topic_over_tags_and_cap() {
        let mut batch = vec![story("a", Some("Politics"), &["budget", "council"])];
        batch.push(story("b", Some("politics"), &[]));
        batch.push(story("c", None, &["Budget", "council"]));
        batch.push(story("d", None, &["budget"]));
        for i in 0..6 {
            batch.push(story(&format!("z{i}"), None, &["council"]));
        }

        let edges = related_edges(&batch.iter().collect::<Vec<_>>());
        let from_a = edges.iter().filter(|e| e.from_slug == "a").collect::<Vec<_>>();
        assert_eq!(from_a.len(), RELATED_LIMIT);
        assert_eq!(from_a[0].to_slug, "b");
        assert_eq!(from_a[0].score, TOPIC_WEIGHT);
        assert_eq!(from_a[1].to_slug, "c");
        assert_eq!(from_a[1].score, 2);
        assert_eq!(from_a[2].to_slug, "d");
        assert!(edges.iter().all(|e| e.from_slug != e.to_slug));
    }

    #[test]
    fn explicit_relations_come_first_and_are_not_duplicated() {
        let mut a = story("a", Some("Politics"), &[]);
        a.related = vec![
            RelatedRef { slug: "b".into(), reason: "follow-up".into() },
            RelatedRef { slug: "a".into(), reason: "self".into() },
            RelatedRef { slug: "outside".into(), reason: "series".into() },
        ];
        let b = story("b", Some("Politics"), &[]);
        let edges = related_edges(&[&a, &b]);
        let from_a = edges.iter().filter(|e| e.from_slug == "a").collect::<Vec<_>>();
        assert_eq!(from_a.len(), 2);
        assert_eq!(from_a[0].reason, "follow-up");
        assert_eq!(from_a[1].to_slug, "outside");
    }

    #[test]
    fn outlet_slug_falls_back_to_name() {
        let mut draft = OutletDraft::new("The Daily Planet", None);
        assert_eq!(outlet_slug(&draft), "the-daily-planet");
        draft.slug.clear();
        assert_eq!(outlet_slug(&draft), "the-daily-planet");
        assert_ne!(outlet_row_id("a"), story_row_id("a"));
    }

    #[test]
    fn child_rows_map_to_tables() {
        assert_eq!(ChildRows::Timeline(&[]).table(), "story_timeline_items");
        assert_eq!(ChildRows::Snapshot(None).table(), "story_snapshots");
    }
}
