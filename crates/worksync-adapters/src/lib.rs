//! Record extraction and the degrading source chain for worksync.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use worksync_core::{derive_work_url, parse_published_at, Record, SourceTier};
use worksync_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "worksync-adapters";

const EMBEDDED_FALLBACK_WORKS: &str = include_str!("../data/fallback_works.json");

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("work {external_id} not present in payload")]
    MissingItem { external_id: String },
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
struct ApiWorksEnvelope {
    works: Vec<ApiWork>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ApiId {
    Text(String),
    Number(i64),
}

impl fmt::Display for ApiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiId::Text(s) => f.write_str(s),
            ApiId::Number(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiWork {
    id: ApiId,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    main_image: Option<String>,
    #[serde(default)]
    like_count: Option<i64>,
    #[serde(default)]
    published_at: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl ApiWork {
    fn into_record(self, url: String) -> Record {
        let published_at = self.published_at.as_deref().and_then(parse_published_at);
        Record::new(self.id.to_string(), url)
            .with_title(self.title.as_deref().unwrap_or_default())
            .with_summary(self.description.unwrap_or_default())
            .with_thumbnail(self.main_image.unwrap_or_default())
            .with_like_count(self.like_count.unwrap_or(0))
            .with_published_at(published_at)
            .with_tags(self.tags.unwrap_or_default())
    }
}

fn parse_envelope(body: &str) -> Result<ApiWorksEnvelope, ExtractionError> {
    serde_json::from_str(body).map_err(|e| ExtractionError::Malformed(e.to_string()))
}

/// Picks `external_id` out of a `{ "works": [...] }` payload.
pub fn extract_json(body: &str, external_id: &str, url: &str) -> Result<Record, ExtractionError> {
    parse_envelope(body)?
        .works
        .into_iter()
        .find(|w| w.id.to_string() == external_id)
        .map(|w| w.into_record(url.to_string()))
        .ok_or_else(|| ExtractionError::MissingItem {
            external_id: external_id.to_string(),
        })
}

/// Identifiers reported by a listing payload, in upstream order.
pub fn list_work_ids(body: &str) -> Result<Vec<String>, ExtractionError> {
    Ok(parse_envelope(body)?
        .works
        .into_iter()
        .map(|w| w.id.to_string())
        .collect())
}

/// Returns the text strictly between the first `start` and the next `end`,
/// or an empty string when either anchor is missing.
pub fn extract_between(text: &str, start: &str, end: &str) -> String {
    let Some(start_idx) = text.find(start) else {
        return String::new();
    };
    let rest = &text[start_idx + start.len()..];
    match rest.find(end) {
        Some(end_idx) => rest[..end_idx].to_string(),
        None => String::new(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorPair {
    pub start: String,
    pub end: String,
}

impl AnchorPair {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    fn extract(&self, text: &str) -> String {
        extract_between(text, &self.start, &self.end)
    }
}

/// Where each field lives in an item page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupAnchors {
    pub title: AnchorPair,
    pub description: AnchorPair,
    pub image: AnchorPair,
    pub like_count_selector: String,
    pub like_count_attr: String,
    pub published_at_selector: String,
    pub tags_selector: String,
}

impl Default for MarkupAnchors {
    fn default() -> Self {
        Self {
            title: AnchorPair::new("<title>", "</title>"),
            description: AnchorPair::new(r#"<meta name="description" content=""#, "\""),
            image: AnchorPair::new(r#"<meta property="og:image" content=""#, "\""),
            like_count_selector: "[data-like-count]".to_string(),
            like_count_attr: "data-like-count".to_string(),
            published_at_selector: r#"meta[property="article:published_time"]"#.to_string(),
            tags_selector: ".tag-list a".to_string(),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractionError> {
    Selector::parse(selector).map_err(|e| ExtractionError::InvalidSelector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Pulls a record out of an item page. Missing fields are never an error.
#[derive(Debug, Clone)]
pub struct MarkupExtractor {
    anchors: MarkupAnchors,
    like_count: Selector,
    published_at: Selector,
    tags: Selector,
}

impl MarkupExtractor {
    pub fn new(anchors: MarkupAnchors) -> Result<Self, ExtractionError> {
        Ok(Self {
            like_count: parse_selector(&anchors.like_count_selector)?,
            published_at: parse_selector(&anchors.published_at_selector)?,
            tags: parse_selector(&anchors.tags_selector)?,
            anchors,
        })
    }

    /// Anchor pass followed by selector enrichment.
    pub fn extract(&self, body: &str, external_id: &str, url: &str) -> Record {
        let base = extract_anchored(body, external_id, url, &self.anchors);
        let document = Html::parse_document(body);

        let like_count = document
            .select(&self.like_count)
            .next()
            .and_then(|n| n.value().attr(&self.anchors.like_count_attr))
            .and_then(parse_count);
        let published_at = document
            .select(&self.published_at)
            .next()
            .and_then(|n| n.value().attr("content"))
            .and_then(parse_published_at);
        let tags = document
            .select(&self.tags)
            .map(|n| n.text().collect::<String>())
            .collect::<Vec<_>>();

        base.with_like_count(like_count.unwrap_or(0))
            .with_published_at(published_at)
            .with_tags(tags)
    }
}

/// Anchor-only extraction with the default anchor pairs.
pub fn extract_markup(body: &str, external_id: &str, url: &str) -> Record {
    extract_anchored(body, external_id, url, &MarkupAnchors::default())
}

fn extract_anchored(body: &str, external_id: &str, url: &str, anchors: &MarkupAnchors) -> Record {
    Record::new(external_id, url)
        .with_title(&anchors.title.extract(body))
        .with_summary(anchors.description.extract(body))
        .with_thumbnail(anchors.image.extract(body))
}

/// Thousands separators are dropped; anything else unparseable yields `None`.
/// Negative values pass through and are clamped by the record builder.
fn parse_count(raw: &str) -> Option<i64> {
    raw.trim().replace(',', "").parse().ok()
}

// ---------------------------------------------------------------------------
// Tier failures
// ---------------------------------------------------------------------------

/// Observability classification only; never changes the fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transport,
    BadStatus,
    Malformed,
    Unavailable,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "transport",
            FailureKind::BadStatus => "bad-status",
            FailureKind::Malformed => "malformed",
            FailureKind::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{tier} tier failed ({kind}): {detail}")]
pub struct TierFailure {
    pub tier: SourceTier,
    pub kind: FailureKind,
    pub detail: String,
}

impl TierFailure {
    pub fn new(tier: SourceTier, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            tier,
            kind,
            detail: detail.into(),
        }
    }

    pub fn from_fetch(tier: SourceTier, err: &FetchError) -> Self {
        let kind = match err {
            FetchError::Transport(_) => FailureKind::Transport,
            FetchError::BadStatus { .. } => FailureKind::BadStatus,
        };
        let detail = if err.is_timeout() {
            format!("timed out: {err}")
        } else {
            err.to_string()
        };
        Self::new(tier, kind, detail)
    }

    pub fn from_extraction(tier: SourceTier, err: &ExtractionError) -> Self {
        Self::new(tier, FailureKind::Malformed, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("all sources failed for {external_id}")]
    AllSourcesFailed {
        external_id: String,
        attempts: Vec<TierFailure>,
    },
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn tier(&self) -> SourceTier;

    async fn fetch(&self, external_id: &str) -> Result<Record, TierFailure>;
}

/// Structured JSON endpoint.
#[derive(Debug, Clone)]
pub struct PrimaryApiSource {
    http: HttpFetcher,
    api_url_template: String,
    page_url_template: String,
}

impl PrimaryApiSource {
    pub fn new(
        http: HttpFetcher,
        api_url_template: impl Into<String>,
        page_url_template: impl Into<String>,
    ) -> Self {
        Self {
            http,
            api_url_template: api_url_template.into(),
            page_url_template: page_url_template.into(),
        }
    }

    /// One listing request, no pagination.
    pub async fn list_identifiers(&self, listing_url: &str) -> Result<Vec<String>, TierFailure> {
        let resp = self
            .http
            .fetch(listing_url)
            .await
            .map_err(|e| TierFailure::from_fetch(SourceTier::Primary, &e))?;
        list_work_ids(&resp.text()).map_err(|e| TierFailure::from_extraction(SourceTier::Primary, &e))
    }
}

#[async_trait]
impl RecordSource for PrimaryApiSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Primary
    }

    async fn fetch(&self, external_id: &str) -> Result<Record, TierFailure> {
        let api_url = derive_work_url(&self.api_url_template, external_id);
        let resp = self
            .http
            .fetch(&api_url)
            .await
            .map_err(|e| TierFailure::from_fetch(self.tier(), &e))?;
        let url = derive_work_url(&self.page_url_template, external_id);
        extract_json(&resp.text(), external_id, &url)
            .map_err(|e| TierFailure::from_extraction(self.tier(), &e))
    }
}

/// Per-item page with anchor extraction.
#[derive(Debug, Clone)]
pub struct ItemPageSource {
    http: HttpFetcher,
    page_url_template: String,
    extractor: MarkupExtractor,
}

impl ItemPageSource {
    pub fn new(http: HttpFetcher, page_url_template: impl Into<String>, extractor: MarkupExtractor) -> Self {
        Self {
            http,
            page_url_template: page_url_template.into(),
            extractor,
        }
    }
}

#[async_trait]
impl RecordSource for ItemPageSource {
    fn tier(&self) -> SourceTier {
        SourceTier::Secondary
    }

    async fn fetch(&self, external_id: &str) -> Result<Record, TierFailure> {
        let url = derive_work_url(&self.page_url_template, external_id);
        let resp = self
            .http
            .fetch(&url)
            .await
            .map_err(|e| TierFailure::from_fetch(self.tier(), &e))?;
        if resp.status.as_u16() != 200 {
            return Err(TierFailure::new(
                self.tier(),
                FailureKind::BadStatus,
                format!("http status {} for {}", resp.status.as_u16(), resp.final_url),
            ));
        }
        let record = self.extractor.extract(&resp.text(), external_id, &url);
        if record.is_degraded() {
            warn!(external_id, "item page yielded no fields; accepting degraded record");
        }
        Ok(record)
    }
}

/// Static dataset keyed by a small closed set of identifiers.
#[derive(Debug, Clone, Default)]
pub struct FallbackDataset {
    entries: BTreeMap<String, Record>,
}

impl FallbackDataset {
    pub fn embedded(page_url_template: &str) -> Result<Self, ExtractionError> {
        Self::from_json(EMBEDDED_FALLBACK_WORKS, page_url_template)
    }

    pub fn from_json(body: &str, page_url_template: &str) -> Result<Self, ExtractionError> {
        let records = parse_envelope(body)?.works.into_iter().map(|w| {
            let url = derive_work_url(page_url_template, &w.id.to_string());
            w.into_record(url)
        });
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            entries: records
                .into_iter()
                .map(|r| (r.external_id.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, external_id: &str) -> Option<&Record> {
        self.entries.get(external_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

/// Whether the static tier may answer during this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// The store was empty when the pass started.
    Allowed,
    Skipped,
}

/// A record together with the tier that produced it and the tiers passed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub record: Record,
    pub source: SourceTier,
    pub skipped: Vec<TierFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainState {
    TryPrimary,
    TrySecondary,
    TryFallback,
    Exhausted,
}

/// Tries tiers in trust order and stops at the first success.
pub struct SourceChain {
    primary: Box<dyn RecordSource>,
    secondary: Box<dyn RecordSource>,
    fallback: FallbackDataset,
}

impl SourceChain {
    pub fn new(
        primary: Box<dyn RecordSource>,
        secondary: Box<dyn RecordSource>,
        fallback: FallbackDataset,
    ) -> Self {
        Self {
            primary,
            secondary,
            fallback,
        }
    }

    pub fn fallback(&self) -> &FallbackDataset {
        &self.fallback
    }

    pub async fn resolve(&self, external_id: &str, policy: FallbackPolicy) -> Result<Resolved, ResolutionError> {
        let mut attempts = Vec::new();
        let mut state = ChainState::TryPrimary;

        loop {
            state = match state {
                ChainState::TryPrimary => match self.primary.fetch(external_id).await {
                    Ok(record) => return Ok(resolved(record, self.primary.tier(), attempts)),
                    Err(failure) => {
                        record_failure(external_id, &mut attempts, failure);
                        ChainState::TrySecondary
                    }
                },
                ChainState::TrySecondary => match self.secondary.fetch(external_id).await {
                    Ok(record) => return Ok(resolved(record, self.secondary.tier(), attempts)),
                    Err(failure) => {
                        record_failure(external_id, &mut attempts, failure);
                        ChainState::TryFallback
                    }
                },
                ChainState::TryFallback => {
                    match (policy, self.fallback.get(external_id)) {
                        (FallbackPolicy::Allowed, Some(record)) => {
                            info!(external_id, "using static fallback record");
                            return Ok(resolved(record.clone(), SourceTier::Fallback, attempts));
                        }
                        (FallbackPolicy::Allowed, None) => record_failure(
                            external_id,
                            &mut attempts,
                            TierFailure::new(
                                SourceTier::Fallback,
                                FailureKind::Unavailable,
                                "identifier not in fallback dataset",
                            ),
                        ),
                        (FallbackPolicy::Skipped, _) => record_failure(
                            external_id,
                            &mut attempts,
                            TierFailure::new(
                                SourceTier::Fallback,
                                FailureKind::Unavailable,
                                "store already populated",
                            ),
                        ),
                    }
                    ChainState::Exhausted
                }
                ChainState::Exhausted => {
                    return Err(ResolutionError::AllSourcesFailed {
                        external_id: external_id.to_string(),
                        attempts,
                    })
                }
            };
        }
    }
}

fn resolved(record: Record, source: SourceTier, skipped: Vec<TierFailure>) -> Resolved {
    Resolved {
        record,
        source,
        skipped,
    }
}

fn record_failure(external_id: &str, attempts: &mut Vec<TierFailure>, failure: TierFailure) {
    debug!(
        external_id,
        tier = %failure.tier,
        kind = %failure.kind,
        detail = %failure.detail,
        "tier failed"
    );
    attempts.push(failure);
}
