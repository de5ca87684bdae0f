//! Canonical work record and tier types shared across worksync crates.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "worksync-core";

/// Tag attached when an upstream supplies none, marking where the record came from.
pub const SENTINEL_TAG: &str = "Protopedia";

/// Separator between the work title and the site name in page titles.
pub const TITLE_SUFFIX_DELIMITER: &str = " | ";

/// Placeholder replaced by the external identifier in URL templates.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Upstream tiers ordered by trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    Primary,
    Secondary,
    Fallback,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Primary => "primary",
            SourceTier::Secondary => "secondary",
            SourceTier::Fallback => "fallback",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of persisting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Canonical work as produced by a single fetch attempt.
///
/// Empty `title`/`summary` strings mean the source had nothing for that field.
/// Timestamps owned by storage are not part of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub external_id: String,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub like_count: u32,
    pub published_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl Record {
    /// Starts a record with every optional field at its absence marker.
    pub fn new(external_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            title: String::new(),
            summary: String::new(),
            url: url.into(),
            thumbnail_url: None,
            like_count: 0,
            published_at: None,
            tags: vec![SENTINEL_TAG.to_string()],
        }
    }

    pub fn with_title(mut self, raw_title: &str) -> Self {
        self.title = normalize_title(raw_title);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_url: impl Into<String>) -> Self {
        self.thumbnail_url = non_empty(thumbnail_url.into());
        self
    }

    pub fn with_like_count(mut self, like_count: i64) -> Self {
        self.like_count = clamp_like_count(like_count);
        self
    }

    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    /// True when extraction found nothing beyond the identifier.
    pub fn is_degraded(&self) -> bool {
        self.title.is_empty() && self.summary.is_empty() && self.thumbnail_url.is_none()
    }
}

/// Strips the site-name suffix so template changes do not alter the stored title.
pub fn normalize_title(raw: &str) -> String {
    raw.split(TITLE_SUFFIX_DELIMITER)
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Drops blank tags, keeps order, and falls back to the sentinel when nothing is left.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tags = tags
        .into_iter()
        .map(Into::into)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    if tags.is_empty() {
        vec![SENTINEL_TAG.to_string()]
    } else {
        tags
    }
}

pub fn clamp_like_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Expands a URL template such as `https://example.net/prototype/{id}`.
pub fn derive_work_url(template: &str, external_id: &str) -> String {
    if template.contains(ID_PLACEHOLDER) {
        template.replace(ID_PLACEHOLDER, external_id)
    } else {
        format!("{}/{}", template.trim_end_matches('/'), external_id)
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
