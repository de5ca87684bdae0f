//! Postgres persistence, bootstrap, and HTTP fetch utilities for worksync.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use worksync_core::{Record, UpsertOutcome};

pub const CRATE_NAME: &str = "worksync-storage";

pub const WORKS_TABLE: &str = "works";

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    BadStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport(err) if err.is_timeout())
    }
}

/// Single-shot GET client. Retries belong to the caller's schedule, not here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GETs `url`; any non-2xx status is returned as [`FetchError::BadStatus`].
    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::BadStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// A persisted row: the record plus storage-owned timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredWork {
    pub record: Record,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Unavailable(String),
}

/// Conflict-safe persistence keyed by `external_id`.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Inserts the record or merges it into the existing row.
    async fn upsert(&self, record: &Record) -> Result<UpsertOutcome, StorageError>;

    /// Inserts only when no row exists for the identifier; returns whether a row was written.
    async fn insert_if_absent(&self, record: &Record) -> Result<bool, StorageError>;

    async fn count(&self) -> Result<i64, StorageError>;

    async fn find(&self, external_id: &str) -> Result<Option<StoredWork>, StorageError>;
}

/// Merge law applied on conflict.
///
/// Mutable fields take the new value. `url` and `published_at` keep the stored
/// value when the new fetch did not supply one. `created_at` never moves.
pub fn merge_record(existing: &StoredWork, incoming: &Record, now: DateTime<Utc>) -> StoredWork {
    let previous = &existing.record;
    StoredWork {
        record: Record {
            external_id: previous.external_id.clone(),
            title: incoming.title.clone(),
            summary: incoming.summary.clone(),
            url: if incoming.url.is_empty() {
                previous.url.clone()
            } else {
                incoming.url.clone()
            },
            thumbnail_url: incoming.thumbnail_url.clone(),
            like_count: incoming.like_count,
            published_at: incoming.published_at.or(previous.published_at),
            tags: incoming.tags.clone(),
        },
        created_at: existing.created_at,
        updated_at: now,
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO works
        (external_id, title, summary, url, thumbnail_url, like_count, published_at, tags, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
    ON CONFLICT (external_id) DO UPDATE
       SET title         = EXCLUDED.title,
           summary       = EXCLUDED.summary,
           like_count    = EXCLUDED.like_count,
           thumbnail_url = EXCLUDED.thumbnail_url,
           tags          = EXCLUDED.tags,
           url           = COALESCE(NULLIF(EXCLUDED.url, ''), works.url),
           published_at  = COALESCE(EXCLUDED.published_at, works.published_at),
           updated_at    = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const INSERT_IF_ABSENT_SQL: &str = r#"
    INSERT INTO works
        (external_id, title, summary, url, thumbnail_url, like_count, published_at, tags, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
    ON CONFLICT (external_id) DO NOTHING
"#;

// Rails-managed schemas use `timestamp without time zone`; the casts make decoding
// independent of which migration created the table.
const FIND_SQL: &str = r#"
    SELECT external_id,
           title,
           COALESCE(summary, '') AS summary,
           COALESCE(url, '') AS url,
           thumbnail_url,
           COALESCE(like_count, 0) AS like_count,
           published_at::timestamptz AS published_at,
           COALESCE(tags, '[]'::jsonb) AS tags,
           created_at::timestamptz AS created_at,
           updated_at::timestamptz AS updated_at
      FROM works
     WHERE external_id = $1
"#;

#[derive(Debug, Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn like_count_param(record: &Record) -> i32 {
    i32::try_from(record.like_count).unwrap_or(i32::MAX)
}

fn stored_work_from_row(row: &PgRow) -> Result<StoredWork, sqlx::Error> {
    let like_count: i32 = row.try_get("like_count")?;
    let tags: Json<Vec<String>> = row.try_get("tags")?;
    Ok(StoredWork {
        record: Record {
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            summary: row.try_get("summary")?,
            url: row.try_get("url")?,
            thumbnail_url: row.try_get("thumbnail_url")?,
            like_count: u32::try_from(like_count.max(0)).unwrap_or_default(),
            published_at: row.try_get("published_at")?,
            tags: tags.0,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn upsert(&self, record: &Record) -> Result<UpsertOutcome, StorageError> {
        let row = sqlx::query(UPSERT_SQL)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.summary)
            .bind(&record.url)
            .bind(&record.thumbnail_url)
            .bind(like_count_param(record))
            .bind(record.published_at)
            .bind(Json(&record.tags))
            .fetch_one(&self.pool)
            .await?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn insert_if_absent(&self, record: &Record) -> Result<bool, StorageError> {
        let result = sqlx::query(INSERT_IF_ABSENT_SQL)
            .bind(&record.external_id)
            .bind(&record.title)
            .bind(&record.summary)
            .bind(&record.url)
            .bind(&record.thumbnail_url)
            .bind(like_count_param(record))
            .bind(record.published_at)
            .bind(Json(&record.tags))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count(&self) -> Result<i64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM works")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find(&self, external_id: &str) -> Result<Option<StoredWork>, StorageError> {
        let row = sqlx::query(FIND_SQL)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(stored_work_from_row).transpose()?)
    }
}

/// In-process store with the same merge law; backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryWorkStore {
    rows: Mutex<BTreeMap<String, StoredWork>>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<StoredWork> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn upsert(&self, record: &Record) -> Result<UpsertOutcome, StorageError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        match rows.get(&record.external_id) {
            Some(existing) => {
                let merged = merge_record(existing, record, now);
                rows.insert(record.external_id.clone(), merged);
                Ok(UpsertOutcome::Updated)
            }
            None => {
                rows.insert(
                    record.external_id.clone(),
                    StoredWork {
                        record: record.clone(),
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert_if_absent(&self, record: &Record) -> Result<bool, StorageError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&record.external_id) {
            return Ok(false);
        }
        rows.insert(
            record.external_id.clone(),
            StoredWork {
                record: record.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn count(&self) -> Result<i64, StorageError> {
        Ok(self.rows.lock().await.len() as i64)
    }

    async fn find(&self, external_id: &str) -> Result<Option<StoredWork>, StorageError> {
        Ok(self.rows.lock().await.get(external_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Opens a pool, retrying until the database answers or the budget is spent.
pub async fn connect_with_retry(database_url: &str, backoff: BackoffPolicy) -> anyhow::Result<PgPool> {
    let attempts = backoff.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let result = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await;
        match result {
            Ok(pool) => {
                info!(attempt = attempt + 1, "connected to database");
                return Ok(pool);
            }
            Err(err) => {
                warn!(attempt = attempt + 1, attempts, error = %err, "waiting for database");
                last_error = Some(err);
                if attempt + 1 < attempts {
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    match last_error {
        Some(err) => Err(err).with_context(|| format!("database unreachable after {attempts} attempts")),
        None => anyhow::bail!("database unreachable after {attempts} attempts"),
    }
}

pub async fn works_table_exists(pool: &PgPool) -> Result<bool, StorageError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name = $1)",
    )
    .bind(WORKS_TABLE)
    .fetch_one(pool)
    .await?;
    Ok(exists)
}

/// Polls for the `works` table. Returns `false` when it never appeared; callers
/// keep running and let per-item writes fail until the schema lands.
pub async fn wait_for_schema(pool: &PgPool, attempts: usize, delay: Duration) -> bool {
    let attempts = attempts.max(1);
    for attempt in 0..attempts {
        match works_table_exists(pool).await {
            Ok(true) => {
                info!("table 'works' found");
                return true;
            }
            Ok(false) => {
                info!(attempt = attempt + 1, attempts, "table 'works' not ready yet");
            }
            Err(err) => {
                warn!(attempt = attempt + 1, attempts, error = %err, "schema probe failed");
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    warn!("table 'works' still missing; syncs will fail per item until it exists");
    false
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
