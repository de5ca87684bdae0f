use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use worksync_core::{Record, SourceTier, UpsertOutcome, SENTINEL_TAG};
use worksync_storage::{MemoryWorkStore, StorageError, StoredWork, WorkStore};
use worksync_sync::{IdentifierSet, SyncConfig, SyncError, SyncService, TriggerOutcome, TriggerSource};

#[derive(Clone)]
struct Upstream {
    like_count: Arc<AtomicU32>,
}

async fn primary_down() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn primary_hangs() -> Response {
    tokio::time::sleep(Duration::from_secs(30)).await;
    (StatusCode::INTERNAL_SERVER_ERROR, "too late").into_response()
}

async fn item_page(State(upstream): State<Upstream>, Path(id): Path<String>) -> Response {
    match id.as_str() {
        "6345" => {}
        "empty-body" => return StatusCode::NO_CONTENT.into_response(),
        _ => return (StatusCode::NOT_FOUND, "missing").into_response(),
    }
    let likes = upstream.like_count.load(Ordering::SeqCst);
    Html(format!(
        r#"<html><head>
<title>Example Work | SiteName</title>
<meta name="description" content="A cool project">
</head><body><span data-like-count="{likes}"></span></body></html>"#
    ))
    .into_response()
}

struct Harness {
    addr: SocketAddr,
    like_count: Arc<AtomicU32>,
    _catalog_dir: tempfile::TempDir,
    catalog_path: PathBuf,
}

impl Harness {
    async fn start(catalog_ids: &[&str]) -> Self {
        Self::start_with(catalog_ids, false).await
    }

    async fn start_with(catalog_ids: &[&str], primary_hangs_up: bool) -> Self {
        let like_count = Arc::new(AtomicU32::new(3));
        let primary = if primary_hangs_up {
            get(primary_hangs)
        } else {
            get(primary_down)
        };
        let app = Router::new()
            .route("/api/works", primary)
            .route("/prototype/{id}", get(item_page))
            .with_state(Upstream {
                like_count: like_count.clone(),
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let catalog_dir = tempfile::tempdir().unwrap();
        let catalog_path = catalog_dir.path().join("catalog.yaml");
        let works = catalog_ids
            .iter()
            .map(|id| format!("  - \"{id}\"\n"))
            .collect::<String>();
        std::fs::write(&catalog_path, format!("works:\n{works}")).unwrap();

        Self {
            addr,
            like_count,
            _catalog_dir: catalog_dir,
            catalog_path,
        }
    }

    fn config(&self) -> SyncConfig {
        SyncConfig {
            catalog_path: self.catalog_path.clone(),
            primary_url_template: format!("http://{}/api/works?id={{id}}", self.addr),
            page_url_template: format!("http://{}/prototype/{{id}}", self.addr),
            http_timeout_secs: 5,
            request_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn service(&self, store: Arc<dyn WorkStore>) -> SyncService {
        SyncService::from_config(&self.config(), store).unwrap()
    }

    fn page_url(&self, id: &str) -> String {
        format!("http://{}/prototype/{id}", self.addr)
    }
}

#[tokio::test]
async fn primary_failure_falls_back_to_item_page() {
    let harness = Harness::start(&["6345"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    let report = service.run_now(TriggerSource::Manual).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.by_source.get(&SourceTier::Secondary), Some(&1));
    assert_eq!(report.seeded, 0);

    let row = store.find("6345").await.unwrap().unwrap();
    assert_eq!(row.record.title, "Example Work");
    assert_eq!(row.record.summary, "A cool project");
    assert_eq!(row.record.tags, vec![SENTINEL_TAG.to_string()]);
    assert_eq!(row.record.url, harness.page_url("6345"));
    assert_eq!(row.record.like_count, 3);
    assert!(!service.is_running());
}

#[tokio::test]
async fn rerun_updates_only_mutable_fields() {
    let harness = Harness::start(&["6345"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    service.run_now(TriggerSource::Manual).await.unwrap();
    let first = store.find("6345").await.unwrap().unwrap();

    harness.like_count.store(11, Ordering::SeqCst);
    let report = service.run_now(TriggerSource::Schedule).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.inserted, 0);

    let second = store.find("6345").await.unwrap().unwrap();
    assert_eq!(second.record.like_count, 11);
    assert_eq!(second.record.title, first.record.title);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn repeated_passes_are_idempotent() {
    let harness = Harness::start(&["6345", "6345"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    service.run_now(TriggerSource::Manual).await.unwrap();
    let once = store.snapshot().await;
    service.run_now(TriggerSource::Manual).await.unwrap();
    let twice = store.snapshot().await;

    assert_eq!(once.len(), 1);
    assert_eq!(once[0].record, twice[0].record);
    assert_eq!(once[0].created_at, twice[0].created_at);
}

#[tokio::test]
async fn fallback_is_skipped_when_store_has_rows() {
    let harness = Harness::start(&["menfugu"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    store
        .upsert(&Record::new("existing", harness.page_url("existing")))
        .await
        .unwrap();
    let service = harness.service(store.clone());

    let report = service.run_now(TriggerSource::Manual).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.seeded, 0);
    assert!(store.find("menfugu").await.unwrap().is_none());
}

#[tokio::test]
async fn fallback_answers_when_store_is_empty() {
    let harness = Harness::start(&["menfugu", "6345"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    let report = service.run_now(TriggerSource::Startup).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.by_source.get(&SourceTier::Fallback), Some(&1));
    assert_eq!(report.by_source.get(&SourceTier::Secondary), Some(&1));
    assert_eq!(report.seeded, 0);
    assert_eq!(store.find("menfugu").await.unwrap().unwrap().record.title, "めんふぐ");
}

#[tokio::test]
async fn empty_store_is_seeded_when_nothing_persisted() {
    let harness = Harness::start(&["9999"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    let report = service.run_now(TriggerSource::Startup).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.seeded, 4);
    assert_eq!(store.count().await.unwrap(), 4);

    let again = service.run_now(TriggerSource::Startup).await.unwrap();
    assert_eq!(again.seeded, 0);
}

struct BrokenStore;

#[async_trait]
impl WorkStore for BrokenStore {
    async fn upsert(&self, _record: &Record) -> Result<UpsertOutcome, StorageError> {
        Err(StorageError::Unavailable("disk on fire".to_string()))
    }

    async fn insert_if_absent(&self, _record: &Record) -> Result<bool, StorageError> {
        Err(StorageError::Unavailable("disk on fire".to_string()))
    }

    async fn count(&self) -> Result<i64, StorageError> {
        Err(StorageError::Unavailable("disk on fire".to_string()))
    }

    async fn find(&self, _external_id: &str) -> Result<Option<StoredWork>, StorageError> {
        Ok(None)
    }
}

#[tokio::test]
async fn storage_failures_are_counted_per_item() {
    let harness = Harness::start(&["6345", "menfugu"]).await;
    let service = harness.service(Arc::new(BrokenStore));

    let report = service.run_now(TriggerSource::Manual).await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 2);
    assert_eq!(report.seeded, 0);
    assert!(!service.is_running());
}

#[tokio::test]
async fn concurrent_trigger_is_rejected_and_flag_clears() {
    let harness = Harness::start(&["6345"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    let service = harness.service(store.clone());

    let permit = service.orchestrator().single_flight().try_acquire().unwrap();
    assert!(matches!(service.trigger(TriggerSource::Manual), TriggerOutcome::AlreadyRunning));

    let ids: IdentifierSet = ["6345"].into_iter().collect();
    assert!(matches!(
        service.orchestrator().run_sync_pass(TriggerSource::Manual, &ids).await,
        Err(SyncError::AlreadyRunning)
    ));
    assert_eq!(store.count().await.unwrap(), 0);

    drop(permit);
    let report = service
        .orchestrator()
        .run_sync_pass(TriggerSource::Schedule, &ids)
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.trigger, TriggerSource::Schedule);
    assert!(!service.is_running());
}

#[tokio::test]
async fn missing_catalog_reports_error_and_releases_guard() {
    let harness = Harness::start(&["6345"]).await;
    let mut config = harness.config();
    config.catalog_path = harness.catalog_path.with_file_name("absent.yaml");
    let service = SyncService::from_config(&config, Arc::new(MemoryWorkStore::new())).unwrap();

    let err = service.run_now(TriggerSource::Manual).await.unwrap_err();
    assert!(matches!(err, SyncError::Catalog(_)));
    assert!(!service.is_running());
}

#[tokio::test]
async fn hung_primary_is_cut_off_by_client_timeout() {
    let harness = Harness::start_with(&["6345"], true).await;
    let store = Arc::new(MemoryWorkStore::new());
    let config = SyncConfig {
        http_timeout_secs: 1,
        ..harness.config()
    };
    let service = SyncService::from_config(&config, store.clone()).unwrap();

    let started = Instant::now();
    let report = service.run_now(TriggerSource::Manual).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10), "pass took {:?}", started.elapsed());
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.by_source.get(&SourceTier::Secondary), Some(&1));
    assert_eq!(store.find("6345").await.unwrap().unwrap().record.title, "Example Work");
}

#[tokio::test]
async fn non_200_success_status_on_item_page_is_a_failure() {
    let harness = Harness::start(&["empty-body"]).await;
    let store = Arc::new(MemoryWorkStore::new());
    store
        .upsert(&Record::new("existing", harness.page_url("existing")))
        .await
        .unwrap();
    let service = harness.service(store.clone());

    let report = service.run_now(TriggerSource::Manual).await.unwrap();
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 1);
    assert!(store.find("empty-body").await.unwrap().is_none());
}
