use serde_json::{Value, json};
use std::sync::Arc;
use weave_core::Timestamp;
use weave_core::config::{BatchConfig, DatabaseConfig, QuotaConfig};
use weave_server::{StorageController, SyncRequest, SyncResponse};
use weave_storage::{CachedStorage, SqlStorage, SyncStorage};

use super::mocks::OfflineCache;

/// Controller over in-memory SQLite, optionally behind a cache overlay.
#[allow(dead_code)]
pub struct TestController {
    pub controller: StorageController,
    pub storage: Arc<dyn SyncStorage>,
    pub cache: Option<Arc<OfflineCache>>,
    /// The SQL engine behind the overlay, for writes the cache never sees.
    pub sql: Option<Arc<dyn SyncStorage>>,
}

#[allow(dead_code)]
impl TestController {
    pub async fn new() -> Self {
        Self::with_quota(QuotaConfig::default()).await
    }

    pub async fn with_quota(quota: QuotaConfig) -> Self {
        let sql = SqlStorage::new(&DatabaseConfig::for_testing(), quota)
            .await
            .expect("Failed to open test database");
        let storage: Arc<dyn SyncStorage> = Arc::new(sql);
        Self {
            controller: StorageController::new(storage.clone(), BatchConfig::default()),
            storage,
            cache: None,
            sql: None,
        }
    }

    pub async fn cached() -> Self {
        Self::cached_with_quota(QuotaConfig::default()).await
    }

    pub async fn cached_with_quota(quota: QuotaConfig) -> Self {
        let sql = SqlStorage::new(&DatabaseConfig::for_testing(), quota)
            .await
            .expect("Failed to open test database");
        let sql: Arc<dyn SyncStorage> = Arc::new(sql);
        let cache = OfflineCache::new();
        let storage: Arc<dyn SyncStorage> = Arc::new(CachedStorage::new(sql.clone(), cache.clone()));
        Self {
            controller: StorageController::new(storage.clone(), BatchConfig::default()),
            storage,
            cache: Some(cache),
            sql: Some(sql),
        }
    }

    pub fn cache(&self) -> &Arc<OfflineCache> {
        self.cache.as_ref().expect("controller has no cache")
    }

    /// Store `items` in `collection` through the controller.
    pub async fn post(&self, collection: &str, items: Value, at: Timestamp) -> SyncResponse {
        let request = request(collection)
            .body(items.to_string())
            .at(at);
        self.controller
            .set_collection(&request)
            .await
            .expect("batch write failed")
    }
}

/// A request from user 1 against `collection`.
#[allow(dead_code)]
pub fn request(collection: &str) -> SyncRequest {
    SyncRequest::new(1).collection(collection)
}

/// `count` items `"{prefix}{n}"` with `len`-byte payloads.
#[allow(dead_code)]
pub fn items(prefix: &str, count: usize, len: usize) -> Value {
    let payload = "x".repeat(len);
    Value::Array(
        (0..count)
            .map(|n| json!({"id": format!("{prefix}{n}"), "payload": payload}))
            .collect(),
    )
}

#[allow(dead_code)]
pub fn quota(size_kb: u64) -> QuotaConfig {
    QuotaConfig {
        enabled: true,
        size_kb,
        recalculation_secs: 3600,
    }
}

#[allow(dead_code)]
pub fn body(response: &SyncResponse) -> Value {
    response.json_body().expect("response body is not JSON")
}
