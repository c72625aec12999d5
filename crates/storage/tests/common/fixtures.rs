use std::sync::Arc;
use tempfile::TempDir;
use weave_core::collection::CollectionIds;
use weave_core::config::{DatabaseConfig, QuotaConfig};
use weave_core::{ItemUpdate, Timestamp};
use weave_storage::{CachedStorage, SqlStorage, StorageResult, SyncStorage};

use super::mocks::FlakyCache;

/// A storage engine under test, optionally behind a cache overlay.
#[allow(dead_code)]
pub struct TestStorage {
    pub sql: Arc<SqlStorage>,
    pub cache: Option<Arc<FlakyCache>>,
    storage: Arc<dyn SyncStorage>,
    _temp_dir: Option<TempDir>,
}

#[allow(dead_code)]
impl TestStorage {
    /// In-memory SQLite, no cache.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::with_database(DatabaseConfig::for_testing(), QuotaConfig::default()).await
    }

    /// In-memory SQLite with `shards` item tables.
    pub async fn sharded(shards: u32) -> StorageResult<Self> {
        let config = DatabaseConfig {
            shard: true,
            shard_count: shards,
            ..DatabaseConfig::for_testing()
        };
        Self::with_database(config, QuotaConfig::default()).await
    }

    /// In-memory SQLite using a fixed collection id table.
    pub async fn with_regime(collection_ids: CollectionIds) -> StorageResult<Self> {
        let config = DatabaseConfig {
            collection_ids,
            ..DatabaseConfig::for_testing()
        };
        Self::with_database(config, QuotaConfig::default()).await
    }

    /// SQLite file in a temporary directory.
    pub async fn on_disk() -> StorageResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let path = temp_dir.path().join("weave.db");
        let config = DatabaseConfig {
            url: format!("sqlite://{}?mode=rwc", path.display()),
            ..DatabaseConfig::for_testing()
        };
        let mut storage = Self::with_database(config, QuotaConfig::default()).await?;
        storage._temp_dir = Some(temp_dir);
        Ok(storage)
    }

    pub async fn with_database(config: DatabaseConfig, quota: QuotaConfig) -> StorageResult<Self> {
        let sql = Arc::new(SqlStorage::new(&config, quota).await?);
        Ok(Self {
            storage: sql.clone(),
            sql,
            cache: None,
            _temp_dir: None,
        })
    }

    /// In-memory SQLite behind a cache overlay backed by a [`FlakyCache`].
    pub async fn cached() -> StorageResult<Self> {
        Self::cached_with_quota(QuotaConfig::default()).await
    }

    pub async fn cached_with_quota(quota: QuotaConfig) -> StorageResult<Self> {
        let sql = Arc::new(SqlStorage::new(&DatabaseConfig::for_testing(), quota).await?);
        let cache = FlakyCache::new();
        let storage = Arc::new(CachedStorage::new(sql.clone(), cache.clone()));
        Ok(Self {
            sql,
            cache: Some(cache),
            storage,
            _temp_dir: None,
        })
    }

    /// The engine under test: the overlay when cached, SQL otherwise.
    pub fn store(&self) -> Arc<dyn SyncStorage> {
        self.storage.clone()
    }

    pub fn cache(&self) -> &Arc<FlakyCache> {
        self.cache.as_ref().expect("storage has no cache")
    }
}

/// Quota enabled with `size_kb` kilobytes.
#[allow(dead_code)]
pub fn quota(size_kb: u64) -> QuotaConfig {
    QuotaConfig {
        enabled: true,
        size_kb,
        recalculation_secs: 3600,
    }
}

/// An item with an id and a payload of `len` bytes.
#[allow(dead_code)]
pub fn item(id: &str, len: usize) -> ItemUpdate {
    ItemUpdate::with_id(id).payload("x".repeat(len))
}

/// Assert a timestamp lies within `slack_secs` of now.
#[allow(dead_code)]
pub fn assert_recent(ts: Timestamp, slack_secs: f64) {
    let delta = (Timestamp::now().as_f64() - ts.as_f64()).abs();
    assert!(delta <= slack_secs, "timestamp {ts:?} is {delta}s away from now");
}
