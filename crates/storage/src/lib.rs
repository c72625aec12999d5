//! Storage engine for weave sync collections.
//!
//! This crate provides:
//! - Repository traits for users, collections, items and quota
//! - A sharded SQL engine over SQLite, PostgreSQL and MySQL
//! - A cache overlay for `meta/global`, tabs, sizes and timestamps
//! - Storage metrics

pub mod cached;
pub mod error;
pub mod metrics;
pub mod models;
pub mod repos;
pub mod sql;
pub mod store;

pub use cached::CachedStorage;
pub use error::{StorageError, StorageResult};
pub use sql::SqlStorage;
pub use store::SyncStorage;

use std::sync::Arc;
use weave_cache::CacheError;
use weave_core::config::StorageConfig;

/// Create a storage engine from configuration.
///
/// The SQL engine is wrapped in a [`CachedStorage`] when a cache is
/// configured.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn SyncStorage>> {
    config.validate().map_err(StorageError::Config)?;

    let sql = Arc::new(SqlStorage::new(&config.database, config.quota.clone()).await?);
    let cache = weave_cache::from_config(&config.cache)
        .await
        .map_err(|e| match e {
            CacheError::Config(msg) => StorageError::Config(msg),
            other => StorageError::CacheUnavailable(other.to_string()),
        })?;

    match cache {
        Some(cache) => {
            tracing::info!(cache = cache.name(), "Storage cache overlay enabled");
            Ok(Arc::new(CachedStorage::new(sql, cache)))
        }
        None => Ok(sql),
    }
}
