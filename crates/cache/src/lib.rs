//! Key/value cache backends for the weave storage overlay.
//!
//! This crate provides:
//! - The [`CacheBackend`] trait: get, set, delete and counter increments
//! - An in-process backend for single nodes and tests
//! - A memcached backend

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{memcached::MemcachedCache, memory::MemoryCache};
pub use error::{CacheError, CacheResult};
pub use traits::CacheBackend;

use std::sync::Arc;
use std::time::Duration;
use weave_core::config::CacheConfig;

/// Create a cache backend from configuration. `CacheConfig::None` yields `None`.
pub async fn from_config(config: &CacheConfig) -> CacheResult<Option<Arc<dyn CacheBackend>>> {
    config.validate().map_err(CacheError::Config)?;

    match config {
        CacheConfig::None => Ok(None),
        CacheConfig::Memory { ttl_secs } => {
            let ttl = (*ttl_secs > 0).then(|| Duration::from_secs(*ttl_secs));
            Ok(Some(Arc::new(MemoryCache::new(ttl))))
        }
        CacheConfig::Memcached {
            servers,
            pool_size,
            timeout_ms,
            ttl_secs,
        } => {
            let backend = MemcachedCache::connect(
                servers,
                *pool_size,
                Duration::from_millis(*timeout_ms),
                *ttl_secs,
            )
            .await?;
            Ok(Some(Arc::new(backend)))
        }
    }
}
