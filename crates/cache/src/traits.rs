//! Cache backend trait.

use crate::error::CacheResult;
use async_trait::async_trait;
use bytes::Bytes;

/// A shared key/value cache.
///
/// Values are opaque bytes. Entries may disappear at any time (eviction,
/// restart), so callers must treat every read as advisory.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value. `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>>;

    /// Store a value, replacing any previous one.
    async fn set(&self, key: &str, value: Bytes) -> CacheResult<()>;

    /// Remove a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Atomically add `delta` to a decimal counter.
    ///
    /// Returns the new value, or `None` if the key does not exist; a missing
    /// counter is never created.
    async fn incr(&self, key: &str, delta: u64) -> CacheResult<Option<u64>>;

    /// Check that the backend answers.
    async fn health_check(&self) -> CacheResult<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
