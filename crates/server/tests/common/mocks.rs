use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use weave_cache::{CacheBackend, CacheError, CacheResult, MemoryCache};

/// Memory cache with an outage switch.
#[allow(dead_code)]
pub struct OfflineCache {
    inner: MemoryCache,
    down: AtomicBool,
}

#[allow(dead_code)]
impl OfflineCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCache::new(None),
            down: AtomicBool::new(false),
        })
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> CacheResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("cache offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for OfflineCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes) -> CacheResult<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn incr(&self, key: &str, delta: u64) -> CacheResult<Option<u64>> {
        self.check()?;
        self.inner.incr(key, delta).await
    }

    async fn health_check(&self) -> CacheResult<()> {
        self.check()
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}
