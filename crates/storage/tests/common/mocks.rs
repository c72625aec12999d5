use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use weave_cache::{CacheBackend, CacheError, CacheResult, MemoryCache};

/// In-process cache that can be switched off to simulate an outage.
///
/// While down, every call fails with `CacheError::Unavailable` and is counted.
#[allow(dead_code)]
pub struct FlakyCache {
    inner: MemoryCache,
    down: AtomicBool,
    slow_reads: AtomicBool,
    failed_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryCache::new(None),
            down: AtomicBool::new(false),
            slow_reads: AtomicBool::new(false),
            failed_calls: AtomicUsize::new(0),
        })
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn come_back(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    /// Make every read yield to the scheduler once before answering, so
    /// concurrent callers interleave between read and write.
    pub fn slow_reads(&self) {
        self.slow_reads.store(true, Ordering::SeqCst);
    }

    pub fn failed_calls(&self) -> usize {
        self.failed_calls.load(Ordering::SeqCst)
    }

    /// Read a key directly, bypassing the outage switch.
    pub async fn peek(&self, key: &str) -> Option<Bytes> {
        self.inner.get(key).await.ok().flatten()
    }

    /// Read a JSON value directly, bypassing the outage switch.
    pub async fn peek_json(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.peek(key).await?;
        serde_json::from_slice(&raw).ok()
    }

    /// Remove a key directly, bypassing the outage switch.
    pub async fn delete_key(&self, key: &str) {
        let _ = self.inner.delete(key).await;
    }

    fn check(&self) -> CacheResult<()> {
        if self.down.load(Ordering::SeqCst) {
            self.failed_calls.fetch_add(1, Ordering::SeqCst);
            return Err(CacheError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FlakyCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        self.check()?;
        if self.slow_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
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
        self.check()?;
        self.inner.health_check().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
