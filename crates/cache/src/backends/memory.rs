//! In-process cache backend.

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheBackend;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::time::{Duration, Instant};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Cache kept in a concurrent map inside the process.
///
/// Suitable for single-node deployments and tests.
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    /// Create a cache whose entries expire after `ttl` (`None` for never).
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let expires_at = self.expiry();
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, e)| e.is_live(now)))
    }

    async fn incr(&self, key: &str, delta: u64) -> CacheResult<Option<u64>> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(_) => Ok(None),
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_live(now) {
                    occupied.remove();
                    return Ok(None);
                }
                let current = std::str::from_utf8(&occupied.get().value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| {
                        CacheError::Protocol(format!("value of '{key}' is not a counter"))
                    })?;
                let next = current.saturating_add(delta);
                occupied.get_mut().value = Bytes::from(next.to_string());
                Ok(Some(next))
            }
        }
    }

    async fn health_check(&self) -> CacheResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
