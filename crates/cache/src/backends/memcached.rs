//! Memcached cache backend.
//!
//! The `memcache` client is synchronous, so every call runs on the blocking
//! thread pool. Connections are pooled per server by the client itself.

use crate::error::{CacheError, CacheResult};
use crate::traits::CacheBackend;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Cache backed by one or more memcached servers.
pub struct MemcachedCache {
    client: Arc<memcache::Client>,
    expiration: u32,
}

impl MemcachedCache {
    /// Connect to `servers` (`host:port` or `memcache://host:port`).
    pub async fn connect(
        servers: &[String],
        pool_size: u32,
        timeout: Duration,
        ttl_secs: u64,
    ) -> CacheResult<Self> {
        if servers.is_empty() {
            return Err(CacheError::Config(
                "memcached requires at least one server".to_string(),
            ));
        }
        let urls: Vec<String> = servers.iter().map(|s| server_url(s)).collect();
        let expiration = u32::try_from(ttl_secs)
            .map_err(|_| CacheError::Config(format!("ttl_secs {ttl_secs} is too large")))?;

        let client = tokio::task::spawn_blocking(move || {
            let client = memcache::Client::with_pool_size(urls, pool_size)?;
            client.set_read_timeout(Some(timeout))?;
            client.set_write_timeout(Some(timeout))?;
            Ok::<_, memcache::MemcacheError>(client)
        })
        .await
        .map_err(|e| CacheError::Unavailable(format!("spawn_blocking failed: {e}")))?
        .map_err(unavailable)?;

        tracing::info!(servers = ?servers, pool_size, "Connected to memcached");
        Ok(Self {
            client: Arc::new(client),
            expiration,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, memcache::MemcacheError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || op(&client))
            .await
            .map_err(|e| CacheError::Unavailable(format!("spawn_blocking failed: {e}")))?
            .map_err(unavailable)
    }
}

fn server_url(server: &str) -> String {
    if server.contains("://") {
        server.to_string()
    } else {
        format!("memcache://{server}")
    }
}

fn unavailable(err: memcache::MemcacheError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl CacheBackend for MemcachedCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Bytes>> {
        let key = key.to_string();
        let value: Option<Vec<u8>> = self.blocking(move |c| c.get(&key)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> CacheResult<()> {
        let key = key.to_string();
        let expiration = self.expiration;
        self.blocking(move |c| c.set(&key, value.as_ref(), expiration))
            .await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_string();
        self.blocking(move |c| c.delete(&key)).await
    }

    async fn incr(&self, key: &str, delta: u64) -> CacheResult<Option<u64>> {
        let owned = key.to_string();
        match self.blocking(move |c| c.increment(&owned, delta)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                // Memcached answers NOT_FOUND for missing counters; tell that
                // apart from an outage with a plain read.
                tracing::debug!(key, error = %err, "memcached incr failed, probing key");
                match self.get(key).await? {
                    None => Ok(None),
                    Some(_) => Err(err),
                }
            }
        }
    }

    async fn health_check(&self) -> CacheResult<()> {
        self.blocking(|c| c.version()).await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "memcached"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_urls_get_a_scheme() {
        assert_eq!(server_url("127.0.0.1:11211"), "memcache://127.0.0.1:11211");
        assert_eq!(
            server_url("memcache://cache:11211?tcp_nodelay=true"),
            "memcache://cache:11211?tcp_nodelay=true"
        );
    }

    #[tokio::test]
    async fn connect_requires_servers() {
        let result = MemcachedCache::connect(&[], 1, Duration::from_millis(10), 0).await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
