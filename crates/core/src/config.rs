//! Configuration types shared across crates.

use crate::collection::CollectionIds;
use serde::{Deserialize, Serialize};

/// SQL database and connection pool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`sqlite:`, `postgres://` or `mysql://`).
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Connections kept open by the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Extra connections allowed above `pool_size` under load.
    #[serde(default = "default_pool_max_overflow")]
    pub pool_max_overflow: u32,
    /// Maximum number of callers allowed to wait for a connection.
    /// Callers beyond this fail immediately instead of queueing.
    /// Unset means unbounded.
    #[serde(default)]
    pub pool_max_backlog: Option<usize>,
    /// Seconds to wait for a connection before giving up.
    #[serde(default = "default_pool_timeout_secs")]
    pub pool_timeout_secs: u64,
    /// Connections older than this are closed and replaced.
    #[serde(default = "default_pool_recycle_secs")]
    pub pool_recycle_secs: u64,
    /// Create missing tables on startup.
    #[serde(default = "default_true")]
    pub create_tables: bool,
    /// Split items across `shard_count` tables keyed by user id.
    #[serde(default)]
    pub shard: bool,
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Collection name/id regime.
    #[serde(default)]
    pub collection_ids: CollectionIds,
    /// Ask the server to kill statements whose caller went away
    /// (MySQL and PostgreSQL only). Costs one extra query per statement.
    #[serde(default)]
    pub kill_interrupted_queries: bool,
}

fn default_database_url() -> String {
    "sqlite://./data/weave.db?mode=rwc".to_string()
}

fn default_pool_size() -> u32 {
    100
}

fn default_pool_max_overflow() -> u32 {
    10
}

fn default_pool_timeout_secs() -> u64 {
    30
}

fn default_pool_recycle_secs() -> u64 {
    3600
}

fn default_shard_count() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            pool_max_overflow: default_pool_max_overflow(),
            pool_max_backlog: None,
            pool_timeout_secs: default_pool_timeout_secs(),
            pool_recycle_secs: default_pool_recycle_secs(),
            create_tables: true,
            shard: false,
            shard_count: default_shard_count(),
            collection_ids: CollectionIds::default(),
            kill_interrupted_queries: false,
        }
    }
}

impl DatabaseConfig {
    /// In-memory SQLite database.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }

    /// Number of item tables.
    pub fn shards(&self) -> u32 {
        if self.shard { self.shard_count } else { 1 }
    }

    pub fn validate(&self) -> Result<(), String> {
        let scheme = self.url.split(':').next().unwrap_or_default();
        if !matches!(scheme, "sqlite" | "postgres" | "postgresql" | "mysql") {
            return Err(format!("unsupported database url scheme '{scheme}'"));
        }
        if self.pool_size == 0 {
            return Err("database.pool_size must be at least 1".to_string());
        }
        if self.shard && self.shard_count == 0 {
            return Err("database.shard_count must be at least 1 when sharding".to_string());
        }
        if self.pool_max_backlog == Some(0) {
            return Err(
                "database.pool_max_backlog must be at least 1 (omit it for unbounded)".to_string(),
            );
        }
        Ok(())
    }
}

/// Cache backend configuration for the storage overlay.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheConfig {
    /// SQL only, no overlay.
    #[default]
    None,
    /// In-process cache. Single node only.
    Memory {
        /// Entry lifetime in seconds, 0 for no expiry.
        #[serde(default)]
        ttl_secs: u64,
    },
    /// Memcached servers.
    Memcached {
        /// Server addresses, e.g. `127.0.0.1:11211`.
        #[serde(default = "default_memcached_servers")]
        servers: Vec<String>,
        /// Connections per server.
        #[serde(default = "default_memcached_pool_size")]
        pool_size: u32,
        /// Read/write timeout in milliseconds.
        #[serde(default = "default_memcached_timeout_ms")]
        timeout_ms: u64,
        /// Entry lifetime in seconds, 0 for no expiry.
        #[serde(default)]
        ttl_secs: u64,
    },
}

fn default_memcached_servers() -> Vec<String> {
    vec!["127.0.0.1:11211".to_string()]
}

fn default_memcached_pool_size() -> u32 {
    10
}

fn default_memcached_timeout_ms() -> u64 {
    1000
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            CacheConfig::None | CacheConfig::Memory { .. } => Ok(()),
            CacheConfig::Memcached {
                servers, pool_size, ..
            } => {
                if servers.is_empty() {
                    return Err("memcached cache requires at least one server".to_string());
                }
                if *pool_size == 0 {
                    return Err("memcached pool_size must be at least 1".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Per-user storage quota.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Quota in kilobytes.
    #[serde(default = "default_quota_size_kb")]
    pub size_kb: u64,
    /// Minimum seconds between forced recalculations of a cached total.
    #[serde(default = "default_recalculation_secs")]
    pub recalculation_secs: u64,
}

fn default_quota_size_kb() -> u64 {
    5 * 1024
}

fn default_recalculation_secs() -> u64 {
    3600
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_kb: default_quota_size_kb(),
            recalculation_secs: default_recalculation_secs(),
        }
    }
}

/// Storage engine configuration: database, optional cache overlay, quota.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
}

impl StorageConfig {
    /// In-memory SQLite without cache.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            database: DatabaseConfig::for_testing(),
            cache: CacheConfig::None,
            quota: QuotaConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.database.validate()?;
        self.cache.validate()
    }
}

/// Batch write admission limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per storage call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Items accepted per request; later items are reported as `retry wbo`.
    #[serde(default = "default_batch_max_count")]
    pub batch_max_count: usize,
    /// Cumulative payload bytes accepted per request; later items are
    /// reported as `retry bytes`.
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_max_count() -> usize {
    100
}

fn default_batch_max_bytes() -> usize {
    1024 * 1024
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_max_count: default_batch_max_count(),
            batch_max_bytes: default_batch_max_bytes(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch.batch_size must be at least 1".to_string());
        }
        if self.batch_max_count == 0 || self.batch_max_bytes == 0 {
            return Err("batch limits must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses in-memory SQLite and no cache.
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig::for_testing(),
            batch: BatchConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.batch.validate()
    }
}
