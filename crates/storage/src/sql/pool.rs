//! Connection pool with a bounded wait queue.
//!
//! Callers beyond `max_backlog` that cannot get an idle connection right
//! away are rejected immediately instead of queueing behind a struggling
//! database. The pool itself can be replaced wholesale ("disposed") after
//! an operational error so that no half-dead connection is handed out again.

use super::dialect::Dialect;
use crate::error::{StorageError, StorageResult};
use crate::metrics::{POOL_BACKLOG_EXCEEDED, POOL_DISPOSALS, POOL_TIMEOUTS};
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, PoisonError, RwLock};
use std::time::Duration;
use weave_core::config::DatabaseConfig;

static INSTALL_DRIVERS: Once = Once::new();

/// Sizing and timing knobs for [`BacklogPool`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: u32,
    pub max_overflow: u32,
    pub max_backlog: Option<usize>,
    pub acquire_timeout: Duration,
    pub recycle: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            size: config.pool_size,
            max_overflow: config.pool_max_overflow,
            max_backlog: config.pool_max_backlog,
            acquire_timeout: Duration::from_secs(config.pool_timeout_secs),
            recycle: Duration::from_secs(config.pool_recycle_secs),
        }
    }
}

/// Why a connection could not be handed out.
#[derive(Debug)]
pub(crate) enum AcquireError {
    BacklogExceeded,
    Sql(sqlx::Error),
}

/// Counts a caller as waiting for as long as it is alive.
struct BacklogTicket<'a> {
    waiters: &'a AtomicUsize,
    position: usize,
}

impl<'a> BacklogTicket<'a> {
    fn enter(waiters: &'a AtomicUsize) -> Self {
        let position = waiters.fetch_add(1, Ordering::SeqCst) + 1;
        Self { waiters, position }
    }
}

impl Drop for BacklogTicket<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }
}

fn pool_options(dialect: Dialect, settings: &PoolSettings) -> AnyPoolOptions {
    let options = AnyPoolOptions::new().acquire_timeout(settings.acquire_timeout);
    match dialect {
        // SQLite permits limited write concurrency; a single connection
        // avoids persistent "database is locked" failures. An in-memory
        // database lives exactly as long as that connection.
        Dialect::Sqlite => options
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None),
        Dialect::Postgres | Dialect::Mysql => options
            .max_connections(settings.size + settings.max_overflow)
            .min_connections(0)
            .max_lifetime(Some(settings.recycle)),
    }
}

/// A replaceable `AnyPool` with backlog admission control.
pub struct BacklogPool {
    current: RwLock<AnyPool>,
    options: Arc<AnyConnectOptions>,
    dialect: Dialect,
    settings: PoolSettings,
    waiters: AtomicUsize,
    in_memory: bool,
}

impl BacklogPool {
    /// Build the pool. Connections are opened on first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(url: &str, settings: PoolSettings) -> StorageResult<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let dialect = Dialect::from_url(url)?;
        let options = AnyConnectOptions::from_str(url)
            .map_err(|e| StorageError::Config(format!("invalid database url: {e}")))?;
        let in_memory =
            dialect == Dialect::Sqlite && (url.contains(":memory:") || url.contains("mode=memory"));

        let initial = pool_options(dialect, &settings).connect_lazy_with(options.clone());
        Ok(Self {
            current: RwLock::new(initial),
            options: Arc::new(options),
            dialect,
            settings,
            waiters: AtomicUsize::new(0),
            in_memory,
        })
    }

    fn fresh_pool(&self) -> AnyPool {
        pool_options(self.dialect, &self.settings).connect_lazy_with((*self.options).clone())
    }

    fn replace(&self, pool: AnyPool) -> AnyPool {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, pool)
    }

    /// The pool currently in service.
    pub fn current(&self) -> AnyPool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) fn connect_options(&self) -> Arc<AnyConnectOptions> {
        self.options.clone()
    }

    /// Callers currently inside [`BacklogPool::acquire`].
    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub(crate) async fn acquire(&self) -> Result<PoolConnection<Any>, AcquireError> {
        let ticket = BacklogTicket::enter(&self.waiters);
        let pool = self.current();

        if let Some(max_backlog) = self.settings.max_backlog
            && ticket.position > max_backlog
        {
            return match pool.try_acquire() {
                Some(conn) => Ok(conn),
                None => {
                    POOL_BACKLOG_EXCEEDED.inc();
                    tracing::warn!(
                        waiting = ticket.position,
                        max_backlog,
                        "Connection pool backlog exceeded"
                    );
                    Err(AcquireError::BacklogExceeded)
                }
            };
        }

        pool.acquire().await.map_err(|e| {
            if matches!(e, sqlx::Error::PoolTimedOut) {
                POOL_TIMEOUTS.inc();
            }
            AcquireError::Sql(e)
        })
    }

    /// Replace the pool with a fresh one and close the old connections.
    ///
    /// Connections checked out from the old pool finish their work and are
    /// then closed instead of being returned.
    pub fn dispose(&self) {
        if self.in_memory {
            tracing::warn!("Not disposing in-memory SQLite pool: its data lives in the connection");
            return;
        }
        let old = self.replace(self.fresh_pool());
        POOL_DISPOSALS.inc();
        tracing::warn!(dialect = self.dialect.name(), "Disposed database connection pool");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { old.close().await });
        }
    }

    pub async fn close(&self) {
        self.current().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_backlog: Option<usize>) -> PoolSettings {
        PoolSettings {
            size: 1,
            max_overflow: 0,
            max_backlog,
            acquire_timeout: Duration::from_millis(200),
            recycle: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn rejects_waiters_beyond_backlog_immediately() {
        let pool = BacklogPool::new("sqlite::memory:", settings(Some(1))).unwrap();
        let held = pool.acquire().await.unwrap();

        // The holder's ticket is gone, so this caller is first in line and
        // waits until the acquire timeout.
        let started = std::time::Instant::now();
        let first = pool.acquire().await;
        assert!(matches!(first, Err(AcquireError::Sql(sqlx::Error::PoolTimedOut))));
        assert!(started.elapsed() >= Duration::from_millis(150));

        // With one caller already waiting, the next one fails fast.
        let waiting = pool.acquire();
        let rejected = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let started = std::time::Instant::now();
            let result = pool.acquire().await;
            (result, started.elapsed())
        };
        let (_, (result, elapsed)) = tokio::join!(waiting, rejected);
        assert!(matches!(result, Err(AcquireError::BacklogExceeded)));
        assert!(elapsed < Duration::from_millis(100));

        drop(held);
        assert_eq!(pool.waiting(), 0);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn unbounded_backlog_waits() {
        let pool = BacklogPool::new("sqlite::memory:", settings(None)).unwrap();
        let held = pool.acquire().await.unwrap();
        let waiter = pool.acquire();
        let release = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(held);
        };
        let (conn, ()) = tokio::join!(waiter, release);
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn in_memory_pools_are_not_disposed() {
        let pool = BacklogPool::new("sqlite::memory:", settings(None)).unwrap();
        let before = POOL_DISPOSALS.get();
        pool.dispose();
        assert_eq!(POOL_DISPOSALS.get(), before);
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(matches!(
            BacklogPool::new("oracle://db", settings(None)),
            Err(StorageError::Config(_))
        ));
    }
}
