//! Combined storage trait.

use crate::error::StorageResult;
use crate::repos::{CollectionRepo, ItemRepo, QuotaRepo, UserRepo};
use async_trait::async_trait;
use weave_core::UserId;
use weave_core::config::QuotaConfig;

/// Everything a request controller needs from a storage backend.
#[async_trait]
pub trait SyncStorage: UserRepo + CollectionRepo + ItemRepo + QuotaRepo + Send + Sync {
    /// Backend name for logs (`sql`, `cached`).
    fn name(&self) -> &'static str;

    /// Quota settings applied by this backend.
    fn quota(&self) -> &QuotaConfig;

    /// Create missing tables.
    async fn migrate(&self) -> StorageResult<()>;

    /// Remove every collection and item of a user but keep the user row.
    async fn delete_storage(&self, user_id: UserId) -> StorageResult<()>;

    /// Run a cheap real query against the backing database.
    async fn health_check(&self) -> StorageResult<()>;

    async fn is_healthy(&self) -> bool {
        match self.health_check().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(backend = self.name(), error = %err, "Storage health check failed");
                false
            }
        }
    }
}
