//! Quota repository trait.

use crate::error::StorageResult;
use async_trait::async_trait;
use weave_core::UserId;

/// Storage usage accounting in kilobytes.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Sum of non-expired payload sizes. `recalculate` asks cached
    /// implementations to refresh from the database.
    async fn get_total_size(&self, user_id: UserId, recalculate: bool) -> StorageResult<f64>;

    /// Quota minus the total size.
    async fn get_size_left(&self, user_id: UserId, recalculate: bool) -> StorageResult<f64>;
}
