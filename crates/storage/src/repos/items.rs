//! Item repository trait.

use crate::error::StorageResult;
use async_trait::async_trait;
use weave_core::{ItemQuery, ItemUpdate, Timestamp, UserId, Wbo, WboField};

/// WBO reads and writes within a collection.
///
/// Writes stamp items carrying a payload with `storage_time` (or the current
/// time when unset). A relative `ttl` is turned into an absolute expiry from
/// the same time; items without one never expire.
#[async_trait]
pub trait ItemRepo: Send + Sync {
    /// Modification time of an item if it is stored, expired or not.
    async fn item_exists(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Timestamp>>;

    async fn get_items(
        &self,
        user_id: UserId,
        collection: &str,
        fields: Option<&[WboField]>,
        query: &ItemQuery,
    ) -> StorageResult<Vec<Wbo>>;

    async fn get_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        fields: Option<&[WboField]>,
    ) -> StorageResult<Option<Wbo>>;

    /// Insert or update one item. Returns the item's modification time.
    ///
    /// Losing an insert race yields `StorageError::Conflict`.
    async fn set_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        item: &ItemUpdate,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<Option<Timestamp>>;

    /// Upsert a batch as one statement. Items without an id are skipped.
    /// Returns the number of items written.
    async fn set_items(
        &self,
        user_id: UserId,
        collection: &str,
        items: &[ItemUpdate],
        storage_time: Option<Timestamp>,
    ) -> StorageResult<usize>;

    /// Returns whether an item was removed.
    async fn delete_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<bool>;

    /// Delete `item_ids` (or every item) matching `query`.
    /// Returns whether anything was removed.
    async fn delete_items(
        &self,
        user_id: UserId,
        collection: &str,
        item_ids: Option<&[String]>,
        query: &ItemQuery,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<bool>;
}
