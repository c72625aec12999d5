//! Collection repository trait.

use crate::error::StorageResult;
use crate::models::CollectionRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;
use weave_core::{CollectionId, Timestamp, UserId};

/// Per-user collections and their aggregate views.
///
/// Aggregates skip expired items.
#[async_trait]
pub trait CollectionRepo: Send + Sync {
    async fn collection_exists(&self, user_id: UserId, name: &str) -> StorageResult<bool>;

    /// Create a collection if missing and return its id.
    async fn set_collection(&self, user_id: UserId, name: &str) -> StorageResult<CollectionId>;

    /// Look a collection up, creating it first when `create` is set.
    async fn get_collection(
        &self,
        user_id: UserId,
        name: &str,
        create: bool,
    ) -> StorageResult<Option<CollectionRecord>>;

    async fn get_collections(&self, user_id: UserId) -> StorageResult<Vec<CollectionRecord>>;

    /// `(id, name)` pairs of the user's stored collections.
    async fn get_collection_names(
        &self,
        user_id: UserId,
    ) -> StorageResult<Vec<(CollectionId, String)>>;

    /// Delete all items of a collection, then the collection itself.
    /// Returns false if it did not exist.
    async fn delete_collection(&self, user_id: UserId, name: &str) -> StorageResult<bool>;

    /// Last modification time of every non-empty collection.
    async fn get_collection_timestamps(
        &self,
        user_id: UserId,
    ) -> StorageResult<BTreeMap<String, Timestamp>>;

    async fn get_collection_counts(&self, user_id: UserId) -> StorageResult<BTreeMap<String, u64>>;

    /// Payload size per collection in kilobytes.
    async fn get_collection_sizes(&self, user_id: UserId) -> StorageResult<BTreeMap<String, f64>>;

    async fn get_collection_max_timestamp(
        &self,
        user_id: UserId,
        name: &str,
    ) -> StorageResult<Option<Timestamp>>;
}
