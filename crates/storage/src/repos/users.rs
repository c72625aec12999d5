//! User repository trait.

use crate::error::StorageResult;
use crate::models::{UserField, UserRecord, UserUpdate};
use async_trait::async_trait;
use weave_core::UserId;

/// Identity bookkeeping keyed by the externally assigned user id.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn user_exists(&self, user_id: UserId) -> StorageResult<bool>;

    /// Create the user or update the given fields.
    async fn set_user(&self, user_id: UserId, values: &UserUpdate) -> StorageResult<()>;

    /// Fetch a user, projected to `fields` when given.
    async fn get_user(
        &self,
        user_id: UserId,
        fields: Option<&[UserField]>,
    ) -> StorageResult<Option<UserRecord>>;

    /// Remove a user together with all collections and items.
    async fn delete_user(&self, user_id: UserId) -> StorageResult<()>;
}
