//! Collection name to id mapping.
//!
//! Well-known names resolve through the deployment's fixed table without
//! touching the database. Every other name gets a per-user id allocated on
//! first use and recorded in the `collections` table.

use super::SqlStorage;
use super::execute::{SqlValue, get_int, get_text};
use super::queries::{ALLOCATE_COLLECTION, COLLECTION_ID, COLLECTION_NAMES, INSERT_COLLECTION};
use crate::error::{StorageError, StorageResult};
use std::collections::HashMap;
use weave_core::collection::validate_collection_name;
use weave_core::{CollectionId, UserId};

/// Allocation attempts before giving up on a contended user.
const MAX_ALLOCATION_ATTEMPTS: usize = 5;

impl SqlStorage {
    /// Stored id of a collection, ignoring the fixed table.
    pub(crate) async fn stored_collection_id(
        &self,
        user_id: UserId,
        name: &str,
    ) -> StorageResult<Option<CollectionId>> {
        let row = self
            .exec
            .fetch_optional(COLLECTION_ID, &[user_id.into(), name.into()])
            .await?;
        match row {
            Some(row) => Ok(get_int(&row, 0)?.map(|id| id as CollectionId)),
            None => Ok(None),
        }
    }

    /// Id for `name`, allocating one when missing and `create` is set.
    pub(crate) async fn resolve_collection(
        &self,
        user_id: UserId,
        name: &str,
        create: bool,
    ) -> StorageResult<Option<CollectionId>> {
        if let Some(id) = self.collection_ids.fixed_id(name) {
            return Ok(Some(id));
        }

        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            if let Some(id) = self.stored_collection_id(user_id, name).await? {
                return Ok(Some(id));
            }
            if !create {
                return Ok(None);
            }
            validate_collection_name(name)?;

            let floor = self.collection_ids.custom_floor();
            let params = [
                SqlValue::from(user_id),
                SqlValue::from(floor),
                SqlValue::from(name),
                SqlValue::from(user_id),
                SqlValue::from(floor),
            ];
            match self.exec.execute(ALLOCATE_COLLECTION, &params).await {
                Ok(_) => {}
                // Another writer took the id or created the same name.
                Err(StorageError::Conflict(_)) => {
                    tracing::debug!(user_id, collection = name, attempt, "Collection id allocation raced, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(id) = self.stored_collection_id(user_id, name).await? {
            return Ok(Some(id));
        }
        tracing::warn!(user_id, collection = name, "Gave up allocating a collection id");
        Err(StorageError::Conflict(format!(
            "could not allocate an id for collection '{name}'"
        )))
    }

    /// Make sure a row exists for a fixed-id collection.
    pub(crate) async fn record_fixed_collection(
        &self,
        user_id: UserId,
        name: &str,
        id: CollectionId,
    ) -> StorageResult<()> {
        if self.stored_collection_id(user_id, name).await?.is_some() {
            return Ok(());
        }
        let params = [user_id.into(), id.into(), name.into()];
        match self.exec.execute(INSERT_COLLECTION, &params).await {
            Ok(_) | Err(StorageError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn load_collection_names(
        &self,
        user_id: UserId,
    ) -> StorageResult<Vec<(CollectionId, String)>> {
        let rows = self
            .exec
            .fetch_all(COLLECTION_NAMES, &[user_id.into()])
            .await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            if let (Some(id), Some(name)) = (get_int(row, 0)?, get_text(row, 1)?) {
                names.push((id as CollectionId, name));
            }
        }
        Ok(names)
    }
}

/// Turns collection ids back into names for one aggregate call.
///
/// Stored names are loaded at most once, on the first id missing from the
/// fixed table.
pub(crate) struct NameResolver<'a> {
    storage: &'a SqlStorage,
    user_id: UserId,
    stored: Option<HashMap<CollectionId, String>>,
}

impl<'a> NameResolver<'a> {
    pub(crate) fn new(storage: &'a SqlStorage, user_id: UserId) -> Self {
        Self {
            storage,
            user_id,
            stored: None,
        }
    }

    pub(crate) async fn name(&mut self, id: CollectionId) -> StorageResult<String> {
        if let Some(name) = self.storage.collection_ids.fixed_name(id) {
            return Ok(name.to_string());
        }
        if self.stored.is_none() {
            let names = self.storage.load_collection_names(self.user_id).await?;
            self.stored = Some(names.into_iter().collect());
        }
        match self.stored.as_ref().and_then(|names| names.get(&id)) {
            Some(name) => Ok(name.clone()),
            None => {
                tracing::error!(
                    user_id = self.user_id,
                    collection_id = id,
                    "Collection id has no name, possible database corruption"
                );
                Err(StorageError::Integrity(format!(
                    "user {} collection {id} has no collection name",
                    self.user_id
                )))
            }
        }
    }
}
