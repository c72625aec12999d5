//! SQL storage engine over SQLite, PostgreSQL or MySQL.

mod collections;
pub mod dialect;
pub mod execute;
pub mod pool;
pub mod queries;
pub mod schema;

use crate::error::{StorageError, StorageResult};
use crate::models::{CollectionRecord, USER_STATUS_ACTIVE, UserField, UserRecord, UserUpdate};
use crate::repos::{CollectionRepo, ItemRepo, QuotaRepo, UserRepo};
use crate::store::SyncStorage;
use async_trait::async_trait;
use collections::NameResolver;
use dialect::Dialect;
use execute::{SqlExecutor, SqlValue, get_int, get_text};
use pool::{BacklogPool, PoolSettings};
use queries::{
    DELETE_COLLECTION, DELETE_USER, DELETE_USER_COLLECTIONS, INSERT_USER,
    ItemRow, ItemTables, USER_EXISTS, projection,
};
use sqlx::any::AnyRow;
use std::collections::BTreeMap;
use weave_core::config::{DatabaseConfig, QuotaConfig};
use weave_core::{
    CollectionId, CollectionIds, ItemQuery, ItemUpdate, MAX_TTL, Timestamp, UserId, Wbo, WboField,
};

const KB: f64 = 1024.0;

/// The authoritative store.
pub struct SqlStorage {
    exec: SqlExecutor,
    items: ItemTables,
    collection_ids: CollectionIds,
    quota: QuotaConfig,
}

impl SqlStorage {
    /// Connect and, when configured, create missing tables.
    pub async fn new(config: &DatabaseConfig, quota: QuotaConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::Config)?;
        let pool = BacklogPool::new(&config.url, PoolSettings::from_config(config))?;
        let dialect = pool.dialect();
        let storage = Self {
            exec: SqlExecutor::new(pool, config.kill_interrupted_queries),
            items: ItemTables::new(dialect, config.shards()),
            collection_ids: config.collection_ids,
            quota,
        };

        if config.create_tables {
            storage.migrate().await?;
        }
        tracing::info!(
            dialect = dialect.name(),
            shards = storage.items.len(),
            collection_ids = ?config.collection_ids,
            "SQL storage ready"
        );
        Ok(storage)
    }

    pub fn dialect(&self) -> Dialect {
        self.exec.dialect()
    }

    pub fn collection_ids(&self) -> CollectionIds {
        self.collection_ids
    }

    pub fn pool(&self) -> &BacklogPool {
        self.exec.pool()
    }

    /// Name of the item table holding `user_id`'s items.
    pub fn item_table(&self, user_id: UserId) -> &str {
        self.items.for_user(user_id).name()
    }

    pub async fn close(&self) {
        self.exec.pool().close().await;
    }

    /// `(collection id, value)` rows of a per-collection aggregate, with ids
    /// turned into names.
    async fn aggregate(
        &self,
        user_id: UserId,
        sql: &str,
    ) -> StorageResult<Vec<(String, Option<i64>)>> {
        let now = Timestamp::now().whole_secs();
        let rows = self
            .exec
            .fetch_all(sql, &[user_id.into(), now.into()])
            .await?;
        let mut names = NameResolver::new(self, user_id);
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(id) = get_int(row, 0)? else { continue };
            let name = names.name(id as CollectionId).await?;
            out.push((name, get_int(row, 1)?));
        }
        Ok(out)
    }

    async fn delete_user_data(&self, user_id: UserId) -> StorageResult<()> {
        let table = self.items.for_user(user_id);
        self.exec
            .execute(&table.delete_user_items, &[user_id.into()])
            .await?;
        self.exec
            .execute(DELETE_USER_COLLECTIONS, &[user_id.into()])
            .await?;
        Ok(())
    }

    /// Insert a new item row. A concurrent insert of the same id fails with
    /// a conflict.
    async fn insert_item(
        &self,
        user_id: UserId,
        collection: CollectionId,
        row: &ItemRow,
    ) -> StorageResult<()> {
        let table = self.items.for_user(user_id);
        let mut params = Vec::with_capacity(10);
        row.bind(user_id, collection, &mut params);
        self.exec.execute(&table.insert_item, &params).await?;
        Ok(())
    }
}

fn sortindex(value: Option<i64>) -> StorageResult<Option<i32>> {
    value
        .map(|v| {
            i32::try_from(v).map_err(|_| {
                StorageError::Validation(weave_core::Error::InvalidWbo {
                    field: "sortindex",
                    reason: "invalid sortindex".to_string(),
                })
            })
        })
        .transpose()
}

/// Absolute expiry for a relative ttl.
fn expiry(ttl: Option<i64>, storage_time: Timestamp) -> i64 {
    match ttl {
        Some(ttl) => storage_time.whole_secs().saturating_add(ttl),
        None => MAX_TTL,
    }
}

/// Row values for a write. `stamp` forces `modified` even without payload.
fn item_row(
    id: &str,
    item: &ItemUpdate,
    storage_time: Timestamp,
    stamp: bool,
) -> StorageResult<ItemRow> {
    let modified = match (item.modified, &item.payload) {
        (Some(explicit), _) => Some(explicit),
        (None, Some(_)) => Some(storage_time),
        (None, None) if stamp => Some(storage_time),
        (None, None) => None,
    };
    Ok(ItemRow {
        id: id.to_string(),
        parentid: item.parentid.clone(),
        predecessorid: item.predecessorid.clone(),
        sortindex: sortindex(item.sortindex)?,
        modified: modified.map(Timestamp::as_centis),
        payload: item.payload.clone(),
        payload_size: item.payload_size(),
        ttl: expiry(item.ttl, storage_time),
    })
}

fn row_to_wbo(row: &AnyRow, columns: &[WboField]) -> StorageResult<Wbo> {
    let mut wbo = Wbo::default();
    for (i, field) in columns.iter().enumerate() {
        match field {
            WboField::Id => wbo.id = get_text(row, i)?.unwrap_or_default(),
            WboField::ParentId => wbo.parentid = get_text(row, i)?,
            WboField::PredecessorId => wbo.predecessorid = get_text(row, i)?,
            WboField::SortIndex => wbo.sortindex = get_int(row, i)?,
            WboField::Modified => wbo.modified = get_int(row, i)?.map(Timestamp::from_centis),
            WboField::Payload => wbo.payload = get_text(row, i)?,
            WboField::PayloadSize => wbo.payload_size = get_int(row, i)?,
            WboField::Ttl => wbo.ttl = get_int(row, i)?,
        }
    }
    Ok(wbo)
}

fn user_column_value(field: UserField, values: &UserUpdate) -> Option<SqlValue> {
    match field {
        UserField::Username => values.username.as_deref().map(SqlValue::from),
        UserField::Email => values.email.as_deref().map(SqlValue::from),
        UserField::Status => values.status.map(SqlValue::from),
    }
}

#[async_trait]
impl UserRepo for SqlStorage {
    async fn user_exists(&self, user_id: UserId) -> StorageResult<bool> {
        Ok(self
            .exec
            .fetch_optional(USER_EXISTS, &[user_id.into()])
            .await?
            .is_some())
    }

    async fn set_user(&self, user_id: UserId, values: &UserUpdate) -> StorageResult<()> {
        if !self.user_exists(user_id).await? {
            let params = [
                SqlValue::from(user_id),
                SqlValue::Text(values.username.clone()),
                SqlValue::Text(values.email.clone()),
                SqlValue::from(values.status.unwrap_or(USER_STATUS_ACTIVE)),
            ];
            return match self.exec.execute(INSERT_USER, &params).await {
                Ok(_) => Ok(()),
                // Created concurrently; apply the values as an update.
                Err(StorageError::Conflict(_)) => self.set_user(user_id, values).await,
                Err(e) => Err(e),
            };
        }

        let mut sets = Vec::new();
        let mut params = Vec::new();
        for field in UserField::ALL {
            if let Some(value) = user_column_value(*field, values) {
                sets.push(format!("{} = ?", field.column()));
                params.push(value);
            }
        }
        if sets.is_empty() {
            return Ok(());
        }
        params.push(user_id.into());
        let sql = format!("UPDATE users SET {} WHERE id = ?", sets.join(", "));
        self.exec.execute(&sql, &params).await?;
        Ok(())
    }

    async fn get_user(
        &self,
        user_id: UserId,
        fields: Option<&[UserField]>,
    ) -> StorageResult<Option<UserRecord>> {
        let fields = fields.unwrap_or(UserField::ALL);
        let mut columns = vec!["id"];
        columns.extend(fields.iter().map(|f| f.column()));
        let sql = format!("SELECT {} FROM users WHERE id = ?", columns.join(", "));
        let Some(row) = self.exec.fetch_optional(&sql, &[user_id.into()]).await? else {
            return Ok(None);
        };

        let mut record = UserRecord {
            id: user_id,
            ..UserRecord::default()
        };
        for (i, field) in fields.iter().enumerate() {
            let column = i + 1;
            match field {
                UserField::Username => record.username = get_text(&row, column)?,
                UserField::Email => record.email = get_text(&row, column)?,
                UserField::Status => record.status = get_int(&row, column)?.map(|s| s as i32),
            }
        }
        Ok(Some(record))
    }

    async fn delete_user(&self, user_id: UserId) -> StorageResult<()> {
        self.delete_user_data(user_id).await?;
        self.exec.execute(DELETE_USER, &[user_id.into()]).await?;
        tracing::info!(user_id, "Deleted user");
        Ok(())
    }
}

#[async_trait]
impl CollectionRepo for SqlStorage {
    async fn collection_exists(&self, user_id: UserId, name: &str) -> StorageResult<bool> {
        if self.stored_collection_id(user_id, name).await?.is_some() {
            return Ok(true);
        }
        // Fixed collections exist as soon as they hold items.
        let Some(id) = self.collection_ids.fixed_id(name) else {
            return Ok(false);
        };
        let table = self.items.for_user(user_id);
        Ok(self
            .exec
            .fetch_optional(&table.collection_has_items, &[user_id.into(), id.into()])
            .await?
            .is_some())
    }

    async fn set_collection(&self, user_id: UserId, name: &str) -> StorageResult<CollectionId> {
        if let Some(id) = self.collection_ids.fixed_id(name) {
            self.record_fixed_collection(user_id, name, id).await?;
            return Ok(id);
        }
        self.resolve_collection(user_id, name, true)
            .await?
            .ok_or_else(|| StorageError::Conflict(format!("collection '{name}' was not created")))
    }

    async fn get_collection(
        &self,
        user_id: UserId,
        name: &str,
        create: bool,
    ) -> StorageResult<Option<CollectionRecord>> {
        let id = if create {
            Some(self.set_collection(user_id, name).await?)
        } else if self.collection_exists(user_id, name).await? {
            self.resolve_collection(user_id, name, false).await?
        } else {
            None
        };
        Ok(id.map(|collection_id| CollectionRecord {
            user_id,
            collection_id,
            name: name.to_string(),
        }))
    }

    async fn get_collections(&self, user_id: UserId) -> StorageResult<Vec<CollectionRecord>> {
        Ok(self
            .get_collection_names(user_id)
            .await?
            .into_iter()
            .map(|(collection_id, name)| CollectionRecord {
                user_id,
                collection_id,
                name,
            })
            .collect())
    }

    async fn get_collection_names(
        &self,
        user_id: UserId,
    ) -> StorageResult<Vec<(CollectionId, String)>> {
        self.load_collection_names(user_id).await
    }

    async fn delete_collection(&self, user_id: UserId, name: &str) -> StorageResult<bool> {
        if !self.collection_exists(user_id, name).await? {
            return Ok(false);
        }
        if let Some(id) = self.resolve_collection(user_id, name, false).await? {
            let table = self.items.for_user(user_id);
            self.exec
                .execute(&table.delete_collection_items, &[user_id.into(), id.into()])
                .await?;
        }
        self.exec
            .execute(DELETE_COLLECTION, &[user_id.into(), name.into()])
            .await?;
        Ok(true)
    }

    async fn get_collection_timestamps(
        &self,
        user_id: UserId,
    ) -> StorageResult<BTreeMap<String, Timestamp>> {
        let table = self.items.for_user(user_id);
        Ok(self
            .aggregate(user_id, &table.collection_stamps)
            .await?
            .into_iter()
            .filter_map(|(name, stamp)| stamp.map(|s| (name, Timestamp::from_centis(s))))
            .collect())
    }

    async fn get_collection_counts(&self, user_id: UserId) -> StorageResult<BTreeMap<String, u64>> {
        let table = self.items.for_user(user_id);
        Ok(self
            .aggregate(user_id, &table.collection_counts)
            .await?
            .into_iter()
            .map(|(name, count)| (name, count.unwrap_or(0).max(0) as u64))
            .collect())
    }

    async fn get_collection_sizes(&self, user_id: UserId) -> StorageResult<BTreeMap<String, f64>> {
        let table = self.items.for_user(user_id);
        Ok(self
            .aggregate(user_id, &table.collection_sizes)
            .await?
            .into_iter()
            .map(|(name, bytes)| (name, bytes.unwrap_or(0) as f64 / KB))
            .collect())
    }

    async fn get_collection_max_timestamp(
        &self,
        user_id: UserId,
        name: &str,
    ) -> StorageResult<Option<Timestamp>> {
        let Some(id) = self.resolve_collection(user_id, name, false).await? else {
            return Ok(None);
        };
        let table = self.items.for_user(user_id);
        let now = Timestamp::now().whole_secs();
        let row = self
            .exec
            .fetch_optional(
                &table.collection_max_stamp,
                &[user_id.into(), id.into(), now.into()],
            )
            .await?;
        match row {
            Some(row) => Ok(get_int(&row, 0)?.map(Timestamp::from_centis)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ItemRepo for SqlStorage {
    async fn item_exists(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Timestamp>> {
        let Some(id) = self.resolve_collection(user_id, collection, false).await? else {
            return Ok(None);
        };
        let table = self.items.for_user(user_id);
        let row = self
            .exec
            .fetch_optional(
                &table.item_exists,
                &[user_id.into(), id.into(), item_id.into()],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(
                get_int(&row, 0)?
                    .map(Timestamp::from_centis)
                    .unwrap_or(Timestamp::ZERO),
            )),
            None => Ok(None),
        }
    }

    async fn get_items(
        &self,
        user_id: UserId,
        collection: &str,
        fields: Option<&[WboField]>,
        query: &ItemQuery,
    ) -> StorageResult<Vec<Wbo>> {
        let Some(id) = self.resolve_collection(user_id, collection, false).await? else {
            return Ok(Vec::new());
        };
        let columns = projection(fields);
        let stmt = self.items.for_user(user_id).select_items(
            user_id,
            id,
            &columns,
            query,
            Timestamp::now().whole_secs(),
        );
        let rows = self.exec.fetch_all(&stmt.sql, &stmt.params).await?;
        rows.iter().map(|row| row_to_wbo(row, &columns)).collect()
    }

    async fn get_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        fields: Option<&[WboField]>,
    ) -> StorageResult<Option<Wbo>> {
        let Some(id) = self.resolve_collection(user_id, collection, false).await? else {
            return Ok(None);
        };
        let columns = projection(fields);
        let stmt = self.items.for_user(user_id).select_item(
            user_id,
            id,
            item_id,
            &columns,
            Timestamp::now().whole_secs(),
        );
        match self.exec.fetch_optional(&stmt.sql, &stmt.params).await? {
            Some(row) => Ok(Some(row_to_wbo(&row, &columns)?)),
            None => Ok(None),
        }
    }

    async fn set_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        item: &ItemUpdate,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<Option<Timestamp>> {
        let storage_time = storage_time.unwrap_or_else(Timestamp::now);
        let row = item_row(item_id, item, storage_time, false)?;
        let Some(id) = self.resolve_collection(user_id, collection, true).await? else {
            return Err(StorageError::Conflict(format!(
                "collection '{collection}' was not created"
            )));
        };

        let existing = self.item_exists(user_id, collection, item_id).await?;
        match existing {
            None => self.insert_item(user_id, id, &row).await?,
            Some(_) => {
                let mut values: Vec<(&'static str, SqlValue)> = Vec::new();
                if let Some(parentid) = &row.parentid {
                    values.push(("parentid", parentid.as_str().into()));
                }
                if let Some(predecessorid) = &row.predecessorid {
                    values.push(("predecessorid", predecessorid.as_str().into()));
                }
                if row.sortindex.is_some() {
                    values.push(("sortindex", SqlValue::Int(row.sortindex)));
                }
                if row.modified.is_some() {
                    values.push(("modified", SqlValue::BigInt(row.modified)));
                }
                if let Some(payload) = &row.payload {
                    values.push(("payload", payload.as_str().into()));
                    values.push(("payload_size", SqlValue::BigInt(row.payload_size)));
                }
                values.push(("ttl", row.ttl.into()));
                let stmt = self
                    .items
                    .for_user(user_id)
                    .update_item(user_id, id, item_id, values);
                self.exec.execute(&stmt.sql, &stmt.params).await?;
            }
        }

        Ok(row.modified.map(Timestamp::from_centis).or(existing))
    }

    async fn set_items(
        &self,
        user_id: UserId,
        collection: &str,
        items: &[ItemUpdate],
        storage_time: Option<Timestamp>,
    ) -> StorageResult<usize> {
        let storage_time = storage_time.unwrap_or_else(Timestamp::now);

        // Later duplicates replace earlier ones: one statement cannot touch
        // the same row twice.
        let mut rows: Vec<ItemRow> = Vec::with_capacity(items.len());
        for item in items {
            let Some(item_id) = item.id.as_deref() else {
                continue;
            };
            let row = item_row(item_id, item, storage_time, true)?;
            match rows.iter_mut().find(|r| r.id == row.id) {
                Some(existing) => *existing = row,
                None => rows.push(row),
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let Some(id) = self.resolve_collection(user_id, collection, true).await? else {
            return Err(StorageError::Conflict(format!(
                "collection '{collection}' was not created"
            )));
        };
        let stmt = self.items.for_user(user_id).upsert_items(user_id, id, &rows);
        self.exec.execute(&stmt.sql, &stmt.params).await?;
        Ok(rows.len())
    }

    async fn delete_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        _storage_time: Option<Timestamp>,
    ) -> StorageResult<bool> {
        let Some(id) = self.resolve_collection(user_id, collection, false).await? else {
            return Ok(false);
        };
        let table = self.items.for_user(user_id);
        let deleted = self
            .exec
            .execute(
                &table.delete_item,
                &[user_id.into(), id.into(), item_id.into()],
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn delete_items(
        &self,
        user_id: UserId,
        collection: &str,
        item_ids: Option<&[String]>,
        query: &ItemQuery,
        _storage_time: Option<Timestamp>,
    ) -> StorageResult<bool> {
        let Some(id) = self.resolve_collection(user_id, collection, false).await? else {
            return Ok(false);
        };
        let stmt = self
            .items
            .for_user(user_id)
            .delete_items(user_id, id, item_ids, query);
        Ok(self.exec.execute(&stmt.sql, &stmt.params).await? > 0)
    }
}

#[async_trait]
impl QuotaRepo for SqlStorage {
    async fn get_total_size(&self, user_id: UserId, _recalculate: bool) -> StorageResult<f64> {
        let table = self.items.for_user(user_id);
        let now = Timestamp::now().whole_secs();
        let row = self
            .exec
            .fetch_optional(&table.user_size, &[user_id.into(), now.into()])
            .await?;
        let bytes = match row {
            Some(row) => get_int(&row, 0)?.unwrap_or(0),
            None => 0,
        };
        Ok(bytes as f64 / KB)
    }

    async fn get_size_left(&self, user_id: UserId, recalculate: bool) -> StorageResult<f64> {
        let total = self.get_total_size(user_id, recalculate).await?;
        Ok(self.quota.size_kb as f64 - total)
    }
}

#[async_trait]
impl SyncStorage for SqlStorage {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn quota(&self) -> &QuotaConfig {
        &self.quota
    }

    async fn migrate(&self) -> StorageResult<()> {
        for statement in schema::create_statements(self.dialect(), self.items.len() as u32) {
            self.exec.execute(&statement, &[]).await?;
        }
        Ok(())
    }

    async fn delete_storage(&self, user_id: UserId) -> StorageResult<()> {
        self.delete_user_data(user_id).await?;
        tracing::info!(user_id, "Deleted user storage");
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.exec.execute("SELECT 1", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queries::COLLECTION_NAMES;

    async fn storage() -> SqlStorage {
        SqlStorage::new(&DatabaseConfig::for_testing(), QuotaConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_conflict() {
        let storage = storage().await;
        let id = storage.set_collection(1, "bookmarks").await.unwrap();
        let row = item_row("a", &ItemUpdate::default().payload("x"), Timestamp::now(), false).unwrap();
        storage.insert_item(1, id, &row).await.unwrap();
        let err = storage.insert_item(1, id, &row).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn payloadless_rows_have_no_modified_unless_stamped() {
        let now = Timestamp::from_centis(12_345);
        let bare = ItemUpdate::default().sortindex(3);
        assert_eq!(item_row("a", &bare, now, false).unwrap().modified, None);
        assert_eq!(item_row("a", &bare, now, true).unwrap().modified, Some(12_345));
        let with_payload = ItemUpdate::default().payload("xyz");
        let row = item_row("a", &with_payload, now, false).unwrap();
        assert_eq!(row.modified, Some(12_345));
        assert_eq!(row.payload_size, Some(3));
        assert_eq!(row.ttl, MAX_TTL);
    }

    #[test]
    fn ttl_is_relative_to_storage_time() {
        let now = Timestamp::from_centis(100_050);
        assert_eq!(expiry(Some(30), now), 1_030);
        assert_eq!(expiry(Some(i64::MAX), now), i64::MAX);
        assert_eq!(expiry(None, now), MAX_TTL);
    }

    #[test]
    fn oversized_sortindex_is_rejected() {
        assert!(sortindex(Some(i64::from(i32::MAX) + 1)).is_err());
        assert_eq!(sortindex(Some(-5)).unwrap(), Some(-5));
    }

    #[tokio::test]
    async fn names_unknown_collection_ids_as_integrity_errors() {
        let storage = storage().await;
        let id = storage.set_collection(1, "custom").await.unwrap();
        storage
            .set_item(1, "custom", "a", &ItemUpdate::default().payload("x"), None)
            .await
            .unwrap();
        // Drop the mapping row but keep the items.
        storage
            .exec
            .execute(
                "DELETE FROM collections WHERE userid = ? AND collectionid = ?",
                &[1i64.into(), id.into()],
            )
            .await
            .unwrap();
        let err = storage.get_collection_counts(1).await.unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn collection_names_query_lists_rows() {
        let storage = storage().await;
        storage.set_collection(3, "a").await.unwrap();
        storage.set_collection(3, "b").await.unwrap();
        let rows = storage
            .exec
            .fetch_all(COLLECTION_NAMES, &[3i64.into()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }
}
