//! Cache overlay in front of the SQL engine.
//!
//! Cache layout per user:
//!
//! | Key | Value |
//! |-----|-------|
//! | `<uid>:meta:global` | the `meta/global` item (JSON) |
//! | `<uid>:tabs` | every tab, keyed by id (JSON). Never stored in SQL. |
//! | `<uid>:size` | total payload bytes (decimal counter) |
//! | `<uid>:size:ts` | epoch seconds of the last size recalculation |
//! | `<uid>:stamps` | collection name to last modification (JSON) |
//!
//! SQL is written first, the cache second. Cached values are advisory: a
//! failing cache is logged and the SQL answer is used instead. Tabs have no
//! SQL copy, so tab operations fail with `StorageError::CacheUnavailable`
//! while the cache is down.

use crate::error::{StorageError, StorageResult};
use crate::metrics::{CACHE_FALLBACKS, QUOTA_RECALCULATIONS};
use crate::models::{CollectionRecord, UserField, UserRecord, UserUpdate};
use crate::repos::{CollectionRepo, ItemRepo, QuotaRepo, UserRepo};
use crate::store::SyncStorage;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use weave_cache::{CacheBackend, CacheError};
use weave_core::collection::is_meta_global;
use weave_core::config::QuotaConfig;
use weave_core::{
    CollectionId, ItemQuery, ItemUpdate, MAX_TTL, META_COLLECTION, META_GLOBAL_ID,
    TABS_COLLECTION, Timestamp, UserId, Wbo, WboField,
};

const KB: f64 = 1024.0;

type Tabs = BTreeMap<String, Wbo>;
type Stamps = BTreeMap<String, Timestamp>;

fn meta_key(user_id: UserId) -> String {
    format!("{user_id}:meta:global")
}

fn tabs_key(user_id: UserId) -> String {
    format!("{user_id}:tabs")
}

fn size_key(user_id: UserId) -> String {
    format!("{user_id}:size")
}

fn size_ts_key(user_id: UserId) -> String {
    format!("{user_id}:size:ts")
}

fn stamps_key(user_id: UserId) -> String {
    format!("{user_id}:stamps")
}

fn fallback(operation: &'static str, user_id: UserId, err: &CacheError) {
    CACHE_FALLBACKS.with_label_values(&[operation]).inc();
    tracing::warn!(operation, user_id, error = %err, "Cache unavailable, falling back to SQL");
}

fn tabs_unavailable(user_id: UserId, err: CacheError) -> StorageError {
    tracing::error!(user_id, error = %err, "Cache unavailable for tabs");
    StorageError::CacheUnavailable(err.to_string())
}

fn project(wbo: Wbo, fields: Option<&[WboField]>) -> Wbo {
    match fields {
        Some(fields) => wbo.project(fields),
        None => wbo,
    }
}

/// Apply a write to an in-memory item, the way the SQL engine applies it
/// to a row.
fn apply_update(
    existing: Option<Wbo>,
    id: &str,
    update: &ItemUpdate,
    storage_time: Timestamp,
    stamp: bool,
) -> Wbo {
    let mut wbo = existing.unwrap_or_else(|| Wbo {
        id: id.to_string(),
        ..Wbo::default()
    });
    if let Some(parentid) = &update.parentid {
        wbo.parentid = Some(parentid.clone());
    }
    if let Some(predecessorid) = &update.predecessorid {
        wbo.predecessorid = Some(predecessorid.clone());
    }
    if let Some(sortindex) = update.sortindex {
        wbo.sortindex = Some(sortindex);
    }
    if let Some(payload) = &update.payload {
        wbo.payload = Some(payload.clone());
        wbo.payload_size = update.payload_size();
    }
    let modified = match (update.modified, &update.payload) {
        (Some(explicit), _) => Some(explicit),
        (None, Some(_)) => Some(storage_time),
        (None, None) if stamp => Some(storage_time),
        (None, None) => None,
    };
    if modified.is_some() {
        wbo.modified = modified;
    }
    wbo.ttl = Some(match update.ttl {
        Some(ttl) => storage_time.whole_secs().saturating_add(ttl),
        None => MAX_TTL,
    });
    wbo
}

fn live(wbo: &Wbo, now_secs: i64) -> bool {
    wbo.ttl.is_none_or(|ttl| ttl > now_secs)
}

fn payload_bytes(items: &[ItemUpdate]) -> u64 {
    items
        .iter()
        .filter_map(|i| i.payload.as_ref())
        .map(|p| p.len() as u64)
        .sum()
}

fn tabs_size_kb(tabs: &Tabs, now_secs: i64) -> f64 {
    tabs.values()
        .filter(|t| live(t, now_secs))
        .map(|t| t.payload_bytes())
        .sum::<i64>() as f64
        / KB
}

fn tabs_stamp(tabs: &Tabs, now_secs: i64) -> Option<Timestamp> {
    tabs.values()
        .filter(|t| live(t, now_secs))
        .filter_map(|t| t.modified)
        .max()
}

/// Storage that serves hot paths from a [`CacheBackend`].
pub struct CachedStorage {
    inner: Arc<dyn SyncStorage>,
    cache: Arc<dyn CacheBackend>,
    /// Serializes read-modify-write cycles on a user's tabs blob within this
    /// process.
    tab_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl CachedStorage {
    pub fn new(inner: Arc<dyn SyncStorage>, cache: Arc<dyn CacheBackend>) -> Self {
        Self {
            inner,
            cache,
            tab_locks: DashMap::new(),
        }
    }

    fn tab_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.tab_locks.entry(user_id).or_default().clone()
    }

    pub fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Treat garbage as a miss; the next write replaces it.
                tracing::warn!(key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        let raw = serde_json::to_vec(value).map_err(|e| CacheError::Protocol(e.to_string()))?;
        self.cache.set(key, Bytes::from(raw)).await
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let Some(raw) = self.cache.get(key).await? else {
            return Ok(None);
        };
        Ok(std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.trim().parse().ok()))
    }

    async fn set_u64(&self, key: &str, value: u64) -> Result<(), CacheError> {
        self.cache.set(key, Bytes::from(value.to_string())).await
    }

    // -------------------------------------------------------------------------
    // Tabs
    // -------------------------------------------------------------------------

    async fn load_tabs(&self, user_id: UserId) -> StorageResult<Tabs> {
        self.get_json::<Tabs>(&tabs_key(user_id))
            .await
            .map(Option::unwrap_or_default)
            .map_err(|e| tabs_unavailable(user_id, e))
    }

    async fn store_tabs(&self, user_id: UserId, tabs: &Tabs) -> StorageResult<()> {
        self.set_json(&tabs_key(user_id), tabs)
            .await
            .map_err(|e| tabs_unavailable(user_id, e))
    }

    /// Tabs for aggregate views. An unreachable cache counts as no tabs.
    async fn tabs_for_aggregates(&self, user_id: UserId, operation: &'static str) -> Tabs {
        match self.get_json::<Tabs>(&tabs_key(user_id)).await {
            Ok(tabs) => tabs.unwrap_or_default(),
            Err(e) => {
                fallback(operation, user_id, &e);
                Tabs::new()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Stamps and sizes
    // -------------------------------------------------------------------------

    async fn stamps_from_sql(&self, user_id: UserId) -> StorageResult<Stamps> {
        let mut stamps = self.inner.get_collection_timestamps(user_id).await?;
        let tabs = self.tabs_for_aggregates(user_id, "stamps").await;
        if let Some(stamp) = tabs_stamp(&tabs, Timestamp::now().whole_secs()) {
            stamps.insert(TABS_COLLECTION.to_string(), stamp);
        }
        Ok(stamps)
    }

    async fn update_stamps<F>(&self, user_id: UserId, change: F)
    where
        F: FnOnce(&mut Stamps) + Send,
    {
        let mut stamps = match self.get_collection_timestamps(user_id).await {
            Ok(stamps) => stamps,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Could not refresh collection timestamps");
                return;
            }
        };
        change(&mut stamps);
        if let Err(e) = self.set_json(&stamps_key(user_id), &stamps).await {
            fallback("update_stamps", user_id, &e);
        }
    }

    async fn touch_stamp(&self, user_id: UserId, collection: &str, storage_time: Timestamp) {
        self.update_stamps(user_id, |stamps| {
            stamps.insert(collection.to_string(), storage_time);
        })
        .await;
    }

    async fn add_size(&self, user_id: UserId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        match self.cache.incr(&size_key(user_id), bytes).await {
            Ok(Some(_)) => {}
            // No counter yet: seed it from storage, which already holds this write.
            Ok(None) => {
                if let Err(e) = self.recalculate_total(user_id).await {
                    tracing::warn!(user_id, error = %e, "Could not seed storage size");
                }
            }
            Err(e) => fallback("incr_size", user_id, &e),
        }
    }

    async fn cache_total_bytes(&self, user_id: UserId, kb: f64) {
        let bytes = (kb * KB).round().max(0.0) as u64;
        if let Err(e) = self.set_u64(&size_key(user_id), bytes).await {
            fallback("set_size", user_id, &e);
        }
    }

    /// Total size from SQL plus tabs, written back to the cache.
    async fn recalculate_total(&self, user_id: UserId) -> StorageResult<f64> {
        QUOTA_RECALCULATIONS.inc();
        let tabs = self.tabs_for_aggregates(user_id, "recalculate_size").await;
        let total = self.inner.get_total_size(user_id, true).await?
            + tabs_size_kb(&tabs, Timestamp::now().whole_secs());
        self.cache_total_bytes(user_id, total).await;
        let now = Timestamp::now().whole_secs().max(0) as u64;
        if let Err(e) = self.set_u64(&size_ts_key(user_id), now).await {
            fallback("set_size_ts", user_id, &e);
        }
        tracing::debug!(user_id, total_kb = total, "Recalculated storage size");
        Ok(total)
    }

    async fn recalculation_due(&self, user_id: UserId) -> bool {
        match self.get_u64(&size_ts_key(user_id)).await {
            Ok(Some(last)) => {
                let now = Timestamp::now().whole_secs().max(0) as u64;
                now.saturating_sub(last) > self.inner.quota().recalculation_secs
            }
            Ok(None) => true,
            Err(e) => {
                fallback("size_ts", user_id, &e);
                true
            }
        }
    }

    // -------------------------------------------------------------------------
    // meta/global
    // -------------------------------------------------------------------------

    async fn refresh_meta_global(&self, user_id: UserId) {
        let key = meta_key(user_id);
        let result = match self
            .inner
            .get_item(user_id, META_COLLECTION, META_GLOBAL_ID, None)
            .await
        {
            Ok(Some(wbo)) => self.set_json(&key, &wbo).await,
            Ok(None) => self.cache.delete(&key).await.map(|_| ()),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Could not reload meta/global");
                self.cache.delete(&key).await.map(|_| ())
            }
        };
        if let Err(e) = result {
            fallback("set_meta_global", user_id, &e);
        }
    }

    async fn forget_meta_global(&self, user_id: UserId) {
        if let Err(e) = self.cache.delete(&meta_key(user_id)).await {
            fallback("delete_meta_global", user_id, &e);
        }
    }

    async fn cached_meta_global(&self, user_id: UserId) -> Option<Wbo> {
        match self.get_json::<Wbo>(&meta_key(user_id)).await {
            Ok(Some(wbo)) if live(&wbo, Timestamp::now().whole_secs()) => Some(wbo),
            Ok(_) => None,
            Err(e) => {
                fallback("get_meta_global", user_id, &e);
                None
            }
        }
    }

    async fn flush_user(&self, user_id: UserId) {
        self.tab_locks.remove(&user_id);
        let keys = [
            meta_key(user_id),
            tabs_key(user_id),
            size_key(user_id),
            size_ts_key(user_id),
            stamps_key(user_id),
        ];
        for key in &keys {
            if let Err(e) = self.cache.delete(key).await {
                fallback("flush", user_id, &e);
            }
        }
    }

    async fn delete_tabs(
        &self,
        user_id: UserId,
        item_ids: Option<&[String]>,
        query: &ItemQuery,
        storage_time: Timestamp,
    ) -> StorageResult<bool> {
        let lock = self.tab_lock(user_id);
        let guard = lock.lock().await;
        let mut tabs = self.load_tabs(user_id).await?;
        let candidates = tabs
            .values()
            .filter(|t| item_ids.is_none_or(|ids| ids.contains(&t.id)))
            .cloned();
        let mut all = query.clone();
        all.filters.include_expired = true;
        let victims = all.apply(candidates, Timestamp::now().whole_secs());
        if victims.is_empty() {
            return Ok(false);
        }
        for victim in &victims {
            tabs.remove(&victim.id);
        }
        self.store_tabs(user_id, &tabs).await?;
        drop(guard);
        self.touch_stamp(user_id, TABS_COLLECTION, storage_time).await;
        Ok(true)
    }
}

#[async_trait]
impl UserRepo for CachedStorage {
    async fn user_exists(&self, user_id: UserId) -> StorageResult<bool> {
        self.inner.user_exists(user_id).await
    }

    async fn set_user(&self, user_id: UserId, values: &UserUpdate) -> StorageResult<()> {
        self.inner.set_user(user_id, values).await
    }

    async fn get_user(
        &self,
        user_id: UserId,
        fields: Option<&[UserField]>,
    ) -> StorageResult<Option<UserRecord>> {
        self.inner.get_user(user_id, fields).await
    }

    async fn delete_user(&self, user_id: UserId) -> StorageResult<()> {
        self.inner.delete_user(user_id).await?;
        self.flush_user(user_id).await;
        Ok(())
    }
}

#[async_trait]
impl CollectionRepo for CachedStorage {
    async fn collection_exists(&self, user_id: UserId, name: &str) -> StorageResult<bool> {
        if name == TABS_COLLECTION {
            return Ok(!self.load_tabs(user_id).await?.is_empty());
        }
        self.inner.collection_exists(user_id, name).await
    }

    async fn set_collection(&self, user_id: UserId, name: &str) -> StorageResult<CollectionId> {
        self.inner.set_collection(user_id, name).await
    }

    async fn get_collection(
        &self,
        user_id: UserId,
        name: &str,
        create: bool,
    ) -> StorageResult<Option<CollectionRecord>> {
        self.inner.get_collection(user_id, name, create).await
    }

    async fn get_collections(&self, user_id: UserId) -> StorageResult<Vec<CollectionRecord>> {
        self.inner.get_collections(user_id).await
    }

    async fn get_collection_names(
        &self,
        user_id: UserId,
    ) -> StorageResult<Vec<(CollectionId, String)>> {
        self.inner.get_collection_names(user_id).await
    }

    async fn delete_collection(&self, user_id: UserId, name: &str) -> StorageResult<bool> {
        let deleted = if name == TABS_COLLECTION {
            let lock = self.tab_lock(user_id);
            let _guard = lock.lock().await;
            let tabs = self.load_tabs(user_id).await?;
            match self.cache.delete(&tabs_key(user_id)).await {
                Ok(_) => !tabs.is_empty(),
                Err(e) => return Err(tabs_unavailable(user_id, e)),
            }
        } else {
            let deleted = self.inner.delete_collection(user_id, name).await?;
            if name == META_COLLECTION {
                self.forget_meta_global(user_id).await;
            }
            deleted
        };
        if deleted {
            self.update_stamps(user_id, |stamps| {
                stamps.remove(name);
            })
            .await;
        }
        Ok(deleted)
    }

    async fn get_collection_timestamps(&self, user_id: UserId) -> StorageResult<Stamps> {
        match self.get_json::<Stamps>(&stamps_key(user_id)).await {
            Ok(Some(stamps)) => return Ok(stamps),
            Ok(None) => {}
            Err(e) => {
                fallback("get_stamps", user_id, &e);
                return self.stamps_from_sql(user_id).await;
            }
        }
        let stamps = self.stamps_from_sql(user_id).await?;
        if let Err(e) = self.set_json(&stamps_key(user_id), &stamps).await {
            fallback("set_stamps", user_id, &e);
        }
        Ok(stamps)
    }

    async fn get_collection_counts(&self, user_id: UserId) -> StorageResult<BTreeMap<String, u64>> {
        let mut counts = self.inner.get_collection_counts(user_id).await?;
        let now = Timestamp::now().whole_secs();
        let tabs = self.tabs_for_aggregates(user_id, "counts").await;
        let live_tabs = tabs.values().filter(|t| live(t, now)).count() as u64;
        if live_tabs > 0 {
            counts.insert(TABS_COLLECTION.to_string(), live_tabs);
        }
        Ok(counts)
    }

    async fn get_collection_sizes(&self, user_id: UserId) -> StorageResult<BTreeMap<String, f64>> {
        let mut sizes = self.inner.get_collection_sizes(user_id).await?;
        let tabs = self.tabs_for_aggregates(user_id, "sizes").await;
        if !tabs.is_empty() {
            sizes.insert(
                TABS_COLLECTION.to_string(),
                tabs_size_kb(&tabs, Timestamp::now().whole_secs()),
            );
        }
        // Every size is at hand: refresh the cached total while here.
        self.cache_total_bytes(user_id, sizes.values().sum()).await;
        Ok(sizes)
    }

    async fn get_collection_max_timestamp(
        &self,
        user_id: UserId,
        name: &str,
    ) -> StorageResult<Option<Timestamp>> {
        Ok(self.get_collection_timestamps(user_id).await?.get(name).copied())
    }
}

#[async_trait]
impl ItemRepo for CachedStorage {
    async fn item_exists(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
    ) -> StorageResult<Option<Timestamp>> {
        if collection == TABS_COLLECTION {
            let tabs = self.load_tabs(user_id).await?;
            return Ok(tabs
                .get(item_id)
                .map(|t| t.modified.unwrap_or(Timestamp::ZERO)));
        }
        if is_meta_global(collection, item_id)
            && let Some(wbo) = self.cached_meta_global(user_id).await
        {
            return Ok(Some(wbo.modified.unwrap_or(Timestamp::ZERO)));
        }
        self.inner.item_exists(user_id, collection, item_id).await
    }

    async fn get_items(
        &self,
        user_id: UserId,
        collection: &str,
        fields: Option<&[WboField]>,
        query: &ItemQuery,
    ) -> StorageResult<Vec<Wbo>> {
        if collection != TABS_COLLECTION {
            return self.inner.get_items(user_id, collection, fields, query).await;
        }
        let tabs = self.load_tabs(user_id).await?;
        Ok(query
            .apply(tabs.into_values(), Timestamp::now().whole_secs())
            .into_iter()
            .map(|t| project(t, fields))
            .collect())
    }

    async fn get_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        fields: Option<&[WboField]>,
    ) -> StorageResult<Option<Wbo>> {
        if collection == TABS_COLLECTION {
            let mut tabs = self.load_tabs(user_id).await?;
            let now = Timestamp::now().whole_secs();
            return Ok(tabs
                .remove(item_id)
                .filter(|t| live(t, now))
                .map(|t| project(t, fields)));
        }
        if !is_meta_global(collection, item_id) {
            return self.inner.get_item(user_id, collection, item_id, fields).await;
        }

        if let Some(wbo) = self.cached_meta_global(user_id).await {
            return Ok(Some(project(wbo, fields)));
        }
        let wbo = self.inner.get_item(user_id, collection, item_id, None).await?;
        if let Some(wbo) = &wbo
            && let Err(e) = self.set_json(&meta_key(user_id), wbo).await
        {
            fallback("set_meta_global", user_id, &e);
        }
        Ok(wbo.map(|w| project(w, fields)))
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

        let modified = if collection == TABS_COLLECTION {
            let lock = self.tab_lock(user_id);
            let _guard = lock.lock().await;
            let mut tabs = self.load_tabs(user_id).await?;
            let tab = apply_update(tabs.remove(item_id), item_id, item, storage_time, false);
            let modified = tab.modified.unwrap_or(storage_time);
            tabs.insert(item_id.to_string(), tab);
            self.store_tabs(user_id, &tabs).await?;
            Some(modified)
        } else {
            let modified = self
                .inner
                .set_item(user_id, collection, item_id, item, Some(storage_time))
                .await?;
            if is_meta_global(collection, item_id) {
                self.refresh_meta_global(user_id).await;
            }
            modified
        };

        self.add_size(user_id, payload_bytes(std::slice::from_ref(item)))
            .await;
        self.touch_stamp(user_id, collection, storage_time).await;
        Ok(modified)
    }

    async fn set_items(
        &self,
        user_id: UserId,
        collection: &str,
        items: &[ItemUpdate],
        storage_time: Option<Timestamp>,
    ) -> StorageResult<usize> {
        let storage_time = storage_time.unwrap_or_else(Timestamp::now);

        let written = if collection == TABS_COLLECTION {
            let lock = self.tab_lock(user_id);
            let _guard = lock.lock().await;
            let mut tabs = self.load_tabs(user_id).await?;
            let mut written = 0;
            for item in items {
                let Some(id) = item.id.as_deref() else {
                    continue;
                };
                let tab = apply_update(tabs.remove(id), id, item, storage_time, true);
                tabs.insert(id.to_string(), tab);
                written += 1;
            }
            self.store_tabs(user_id, &tabs).await?;
            written
        } else {
            let written = self
                .inner
                .set_items(user_id, collection, items, Some(storage_time))
                .await?;
            let touches_meta_global = collection == META_COLLECTION
                && items.iter().any(|i| i.id.as_deref() == Some(META_GLOBAL_ID));
            if touches_meta_global {
                self.refresh_meta_global(user_id).await;
            }
            written
        };

        if written > 0 {
            self.add_size(user_id, payload_bytes(items)).await;
            self.touch_stamp(user_id, collection, storage_time).await;
        }
        Ok(written)
    }

    async fn delete_item(
        &self,
        user_id: UserId,
        collection: &str,
        item_id: &str,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<bool> {
        let storage_time = storage_time.unwrap_or_else(Timestamp::now);
        if collection == TABS_COLLECTION {
            let ids = [item_id.to_string()];
            return self
                .delete_tabs(user_id, Some(&ids), &ItemQuery::default(), storage_time)
                .await;
        }

        // Cached size is left alone; the next recalculation corrects it.
        let deleted = self
            .inner
            .delete_item(user_id, collection, item_id, Some(storage_time))
            .await?;
        if is_meta_global(collection, item_id) {
            self.forget_meta_global(user_id).await;
        }
        if deleted {
            self.touch_stamp(user_id, collection, storage_time).await;
        }
        Ok(deleted)
    }

    async fn delete_items(
        &self,
        user_id: UserId,
        collection: &str,
        item_ids: Option<&[String]>,
        query: &ItemQuery,
        storage_time: Option<Timestamp>,
    ) -> StorageResult<bool> {
        let storage_time = storage_time.unwrap_or_else(Timestamp::now);
        if collection == TABS_COLLECTION {
            return self
                .delete_tabs(user_id, item_ids, query, storage_time)
                .await;
        }

        let deleted = self
            .inner
            .delete_items(user_id, collection, item_ids, query, Some(storage_time))
            .await?;
        let may_hit_meta_global = collection == META_COLLECTION
            && item_ids.is_none_or(|ids| ids.iter().any(|id| id == META_GLOBAL_ID));
        if may_hit_meta_global {
            self.forget_meta_global(user_id).await;
        }
        if deleted {
            self.touch_stamp(user_id, collection, storage_time).await;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl QuotaRepo for CachedStorage {
    async fn get_total_size(&self, user_id: UserId, recalculate: bool) -> StorageResult<f64> {
        if recalculate && self.recalculation_due(user_id).await {
            return self.recalculate_total(user_id).await;
        }
        match self.get_u64(&size_key(user_id)).await {
            Ok(Some(bytes)) => Ok(bytes as f64 / KB),
            Ok(None) => self.recalculate_total(user_id).await,
            Err(e) => {
                fallback("get_size", user_id, &e);
                self.inner.get_total_size(user_id, true).await
            }
        }
    }

    /// Without `recalculate` this reads the cached total, recalculating only
    /// when no counter exists yet. It runs before every write.
    async fn get_size_left(&self, user_id: UserId, recalculate: bool) -> StorageResult<f64> {
        let quota = self.inner.quota().size_kb as f64;
        if recalculate {
            return Ok(quota - self.get_total_size(user_id, true).await?);
        }
        match self.get_u64(&size_key(user_id)).await {
            Ok(Some(bytes)) => Ok(quota - bytes as f64 / KB),
            Ok(None) => Ok(quota - self.recalculate_total(user_id).await?),
            Err(e) => {
                fallback("get_size_left", user_id, &e);
                Ok(quota - self.inner.get_total_size(user_id, true).await?)
            }
        }
    }
}

#[async_trait]
impl SyncStorage for CachedStorage {
    fn name(&self) -> &'static str {
        "cached"
    }

    fn quota(&self) -> &QuotaConfig {
        self.inner.quota()
    }

    async fn migrate(&self) -> StorageResult<()> {
        self.inner.migrate().await
    }

    async fn delete_storage(&self, user_id: UserId) -> StorageResult<()> {
        self.inner.delete_storage(user_id).await?;
        self.flush_user(user_id).await;
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.inner.health_check().await?;
        if let Err(e) = self.cache.health_check().await {
            tracing::warn!(cache = self.cache.name(), error = %e, "Cache health check failed");
        }
        Ok(())
    }
}
