//! Storage controller: the request-facing side of the storage engine.
//!
//! Every call receives a routed, authenticated [`SyncRequest`] and produces
//! a [`SyncResponse`]. Validation, quota and precondition failures are
//! detected here before storage is touched.

use crate::error::{ControllerError, ControllerResult};
use crate::metrics::{self, BATCH_ITEMS, PRECONDITION_FAILURES, QUOTA_REJECTIONS};
use crate::request::SyncRequest;
use crate::response::{Format, SyncResponse, X_WEAVE_QUOTA_REMAINING};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use weave_core::config::BatchConfig;
use weave_core::wbo::validate_id;
use weave_core::{ItemUpdate, Timestamp, UserId, WboField};
use weave_storage::SyncStorage;

/// Remaining quota (KB) under which a cached total is re-checked against
/// SQL and reported to the client.
pub const QUOTA_WARNING_KB: f64 = 1024.0;

/// Outcome of a batch write.
#[derive(Debug, Default, Serialize)]
pub struct BatchResult {
    pub success: Vec<String>,
    pub failed: BTreeMap<String, Vec<String>>,
    pub modified: Timestamp,
}

impl BatchResult {
    fn fail(&mut self, id: impl Into<String>, reason: impl Into<String>) {
        self.failed.insert(id.into(), vec![reason.into()]);
    }
}

pub struct StorageController {
    storage: Arc<dyn SyncStorage>,
    batch: BatchConfig,
}

impl StorageController {
    pub fn new(storage: Arc<dyn SyncStorage>, batch: BatchConfig) -> Self {
        Self { storage, batch }
    }

    pub fn storage(&self) -> &Arc<dyn SyncStorage> {
        &self.storage
    }

    /// Convert a call result into a response, errors included.
    pub fn respond(result: ControllerResult<SyncResponse>) -> SyncResponse {
        result.unwrap_or_else(ControllerError::into_response)
    }

    fn finish(
        operation: &'static str,
        request: &SyncRequest,
        result: ControllerResult<SyncResponse>,
    ) -> ControllerResult<SyncResponse> {
        metrics::record(operation, result.is_ok());
        if let Err(e) = &result {
            tracing::debug!(operation, user_id = request.user_id, error = %e, "Request failed");
        }
        result.map(|r| r.with_timestamp(request.server_time))
    }

    // -------------------------------------------------------------------------
    // info/*
    // -------------------------------------------------------------------------

    /// Last modification time of every collection.
    pub async fn get_collections(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let stamps = self.storage.get_collection_timestamps(request.user_id).await?;
            Ok(SyncResponse::formatted(Format::negotiate(&request.headers), &stamps)?
                .with_records(stamps.len()))
        }
        .await;
        Self::finish("get_collections", request, result)
    }

    pub async fn get_collection_counts(
        &self,
        request: &SyncRequest,
    ) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let counts = self.storage.get_collection_counts(request.user_id).await?;
            Ok(SyncResponse::formatted(Format::negotiate(&request.headers), &counts)?
                .with_records(counts.len()))
        }
        .await;
        Self::finish("get_collection_counts", request, result)
    }

    /// `[used_kb, limit_kb]`, the limit being `null` without quota.
    pub async fn get_quota(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let used = self.storage.get_total_size(request.user_id, false).await?;
            let quota = self.storage.quota();
            let limit = quota.enabled.then_some(quota.size_kb);
            SyncResponse::json(&(used, limit))
        }
        .await;
        Self::finish("get_quota", request, result)
    }

    pub async fn get_collection_usage(
        &self,
        request: &SyncRequest,
    ) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let sizes = self.storage.get_collection_sizes(request.user_id).await?;
            SyncResponse::json(&sizes)
        }
        .await;
        Self::finish("get_collection_usage", request, result)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Ids of the matching items, or whole items with `full`.
    pub async fn get_collection(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let collection = request.collection_name()?;
            let args = request.collection_args()?;
            let fields = if args.full {
                WboField::PUBLIC
            } else {
                &[WboField::Id]
            };
            let items = self
                .storage
                .get_items(request.user_id, collection, Some(fields), &args.query)
                .await?;
            let format = Format::negotiate(&request.headers);
            let response = if args.full {
                SyncResponse::formatted(format, &items)?
            } else {
                let ids: Vec<&str> = items.iter().map(|w| w.id.as_str()).collect();
                SyncResponse::formatted(format, &ids)?
            };
            Ok(response.with_records(items.len()))
        }
        .await;
        Self::finish("get_collection", request, result)
    }

    pub async fn get_item(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let collection = request.collection_name()?;
            let item_id = request.item_id()?;
            let wbo = self
                .storage
                .get_item(request.user_id, collection, item_id, Some(WboField::PUBLIC))
                .await?
                .ok_or(ControllerError::NotFound)?;
            SyncResponse::json(&wbo)
        }
        .await;
        Self::finish("get_item", request, result)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store one item under the routed id.
    pub async fn set_item(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let item_id = request.item_id()?.to_string();
            let data: Value =
                serde_json::from_slice(&request.body).map_err(|_| ControllerError::MalformedJson)?;
            self.put_item(request, &item_id, &data).await
        }
        .await;
        Self::finish("set_item", request, result)
    }

    async fn put_item(
        &self,
        request: &SyncRequest,
        item_id: &str,
        data: &Value,
    ) -> ControllerResult<SyncResponse> {
        let user_id = request.user_id;
        let collection = request.collection_name()?;
        let left = self.check_quota(user_id).await?;
        self.check_unmodified(request, collection).await?;

        let update = ItemUpdate::from_json(data)?;
        let modified = self
            .storage
            .set_item(user_id, collection, item_id, &update, Some(request.server_time))
            .await?;
        Ok(Self::quota_header(SyncResponse::json(&modified)?, left))
    }

    /// Store a batch, or a single object as a batch of one.
    ///
    /// Items past `batch_max_count`, or that push the running payload total
    /// to `batch_max_bytes`, are reported as failed and may be retried by
    /// the client. Accepted items are written `batch_size` at a time; a
    /// failing group fails all of its items.
    pub async fn set_collection(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result = self.set_collection_inner(request).await;
        Self::finish("set_collection", request, result)
    }

    async fn set_collection_inner(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let user_id = request.user_id;
        let collection = request.collection_name()?;
        self.check_unmodified(request, collection).await?;

        let data: Value =
            serde_json::from_slice(&request.body).map_err(|_| ControllerError::MalformedJson)?;
        let wbos = match data {
            Value::Array(wbos) => wbos,
            single => {
                let Some(raw_id) = single.get("id") else {
                    return Err(ControllerError::InvalidWbo("invalid id".to_string()));
                };
                let id = validate_id(raw_id)?;
                return self.put_item(request, &id, &single).await;
            }
        };

        let mut result = BatchResult {
            modified: request.server_time,
            ..BatchResult::default()
        };
        let mut kept = Vec::with_capacity(wbos.len().min(self.batch.batch_max_count));
        let mut total_bytes = 0usize;
        for (count, value) in wbos.iter().enumerate() {
            if !value.is_object() {
                result.fail("", "invalid wbo");
                continue;
            }
            let Some(raw_id) = value.get("id") else {
                result.fail("", "invalid id");
                continue;
            };
            let update = match ItemUpdate::from_json(value) {
                Ok(update) => update,
                Err(e) => {
                    result.fail(id_text(raw_id), e.batch_message());
                    continue;
                }
            };
            let Some(id) = update.id.clone() else {
                result.fail("", "invalid id");
                continue;
            };

            if count >= self.batch.batch_max_count {
                result.fail(id, "retry wbo");
                continue;
            }
            if let Some(payload) = &update.payload {
                total_bytes += payload.len();
            }
            if total_bytes >= self.batch.batch_max_bytes {
                result.fail(id, "retry bytes");
                continue;
            }

            kept.push(update);
        }

        let left = self.check_quota(user_id).await?;

        for group in kept.chunks(self.batch.batch_size.max(1)) {
            let ids = group.iter().filter_map(|u| u.id.clone());
            match self
                .storage
                .set_items(user_id, collection, group, Some(request.server_time))
                .await
            {
                Ok(_) => result.success.extend(ids),
                Err(e) => {
                    tracing::error!(user_id, collection, items = group.len(), error = %e, "Could not set items");
                    for id in ids {
                        result.fail(id, "db error");
                    }
                }
            }
        }

        BATCH_ITEMS
            .with_label_values(&["success"])
            .inc_by(result.success.len() as u64);
        BATCH_ITEMS
            .with_label_values(&["failed"])
            .inc_by(result.failed.len() as u64);
        Ok(Self::quota_header(SyncResponse::json(&result)?, left))
    }

    // -------------------------------------------------------------------------
    // Deletes
    // -------------------------------------------------------------------------

    /// Delete the matching items, or the whole collection without filters.
    pub async fn delete_collection(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let collection = request.collection_name()?;
            let args = request.collection_args()?;
            self.check_unmodified(request, collection).await?;
            self.storage
                .delete_items(
                    request.user_id,
                    collection,
                    None,
                    &args.query,
                    Some(request.server_time),
                )
                .await?;
            SyncResponse::json(&request.server_time)
        }
        .await;
        Self::finish("delete_collection", request, result)
    }

    pub async fn delete_item(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            let collection = request.collection_name()?;
            let item_id = request.item_id()?;
            self.check_unmodified(request, collection).await?;
            self.storage
                .delete_item(request.user_id, collection, item_id, Some(request.server_time))
                .await?;
            SyncResponse::json(&request.server_time)
        }
        .await;
        Self::finish("delete_item", request, result)
    }

    /// Delete everything the user stored. Needs `X-Confirm-Delete`.
    pub async fn delete_storage(&self, request: &SyncRequest) -> ControllerResult<SyncResponse> {
        let result: ControllerResult<SyncResponse> = async {
            if !request.confirms_delete() {
                return Err(ControllerError::InvalidWrite);
            }
            self.storage.delete_storage(request.user_id).await?;
            tracing::info!(user_id = request.user_id, "Storage wiped on request");
            SyncResponse::json(&request.server_time)
        }
        .await;
        Self::finish("delete_storage", request, result)
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    /// Reject writes to a collection changed after `X-If-Unmodified-Since`.
    async fn check_unmodified(&self, request: &SyncRequest, collection: &str) -> ControllerResult<()> {
        let Some(since) = request.if_unmodified_since()? else {
            return Ok(());
        };
        let last = self
            .storage
            .get_collection_max_timestamp(request.user_id, collection)
            .await?;
        match last {
            Some(last) if last > since => {
                PRECONDITION_FAILURES.inc();
                Err(ControllerError::PreconditionFailed(collection.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Remaining quota in KB, or `None` when quota is off.
    async fn check_quota(&self, user_id: UserId) -> ControllerResult<Option<f64>> {
        if !self.storage.quota().enabled {
            return Ok(None);
        }
        let mut left = self.storage.get_size_left(user_id, false).await?;
        if left < QUOTA_WARNING_KB {
            left = self.storage.get_size_left(user_id, true).await?;
        }
        if left <= 0.0 {
            QUOTA_REJECTIONS.inc();
            tracing::info!(user_id, left_kb = left, "Write refused, user over quota");
            return Err(ControllerError::QuotaExceeded);
        }
        Ok(Some(left))
    }

    fn quota_header(response: SyncResponse, left: Option<f64>) -> SyncResponse {
        match left {
            Some(left) if left <= QUOTA_WARNING_KB => {
                response.with_header(X_WEAVE_QUOTA_REMAINING, format!("{left:.2}"))
            }
            _ => response,
        }
    }
}

/// Key used to report a failed item whose id could not be validated.
fn id_text(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
