//! Incoming request data and query argument parsing.

use crate::error::{ControllerError, ControllerResult};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::str::FromStr;
use weave_core::collection::validate_collection_name;
use weave_core::wbo::check_id_text;
use weave_core::{ItemFilters, ItemQuery, Sort, Timestamp, UserId};

/// Precondition header for writes and deletes.
pub const X_IF_UNMODIFIED_SINCE: HeaderName = HeaderName::from_static("x-if-unmodified-since");
/// Required by `delete_storage`.
pub const X_CONFIRM_DELETE: HeaderName = HeaderName::from_static("x-confirm-delete");

/// One authenticated request, already routed.
///
/// `server_time` is the authoritative timestamp for every write the request
/// makes.
#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub user_id: UserId,
    pub collection: Option<String>,
    pub item: Option<String>,
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub server_time: Timestamp,
}

impl SyncRequest {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            collection: None,
            item: None,
            params: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            server_time: Timestamp::now(),
        }
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn item(mut self, id: impl Into<String>) -> Self {
        self.item = Some(id.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Add a header. Values that are not valid header text are dropped.
    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn at(mut self, server_time: Timestamp) -> Self {
        self.server_time = server_time;
        self
    }

    /// The routed collection name, validated.
    pub fn collection_name(&self) -> ControllerResult<&str> {
        let name = self
            .collection
            .as_deref()
            .ok_or_else(|| ControllerError::BadRequest("missing collection".to_string()))?;
        validate_collection_name(name)?;
        Ok(name)
    }

    /// The routed item id, validated.
    pub fn item_id(&self) -> ControllerResult<&str> {
        let id = self
            .item
            .as_deref()
            .ok_or_else(|| ControllerError::BadRequest("missing item id".to_string()))?;
        check_id_text(id, "id").map_err(|_| ControllerError::BadRequest(format!("invalid item id '{id}'")))?;
        Ok(id)
    }

    /// Last value given for a query parameter.
    pub fn param_value(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `X-If-Unmodified-Since`, if sent.
    pub fn if_unmodified_since(&self) -> ControllerResult<Option<Timestamp>> {
        let Some(value) = self.headers.get(&X_IF_UNMODIFIED_SINCE) else {
            return Ok(None);
        };
        value
            .to_str()
            .ok()
            .and_then(|v| Timestamp::from_str(v).ok())
            .map(Some)
            .ok_or_else(|| {
                ControllerError::BadRequest("Invalid value for \"X-If-Unmodified-Since\"".to_string())
            })
    }

    pub fn confirms_delete(&self) -> bool {
        self.headers.contains_key(&X_CONFIRM_DELETE)
    }

    /// Parse the listing arguments of a collection `GET` or `DELETE`.
    /// Unknown parameters are ignored.
    pub fn collection_args(&self) -> ControllerResult<CollectionArgs> {
        let mut filters = ItemFilters {
            older: self.timestamp_param("older")?,
            newer: self.timestamp_param("newer")?,
            index_above: self.float_param("index_above")?,
            index_below: self.float_param("index_below")?,
            ..ItemFilters::default()
        };
        filters.parentid = self.param_value("parentid").map(str::to_string);
        filters.predecessorid = self.param_value("predecessorid").map(str::to_string);
        filters.ids = self
            .param_value("ids")
            .map(|ids| ids.split(',').map(str::to_string).collect());

        let limit = self.count_param("limit")?;
        let offset = self.count_param("offset")?;
        let query = ItemQuery {
            filters,
            limit,
            offset: limit.and(offset),
            // An unknown sort is no sort.
            sort: self.param_value("sort").and_then(Sort::parse),
        };
        let full = self.param_value("full").is_some_and(|v| !v.is_empty());
        Ok(CollectionArgs { query, full })
    }

    fn timestamp_param(&self, name: &str) -> ControllerResult<Option<Timestamp>> {
        self.param_value(name)
            .map(|v| Timestamp::from_str(v).map_err(|_| invalid_param(name)))
            .transpose()
    }

    fn float_param(&self, name: &str) -> ControllerResult<Option<f64>> {
        self.param_value(name)
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| invalid_param(name))
            })
            .transpose()
    }

    fn count_param(&self, name: &str) -> ControllerResult<Option<u64>> {
        self.param_value(name)
            .map(|v| v.trim().parse::<u64>().map_err(|_| invalid_param(name)))
            .transpose()
    }
}

fn invalid_param(name: &str) -> ControllerError {
    ControllerError::BadRequest(format!("Invalid value for \"{name}\""))
}

/// Parsed collection listing arguments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionArgs {
    pub query: ItemQuery,
    /// Return whole items rather than ids.
    pub full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_filter() {
        let request = SyncRequest::new(1)
            .param("older", "100.5")
            .param("newer", "10")
            .param("index_above", "-3")
            .param("index_below", "7.5")
            .param("ids", "a,b")
            .param("parentid", "p")
            .param("sort", "index")
            .param("limit", "10")
            .param("offset", "20")
            .param("full", "1")
            .param("unknown", "x");
        let args = request.collection_args().unwrap();
        let filters = &args.query.filters;
        assert_eq!(filters.older, Some(Timestamp::from_centis(10_050)));
        assert_eq!(filters.newer, Some(Timestamp::from_secs(10)));
        assert_eq!(filters.index_above, Some(-3.0));
        assert_eq!(filters.index_below, Some(7.5));
        assert_eq!(filters.ids, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(filters.parentid.as_deref(), Some("p"));
        assert_eq!(args.query.sort, Some(Sort::Index));
        assert_eq!(args.query.limit, Some(10));
        assert_eq!(args.query.offset, Some(20));
        assert!(args.full);
    }

    #[test]
    fn offset_needs_limit() {
        let args = SyncRequest::new(1).param("offset", "5").collection_args().unwrap();
        assert_eq!(args.query.offset, None);
        assert!(!args.full);
    }

    #[test]
    fn unknown_sort_is_ignored() {
        let args = SyncRequest::new(1).param("sort", "random").collection_args().unwrap();
        assert_eq!(args.query.sort, None);
    }

    #[test]
    fn malformed_values_are_bad_requests() {
        for (name, value) in [
            ("older", "yesterday"),
            ("newer", "1.2.3"),
            ("index_above", "high"),
            ("index_below", "NaN"),
            ("limit", "-1"),
            ("offset", "ten"),
        ] {
            let err = SyncRequest::new(1).param(name, value).collection_args().unwrap_err();
            match err {
                ControllerError::BadRequest(msg) => assert!(msg.contains(name), "{msg}"),
                other => panic!("unexpected error for {name}: {other:?}"),
            }
        }
    }

    #[test]
    fn reads_precondition_header() {
        let request = SyncRequest::new(1).header(X_IF_UNMODIFIED_SINCE, "123.45");
        assert_eq!(
            request.if_unmodified_since().unwrap(),
            Some(Timestamp::from_centis(12_345))
        );
        let bad = SyncRequest::new(1).header(X_IF_UNMODIFIED_SINCE, "soon");
        assert!(bad.if_unmodified_since().is_err());
        assert_eq!(SyncRequest::new(1).if_unmodified_since().unwrap(), None);
    }

    #[test]
    fn validates_routed_names() {
        let request = SyncRequest::new(1).collection("bad name").item("a/b");
        assert!(request.collection_name().is_err());
        assert!(request.item_id().is_err());
        let request = SyncRequest::new(1).collection("bookmarks").item("abc");
        assert_eq!(request.collection_name().unwrap(), "bookmarks");
        assert_eq!(request.item_id().unwrap(), "abc");
    }
}
