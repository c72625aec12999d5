//! Weave Basic Objects: the stored record shape and inbound validation.

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of `id`, `parentid` and `predecessorid`.
pub const MAX_ID_LENGTH: usize = 64;

/// Maximum payload size in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

/// Absolute bound on `sortindex`.
pub const MAX_SORTINDEX: i64 = 999_999_999;

/// Expiry used for items written without a ttl (epoch seconds).
pub const MAX_TTL: i64 = 2_100_000_000;

/// A stored item as returned by reads.
///
/// `ttl` is the absolute expiry in epoch seconds. Fields left out of a
/// projection are `None` and are not serialized.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Wbo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parentid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predecessorid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Wbo {
    /// Keep only the requested fields. `id` is always kept.
    pub fn project(mut self, fields: &[WboField]) -> Self {
        let keep = |f: WboField| fields.contains(&f);
        if !keep(WboField::ParentId) {
            self.parentid = None;
        }
        if !keep(WboField::PredecessorId) {
            self.predecessorid = None;
        }
        if !keep(WboField::SortIndex) {
            self.sortindex = None;
        }
        if !keep(WboField::Modified) {
            self.modified = None;
        }
        if !keep(WboField::Payload) {
            self.payload = None;
        }
        if !keep(WboField::PayloadSize) {
            self.payload_size = None;
        }
        if !keep(WboField::Ttl) {
            self.ttl = None;
        }
        self
    }

    pub fn payload_bytes(&self) -> i64 {
        self.payload_size
            .or_else(|| self.payload.as_ref().map(|p| p.len() as i64))
            .unwrap_or(0)
    }
}

/// Columns of an item that a read can project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WboField {
    Id,
    ParentId,
    PredecessorId,
    SortIndex,
    Modified,
    Payload,
    PayloadSize,
    Ttl,
}

impl WboField {
    pub const ALL: &'static [WboField] = &[
        WboField::Id,
        WboField::ParentId,
        WboField::PredecessorId,
        WboField::SortIndex,
        WboField::Modified,
        WboField::Payload,
        WboField::PayloadSize,
        WboField::Ttl,
    ];

    /// Fields returned to clients for full listings and single reads.
    pub const PUBLIC: &'static [WboField] = &[
        WboField::Id,
        WboField::ParentId,
        WboField::PredecessorId,
        WboField::SortIndex,
        WboField::Modified,
        WboField::Payload,
    ];

    pub fn column(self) -> &'static str {
        match self {
            WboField::Id => "id",
            WboField::ParentId => "parentid",
            WboField::PredecessorId => "predecessorid",
            WboField::SortIndex => "sortindex",
            WboField::Modified => "modified",
            WboField::Payload => "payload",
            WboField::PayloadSize => "payload_size",
            WboField::Ttl => "ttl",
        }
    }
}

/// A validated write for one item.
///
/// Only the fields present are written; an update leaves absent columns
/// untouched. `ttl` is relative, in seconds from the storage time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub id: Option<String>,
    pub parentid: Option<String>,
    pub predecessorid: Option<String>,
    pub sortindex: Option<i64>,
    pub payload: Option<String>,
    pub ttl: Option<i64>,
    /// Explicit modification time. Writes carrying a payload get the
    /// storage time when this is unset.
    pub modified: Option<Timestamp>,
}

impl ItemUpdate {
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn sortindex(mut self, sortindex: i64) -> Self {
        self.sortindex = Some(sortindex);
        self
    }

    pub fn ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn parentid(mut self, parentid: impl Into<String>) -> Self {
        self.parentid = Some(parentid.into());
        self
    }

    pub fn predecessorid(mut self, predecessorid: impl Into<String>) -> Self {
        self.predecessorid = Some(predecessorid.into());
        self
    }

    pub fn payload_size(&self) -> Option<i64> {
        self.payload.as_ref().map(|p| p.len() as i64)
    }

    /// Parse and validate a JSON object received from a client.
    ///
    /// A client-supplied `modified` is ignored: the server assigns it.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::wbo("wbo", "invalid wbo"))?;

        let id = match obj.get("id") {
            None => None,
            Some(v) => Some(validate_id(v)?),
        };
        let parentid = optional_ref(obj.get("parentid"), "parentid")?;
        let predecessorid = optional_ref(obj.get("predecessorid"), "predecessorid")?;

        let sortindex = match obj.get("sortindex") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let n = integer(v).ok_or_else(|| Error::wbo("sortindex", "invalid sortindex"))?;
                if n.abs() > MAX_SORTINDEX {
                    return Err(Error::wbo("sortindex", "invalid sortindex"));
                }
                Some(n)
            }
        };

        let ttl = match obj.get("ttl") {
            None | Some(Value::Null) => None,
            Some(v) => match integer(v) {
                Some(n) if n >= 0 => Some(n),
                _ => return Err(Error::wbo("ttl", "invalid ttl")),
            },
        };

        let payload = match obj.get("payload") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => {
                if s.len() > MAX_PAYLOAD_BYTES {
                    return Err(Error::wbo("payload", "payload too large"));
                }
                Some(s.clone())
            }
            Some(_) => return Err(Error::wbo("payload", "payload needs to be a json string")),
        };

        Ok(Self {
            id,
            parentid,
            predecessorid,
            sortindex,
            payload,
            ttl,
            modified: None,
        })
    }
}

/// Validate an item id given as a string or a number.
pub fn validate_id(value: &Value) -> Result<String> {
    let id = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(Error::wbo("id", "invalid id")),
    };
    check_id_text(&id, "id")?;
    Ok(id)
}

/// Check an id taken from a URL or a body.
pub fn check_id_text(id: &str, field: &'static str) -> Result<()> {
    let len = id.chars().count();
    if len == 0 || len > MAX_ID_LENGTH {
        return Err(Error::wbo(field, format!("invalid {field}")));
    }
    if !id.chars().all(|c| c.is_ascii_graphic() || c == ' ') || id.contains('/') {
        return Err(Error::wbo(field, format!("invalid {field}")));
    }
    Ok(())
}

fn optional_ref(value: Option<&Value>, field: &'static str) -> Result<Option<String>> {
    let text = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(Error::wbo(field, format!("invalid {field}"))),
    };
    if text.chars().count() > MAX_ID_LENGTH {
        return Err(Error::wbo(field, format!("invalid {field}")));
    }
    Ok(Some(text))
}

fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_of(err: Error) -> &'static str {
        match err {
            Error::InvalidWbo { field, .. } => field,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn accepts_a_complete_item() {
        let item = ItemUpdate::from_json(&json!({
            "id": "abc",
            "parentid": "p",
            "predecessorid": "q",
            "sortindex": "12",
            "ttl": 60,
            "payload": "{}",
            "modified": 1.0,
        }))
        .unwrap();
        assert_eq!(item.id.as_deref(), Some("abc"));
        assert_eq!(item.sortindex, Some(12));
        assert_eq!(item.ttl, Some(60));
        assert_eq!(item.payload.as_deref(), Some("{}"));
        assert_eq!(item.modified, None);
    }

    #[test]
    fn numeric_ids_become_strings() {
        let item = ItemUpdate::from_json(&json!({"id": 42})).unwrap();
        assert_eq!(item.id.as_deref(), Some("42"));
    }

    #[test]
    fn rejects_structural_ids() {
        assert_eq!(field_of(ItemUpdate::from_json(&json!({"id": [1]})).unwrap_err()), "id");
        assert_eq!(field_of(ItemUpdate::from_json(&json!({"id": {"a": 1}})).unwrap_err()), "id");
        assert_eq!(field_of(ItemUpdate::from_json(&json!({"id": "a/b"})).unwrap_err()), "id");
        assert_eq!(field_of(ItemUpdate::from_json(&json!({"id": ""})).unwrap_err()), "id");
        let long = "x".repeat(MAX_ID_LENGTH + 1);
        assert_eq!(field_of(ItemUpdate::from_json(&json!({"id": long})).unwrap_err()), "id");
    }

    #[test]
    fn rejects_bad_numeric_fields() {
        let err = ItemUpdate::from_json(&json!({"id": "a", "sortindex": "x"})).unwrap_err();
        assert_eq!(field_of(err), "sortindex");
        let err = ItemUpdate::from_json(&json!({"id": "a", "sortindex": 1_000_000_000})).unwrap_err();
        assert_eq!(field_of(err), "sortindex");
        let err = ItemUpdate::from_json(&json!({"id": "a", "ttl": -1})).unwrap_err();
        assert_eq!(field_of(err), "ttl");
        let err = ItemUpdate::from_json(&json!({"id": "a", "ttl": "soon"})).unwrap_err();
        assert_eq!(field_of(err), "ttl");
    }

    #[test]
    fn payload_must_be_a_bounded_string() {
        let err = ItemUpdate::from_json(&json!({"id": "a", "payload": 12})).unwrap_err();
        assert_eq!(field_of(err), "payload");
        let big = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let err = ItemUpdate::from_json(&json!({"id": "a", "payload": big})).unwrap_err();
        assert_eq!(field_of(err), "payload");
    }

    #[test]
    fn non_objects_are_invalid() {
        let err = ItemUpdate::from_json(&json!(["a"])).unwrap_err();
        assert_eq!(err.batch_message(), "invalid wbo");
    }

    #[test]
    fn projection_keeps_id() {
        let wbo = Wbo {
            id: "a".into(),
            payload: Some("p".into()),
            sortindex: Some(3),
            ..Wbo::default()
        };
        let projected = wbo.project(&[WboField::SortIndex]);
        assert_eq!(projected.id, "a");
        assert_eq!(projected.sortindex, Some(3));
        assert!(projected.payload.is_none());
    }

    #[test]
    fn serializes_without_absent_fields() {
        let wbo = Wbo {
            id: "a".into(),
            modified: Some(Timestamp::from_centis(150)),
            ..Wbo::default()
        };
        let value = serde_json::to_value(&wbo).unwrap();
        assert_eq!(value, json!({"id": "a", "modified": "1.50"}));
    }
}
