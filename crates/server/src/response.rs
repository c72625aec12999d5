//! Response bodies and output formats.
//!
//! Listings can be rendered three ways, picked from the `Accept` header:
//!
//! | Content type | Body |
//! |--------------|------|
//! | `application/json` | one JSON document (default) |
//! | `application/newlines` | one JSON document per record, each followed by `\n` |
//! | `application/whoisi` | each record prefixed by its length as a big-endian `u32` |

use crate::error::{ControllerError, ControllerResult};
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;
use weave_core::Timestamp;

/// Number of records in a listing.
pub const X_WEAVE_RECORDS: HeaderName = HeaderName::from_static("x-weave-records");
/// Remaining quota in KB, sent when it runs low.
pub const X_WEAVE_QUOTA_REMAINING: HeaderName = HeaderName::from_static("x-weave-quota-remaining");
/// Server time of the request.
pub const X_WEAVE_TIMESTAMP: HeaderName = HeaderName::from_static("x-weave-timestamp");

/// Output format of a listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Json,
    Newlines,
    Whoisi,
}

impl Format {
    const OFFERS: [(Format, &'static str); 3] = [
        (Format::Json, "application/json"),
        (Format::Newlines, "application/newlines"),
        (Format::Whoisi, "application/whoisi"),
    ];

    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Newlines => "application/newlines",
            Format::Whoisi => "application/whoisi",
        }
    }

    /// Best match for an `Accept` header. Ties go to the earlier offer;
    /// anything unparseable or unmatched falls back to JSON.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let Some(accept) = headers.get(ACCEPT).and_then(|v| v.to_str().ok()) else {
            return Format::Json;
        };

        let mut best: Option<(Format, f32)> = None;
        for (format, offer) in Self::OFFERS {
            let quality = accept
                .split(',')
                .filter_map(|range| media_range_quality(range, offer))
                .fold(None, |acc: Option<f32>, q| Some(acc.map_or(q, |a| a.max(q))));
            if let Some(q) = quality
                && q > 0.0
                && best.is_none_or(|(_, b)| q > b)
            {
                best = Some((format, q));
            }
        }
        best.map_or(Format::Json, |(format, _)| format)
    }
}

/// Quality of one `Accept` media range for `offer`, if it matches.
fn media_range_quality(range: &str, offer: &str) -> Option<f32> {
    let mut parts = range.split(';');
    let media = parts.next()?.trim().to_ascii_lowercase();
    let mut quality = 1.0;
    for param in parts {
        if let Some((name, value)) = param.split_once('=')
            && name.trim() == "q"
        {
            quality = value.trim().parse::<f32>().ok()?;
        }
    }
    let (offer_type, _) = offer.split_once('/')?;
    let matches = media == offer
        || media == "*/*"
        || media
            .strip_suffix("/*")
            .is_some_and(|t| t == offer_type);
    matches.then_some(quality)
}

/// A rendered controller response.
#[derive(Clone, Debug)]
pub struct SyncResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SyncResponse {
    pub(crate) fn json_text(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    /// A 200 with `data` as a JSON document.
    pub fn json<T: Serialize + ?Sized>(data: &T) -> ControllerResult<Self> {
        let body = serde_json::to_string(data).map_err(encode_error)?;
        Ok(Self::json_text(StatusCode::OK, body))
    }

    /// A 200 with `data` rendered in `format`. Arrays become one record per
    /// element in the line formats; anything else is a single record.
    pub fn formatted<T: Serialize + ?Sized>(format: Format, data: &T) -> ControllerResult<Self> {
        if format == Format::Json {
            return Self::json(data);
        }
        let value = serde_json::to_value(data).map_err(encode_error)?;
        let records = match value {
            Value::Array(items) => items,
            other => vec![other],
        };

        let mut body = BytesMut::new();
        for record in &records {
            let line = serde_json::to_string(record).map_err(encode_error)?;
            match format {
                Format::Newlines => {
                    body.put_slice(line.as_bytes());
                    body.put_u8(b'\n');
                }
                Format::Whoisi => {
                    body.put_u32(line.len() as u32);
                    body.put_slice(line.as_bytes());
                }
                Format::Json => {}
            }
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
        Ok(Self {
            status: StatusCode::OK,
            headers,
            body: body.freeze(),
        })
    }

    pub fn with_header(mut self, name: HeaderName, value: impl ToString) -> Self {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_records(self, count: usize) -> Self {
        self.with_header(X_WEAVE_RECORDS, count)
    }

    pub fn with_timestamp(self, server_time: Timestamp) -> Self {
        self.with_header(X_WEAVE_TIMESTAMP, server_time)
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parse the body as JSON.
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

fn encode_error(err: serde_json::Error) -> ControllerError {
    ControllerError::BadRequest(format!("response encoding failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn negotiates_formats() {
        assert_eq!(Format::negotiate(&HeaderMap::new()), Format::Json);
        assert_eq!(Format::negotiate(&accept("application/newlines")), Format::Newlines);
        assert_eq!(Format::negotiate(&accept("application/whoisi")), Format::Whoisi);
        assert_eq!(Format::negotiate(&accept("*/*")), Format::Json);
        assert_eq!(Format::negotiate(&accept("text/html")), Format::Json);
        assert_eq!(
            Format::negotiate(&accept("application/json;q=0.5, application/newlines")),
            Format::Newlines
        );
        assert_eq!(Format::negotiate(&accept("application/*;q=bogus")), Format::Json);
    }

    #[test]
    fn newlines_puts_one_record_per_line() {
        let response = SyncResponse::formatted(Format::Newlines, &json!(["a", {"b": "x\ny"}])).unwrap();
        assert_eq!(&response.body[..], b"\"a\"\n{\"b\":\"x\\ny\"}\n");
        assert_eq!(response.header(&CONTENT_TYPE), Some("application/newlines"));
    }

    #[test]
    fn whoisi_prefixes_lengths() {
        let response = SyncResponse::formatted(Format::Whoisi, &json!(["ab", 1])).unwrap();
        assert_eq!(&response.body[..], b"\x00\x00\x00\x04\"ab\"\x00\x00\x00\x011");
    }

    #[test]
    fn json_is_a_single_document() {
        let response = SyncResponse::formatted(Format::Json, &json!(["a", "b"]))
            .unwrap()
            .with_records(2);
        assert_eq!(&response.body[..], b"[\"a\",\"b\"]");
        assert_eq!(response.header(&X_WEAVE_RECORDS), Some("2"));
    }
}
