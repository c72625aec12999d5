//! Controller error types.

use crate::response::SyncResponse;
use http::StatusCode;
use weave_storage::StorageError;

/// Weave response code: the request body is not valid JSON.
pub const WEAVE_MALFORMED_JSON: u8 = 6;
/// Weave response code: the write lost a race or was refused.
pub const WEAVE_INVALID_WRITE: u8 = 4;
/// Weave response code: an item failed validation.
pub const WEAVE_INVALID_WBO: u8 = 8;
/// Weave response code: the user is over quota.
pub const WEAVE_OVER_QUOTA: u8 = 14;

/// Controller error type.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("malformed json")]
    MalformedJson,

    #[error("invalid wbo: {0}")]
    InvalidWbo(String),

    #[error("invalid write")]
    InvalidWrite,

    #[error("over quota")]
    QuotaExceeded,

    /// The collection changed after the client's `X-If-Unmodified-Since`.
    #[error("precondition failed: collection '{0}' was modified")]
    PreconditionFailed(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(_) => Self::InvalidWrite,
            StorageError::Validation(weave_core::Error::InvalidWbo { reason, .. }) => {
                Self::InvalidWbo(reason)
            }
            StorageError::Validation(other) => Self::BadRequest(other.to_string()),
            other => Self::Storage(other),
        }
    }
}

impl From<weave_core::Error> for ControllerError {
    fn from(err: weave_core::Error) -> Self {
        match err {
            weave_core::Error::InvalidWbo { reason, .. } => Self::InvalidWbo(reason),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

impl ControllerError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::MalformedJson => "malformed_json",
            Self::InvalidWbo(_) => "invalid_wbo",
            Self::InvalidWrite => "invalid_write",
            Self::QuotaExceeded => "over_quota",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Storage(StorageError::Config(_)) => "config_error",
            Self::Storage(_) => "backend_error",
        }
    }

    /// Weave response code carried in the body of a 400, if any.
    pub fn weave_code(&self) -> Option<u8> {
        match self {
            Self::MalformedJson => Some(WEAVE_MALFORMED_JSON),
            Self::InvalidWbo(_) => Some(WEAVE_INVALID_WBO),
            Self::InvalidWrite => Some(WEAVE_INVALID_WRITE),
            Self::QuotaExceeded => Some(WEAVE_OVER_QUOTA),
            _ => None,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_)
            | Self::MalformedJson
            | Self::InvalidWbo(_)
            | Self::InvalidWrite
            | Self::QuotaExceeded => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            Self::Storage(e) if e.is_backend() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error. Storage failures get an opaque body; the details
    /// only go to the log.
    pub fn into_response(self) -> SyncResponse {
        let status = self.status_code();
        let body = match (&self, self.weave_code()) {
            (_, Some(code)) => code.to_string(),
            (Self::Storage(e), None) => {
                tracing::error!(error = %e, code = self.code(), "Storage failure");
                "\"server issue: database is not healthy\"".to_string()
            }
            (other, None) => serde_json::Value::String(other.to_string()).to_string(),
        };
        SyncResponse::json_text(status, body)
    }
}

/// Result type for controller operations.
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;
