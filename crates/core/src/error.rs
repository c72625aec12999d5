//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A WBO field failed validation. `reason` is the short client-facing message.
    #[error("invalid wbo field '{field}': {reason}")]
    InvalidWbo { field: &'static str, reason: String },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("invalid value for \"{name}\": {value}")]
    InvalidParameter { name: String, value: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn wbo(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidWbo {
            field,
            reason: reason.into(),
        }
    }

    /// Short message reported per item in batch responses.
    pub fn batch_message(&self) -> String {
        match self {
            Self::InvalidWbo { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
