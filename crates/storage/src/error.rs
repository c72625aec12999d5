//! Storage engine error types.
//!
//! Driver and cache client errors never leave this crate: they are logged
//! where they happen and converted into one of the variants below.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed input rejected before touching the database.
    #[error("validation error: {0}")]
    Validation(#[from] weave_core::Error),

    /// A write lost a uniqueness race.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Too many callers are already waiting for a database connection.
    #[error("connection pool backlog exceeded")]
    PoolBacklogExceeded,

    /// Opaque database failure. Details are in the server log.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The cache is down and the operation has no SQL fallback.
    #[error("cache backend unavailable: {0}")]
    CacheUnavailable(String),

    /// Stored data references a collection id with no name.
    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Errors that callers report as a generic 503-style failure.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::PoolBacklogExceeded
                | Self::Backend(_)
                | Self::CacheUnavailable(_)
                | Self::Integrity(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_backend_errors() {
        assert!(StorageError::PoolBacklogExceeded.is_backend());
        assert!(StorageError::Integrity("x".into()).is_backend());
        assert!(StorageError::CacheUnavailable("x".into()).is_backend());
        assert!(!StorageError::Conflict("x".into()).is_backend());
        assert!(!StorageError::Config("x".into()).is_backend());
    }

    #[test]
    fn validation_wraps_core_errors() {
        let err: StorageError = weave_core::Error::InvalidCollection("a/b".into()).into();
        assert!(err.to_string().contains("a/b"));
    }
}
