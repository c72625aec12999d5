//! Cache error types.

use thiserror::Error;

/// Cache backend errors.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend could not be reached or did not answer in time.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something unexpected.
    #[error("cache protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
