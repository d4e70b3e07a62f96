//! Error types for cache and record store backends.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by cache and record store backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Errors coming from the cache.
    #[error("cache error: {0}")]
    Cache(String),

    /// Errors coming from the persistent record store.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}
