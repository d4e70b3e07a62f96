//! Shared helpers for SQLite operations.

use crate::storage::error::{StorageError, StorageResult};

pub(super) fn map_cache_err(err: &rusqlite::Error) -> StorageError {
    StorageError::Cache(err.to_string())
}

pub(super) fn map_db_err(err: &rusqlite::Error) -> StorageError {
    StorageError::Database(err.to_string())
}

pub(super) const fn expiry_timestamp(now: u64, ttl_seconds: u64) -> u64 {
    now.saturating_add(ttl_seconds)
}

pub(super) fn to_i64(value: u64, label: &str) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| {
        StorageError::Serialization(format!("{label} out of range for i64: {value}"))
    })
}

pub(super) fn from_i64(value: i64, label: &str) -> StorageResult<u64> {
    u64::try_from(value).map_err(|_| {
        StorageError::Serialization(format!("{label} out of range for u64: {value}"))
    })
}
