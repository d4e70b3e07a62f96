//! Cache and record store interfaces plus their backends.

pub mod error;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(test)]
pub(crate) mod tests_utils;
pub mod traits;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryCache, MemoryRecordStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCache, SqliteRecordStore};
pub use traits::{Cache, RecordStore};
pub use types::{AccountVerification, AgeToken, CacheEntry, VerificationMethod};
