//! Interfaces to the external cache and the persistent record store.

use std::time::Duration;

use async_trait::async_trait;

use super::error::StorageResult;
use super::types::{AccountVerification, AgeToken, CacheEntry};

/// TTL key/value cache sitting in front of region and record lookups.
///
/// Entries are non-authoritative copies; the record store wins on disagreement.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Reads `key`. `None` means not cached (or expired).
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>>;

    /// Writes `key`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> StorageResult<()>;

    /// Writes `key` only if no live entry exists. Returns `true` when written.
    ///
    /// Must be atomic with respect to concurrent callers on the same key.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be reached.
    async fn set_if_absent(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Duration,
    ) -> StorageResult<bool>;
}

/// Persistent account and age token tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetches the account row, if the account exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn account(&self, account_id: u64) -> StorageResult<Option<AccountVerification>>;

    /// Records the verification method (and reference) on the account row.
    ///
    /// Updating an account that does not exist is not an error; the row is
    /// owned by the site's account system.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    async fn update_account(
        &self,
        account_id: u64,
        method: &str,
        reference: Option<&str>,
    ) -> StorageResult<()>;

    /// Looks up a token by exact match.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    async fn token(&self, token: &str) -> StorageResult<Option<AgeToken>>;

    /// Inserts a new token. Token values are unique.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, including on a duplicate value.
    async fn insert_token(&self, token: &AgeToken) -> StorageResult<()>;

    /// Flips an existing token to verified.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    async fn mark_token_verified(&self, token: &str) -> StorageResult<()>;
}
