//! Account verification state, cached in front of the record store.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::KeyedCache;
use crate::storage::{CacheEntry, RecordStore, VerificationMethod};

/// How long an account's verification state is cached.
pub const ACCOUNT_CACHE_TTL: Duration = Duration::from_secs(3 * 60 * 60);

/// Verification state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    /// The account has a recorded verification method.
    Verified,
    /// The account exists but has not verified.
    NotVerified,
    /// No such account.
    Unknown,
}

impl AccountStatus {
    /// Only `Verified` counts as verified.
    #[must_use]
    pub const fn is_verified(self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Reads and writes account verification state.
pub struct VerificationRecords {
    store: Arc<dyn RecordStore>,
    cache: KeyedCache,
}

impl VerificationRecords {
    /// Creates the record layer.
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, cache: KeyedCache) -> Self {
        Self { store, cache }
    }

    /// Returns the verification status of `account_id`.
    ///
    /// Store failures are logged and reported as `NotVerified`, which keeps
    /// the visitor gated rather than letting an outage unlock content.
    pub async fn account_status(&self, account_id: u64) -> AccountStatus {
        let key = self.cache.account_key(account_id);
        match self.cache.read(&key).await {
            Some(CacheEntry::Yes) => return AccountStatus::Verified,
            Some(CacheEntry::No) => return AccountStatus::NotVerified,
            Some(CacheEntry::Missing) | None => {}
        }

        let row = match self.store.account(account_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return AccountStatus::Unknown,
            Err(err) => {
                log::error!("account lookup for {account_id} failed: {err}");
                return AccountStatus::NotVerified;
            }
        };

        let verified = row.is_verified();
        self.cache
            .write(&key, CacheEntry::from_bool(verified), ACCOUNT_CACHE_TTL)
            .await;
        if verified {
            AccountStatus::Verified
        } else {
            AccountStatus::NotVerified
        }
    }

    /// Records `method` on the account. Returns `false` if persistence failed.
    ///
    /// The reference is only kept for RedactID. The cache is marked verified
    /// even when the account row does not exist.
    pub async fn set_account_verified(
        &self,
        account_id: u64,
        method: VerificationMethod,
        reference: Option<&str>,
    ) -> bool {
        let reference = reference
            .filter(|reference| method.retains_reference() && !reference.is_empty());

        if let Err(err) = self
            .store
            .update_account(account_id, method.as_ref(), reference)
            .await
        {
            log::error!("recording {method} verification for account {account_id} failed: {err}");
            return false;
        }

        log::info!("account {account_id} verified via {method}");
        self.cache
            .write(
                &self.cache.account_key(account_id),
                CacheEntry::Yes,
                ACCOUNT_CACHE_TTL,
            )
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests_utils::{Fault, FaultyRecordStore};
    use crate::storage::{AccountVerification, Cache, MemoryCache, MemoryRecordStore};

    fn setup() -> (Arc<MemoryRecordStore>, Arc<MemoryCache>, VerificationRecords) {
        let store = Arc::new(MemoryRecordStore::new());
        let cache = Arc::new(MemoryCache::new());
        let records = VerificationRecords::new(
            store.clone(),
            KeyedCache::new(cache.clone(), "AV_", true),
        );
        (store, cache, records)
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_cached() {
        let (_, cache, records) = setup();
        assert_eq!(records.account_status(5).await, AccountStatus::Unknown);
        assert_eq!(cache.get("AV_ACCT_5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unverified_account_is_cached() {
        let (store, cache, records) = setup();
        store
            .insert_account(AccountVerification::unverified(5))
            .unwrap();
        assert_eq!(records.account_status(5).await, AccountStatus::NotVerified);
        assert_eq!(
            cache.get("AV_ACCT_5").await.unwrap(),
            Some(CacheEntry::No)
        );
    }

    #[tokio::test]
    async fn test_reference_only_kept_for_redact_id() {
        let (store, _, records) = setup();
        store
            .insert_account(AccountVerification::unverified(1))
            .unwrap();
        store
            .insert_account(AccountVerification::unverified(2))
            .unwrap();

        assert!(
            records
                .set_account_verified(1, VerificationMethod::RedactId, Some("abc123"))
                .await
        );
        assert!(
            records
                .set_account_verified(2, VerificationMethod::GoCam, Some("ignored"))
                .await
        );

        let one = store.account(1).await.unwrap().unwrap();
        assert_eq!(one.method.as_deref(), Some("REDACT-ID"));
        assert_eq!(one.reference.as_deref(), Some("abc123"));

        let two = store.account(2).await.unwrap().unwrap();
        assert_eq!(two.method.as_deref(), Some("GOCAM"));
        assert_eq!(two.reference, None);

        assert_eq!(records.account_status(2).await, AccountStatus::Verified);
    }

    #[tokio::test]
    async fn test_cached_verdict_wins_over_store() {
        let (store, _, records) = setup();
        store
            .insert_account(AccountVerification::unverified(3))
            .unwrap();
        assert_eq!(records.account_status(3).await, AccountStatus::NotVerified);

        // Written behind the cache's back; visible only after expiry.
        store.update_account(3, "GOCAM", None).await.unwrap();
        assert_eq!(records.account_status(3).await, AccountStatus::NotVerified);
    }

    #[tokio::test]
    async fn test_store_failures_are_reported_not_raised() {
        let store = Arc::new(FaultyRecordStore::new(Fault::Unreachable));
        let cache = Arc::new(MemoryCache::new());
        let records =
            VerificationRecords::new(store.clone(), KeyedCache::new(cache.clone(), "AV_", true));

        assert!(
            !records
                .set_account_verified(9, VerificationMethod::RedactId, Some("abc123"))
                .await
        );
        assert_eq!(store.writes(), 1);
        assert_eq!(cache.get("AV_ACCT_9").await.unwrap(), None);

        assert_eq!(records.account_status(9).await, AccountStatus::NotVerified);
        assert_eq!(cache.get("AV_ACCT_9").await.unwrap(), None);
    }
}
