//! In-memory implementations of the storage traits.
//!
//! Suitable for tests and single-process deployments. State is lost on
//! restart, which is acceptable for the cache but not for real account data.

#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};

use super::error::{StorageError, StorageResult};
use super::traits::{Cache, RecordStore};
use super::types::{AccountVerification, AgeToken, CacheEntry};

// =============================================================================
// Memory Cache
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct MemoryCacheSlot {
    entry: CacheEntry,
    expires_at: u64,
}

/// Process-local TTL cache backed by a `HashMap`.
pub struct MemoryCache {
    slots: Mutex<HashMap<String, MemoryCacheSlot>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    /// Creates an empty cache reading the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty cache reading `clock` for expiry.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutex is poisoned.
    pub fn len(&self) -> StorageResult<usize> {
        let now = self.clock.now();
        let guard = self.lock()?;
        Ok(guard.values().filter(|slot| slot.expires_at > now).count())
    }

    /// Returns `true` if no live entries remain.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutex is poisoned.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, MemoryCacheSlot>>> {
        self.slots
            .lock()
            .map_err(|_| StorageError::Cache("mutex poisoned".to_string()))
    }

    fn slot(&self, entry: CacheEntry, ttl: Duration) -> MemoryCacheSlot {
        MemoryCacheSlot {
            entry,
            expires_at: self.clock.now().saturating_add(ttl.as_secs()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let now = self.clock.now();
        let mut guard = self.lock()?;
        match guard.get(key) {
            Some(slot) if slot.expires_at > now => Ok(Some(slot.entry)),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> StorageResult<()> {
        let now = self.clock.now();
        let slot = self.slot(entry, ttl);
        let mut guard = self.lock()?;
        guard.retain(|_, existing| existing.expires_at > now);
        guard.insert(key.to_string(), slot);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let now = self.clock.now();
        let slot = self.slot(entry, ttl);
        let mut guard = self.lock()?;
        guard.retain(|_, existing| existing.expires_at > now);
        if guard.contains_key(key) {
            return Ok(false);
        }
        guard.insert(key.to_string(), slot);
        Ok(true)
    }
}

// =============================================================================
// Memory Record Store
// =============================================================================

/// In-memory account and token tables.
#[derive(Default)]
pub struct MemoryRecordStore {
    accounts: Mutex<HashMap<u64, AccountVerification>>,
    tokens: Mutex<HashMap<String, AgeToken>>,
}

impl MemoryRecordStore {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account row, as the site's account system would.
    ///
    /// # Errors
    ///
    /// Returns an error if the mutex is poisoned.
    pub fn insert_account(&self, account: AccountVerification) -> StorageResult<()> {
        self.accounts
            .lock()
            .map_err(|_| StorageError::Database("mutex poisoned".to_string()))?
            .insert(account.account_id, account);
        Ok(())
    }

    fn accounts(
        &self,
    ) -> StorageResult<std::sync::MutexGuard<'_, HashMap<u64, AccountVerification>>> {
        self.accounts
            .lock()
            .map_err(|_| StorageError::Database("mutex poisoned".to_string()))
    }

    fn tokens(&self) -> StorageResult<std::sync::MutexGuard<'_, HashMap<String, AgeToken>>> {
        self.tokens
            .lock()
            .map_err(|_| StorageError::Database("mutex poisoned".to_string()))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn account(&self, account_id: u64) -> StorageResult<Option<AccountVerification>> {
        Ok(self.accounts()?.get(&account_id).cloned())
    }

    async fn update_account(
        &self,
        account_id: u64,
        method: &str,
        reference: Option<&str>,
    ) -> StorageResult<()> {
        if let Some(account) = self.accounts()?.get_mut(&account_id) {
            account.method = Some(method.to_string());
            account.reference = reference.map(ToString::to_string);
        }
        Ok(())
    }

    async fn token(&self, token: &str) -> StorageResult<Option<AgeToken>> {
        Ok(self.tokens()?.get(token).cloned())
    }

    async fn insert_token(&self, token: &AgeToken) -> StorageResult<()> {
        let mut tokens = self.tokens()?;
        if tokens.contains_key(&token.token) {
            return Err(StorageError::Database(
                "duplicate age token".to_string(),
            ));
        }
        tokens.insert(token.token.clone(), token.clone());
        Ok(())
    }

    async fn mark_token_verified(&self, token: &str) -> StorageResult<()> {
        if let Some(row) = self.tokens()?.get_mut(token) {
            row.verified = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StepClock(AtomicU64);

    impl Clock for StepClock {
        fn now(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_memory_cache_ttl() {
        let clock = Arc::new(StepClock(AtomicU64::new(100)));
        let cache = MemoryCache::with_clock(clock.clone());
        cache
            .set("k", CacheEntry::No, Duration::from_secs(10))
            .await
            .expect("set");
        clock.0.store(105, Ordering::SeqCst);
        assert_eq!(cache.get("k").await.expect("get"), Some(CacheEntry::No));
        clock.0.store(110, Ordering::SeqCst);
        assert_eq!(cache.get("k").await.expect("get"), None);
        assert!(cache.is_empty().expect("len"));
    }

    #[tokio::test]
    async fn test_memory_cache_set_if_absent() {
        let clock = Arc::new(StepClock(AtomicU64::new(0)));
        let cache = MemoryCache::with_clock(clock.clone());
        let ttl = Duration::from_secs(60);
        assert!(cache.set_if_absent("jti", CacheEntry::Yes, ttl).await.unwrap());
        assert!(!cache.set_if_absent("jti", CacheEntry::Yes, ttl).await.unwrap());

        clock.0.store(61, Ordering::SeqCst);
        assert!(cache.set_if_absent("jti", CacheEntry::Yes, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_drop_expired_slots() {
        let clock = Arc::new(StepClock(AtomicU64::new(0)));
        let cache = MemoryCache::with_clock(clock.clone());
        let ttl = Duration::from_secs(300);
        for i in 0..1000 {
            cache
                .set(&format!("AV_IP_10.0.{}.{}", i / 256, i % 256), CacheEntry::No, ttl)
                .await
                .unwrap();
        }
        assert_eq!(cache.slots.lock().unwrap().len(), 1000);

        clock.0.store(1_000_000, Ordering::SeqCst);
        cache.set("AV_IP_203.0.113.7", CacheEntry::Yes, ttl).await.unwrap();
        assert_eq!(cache.slots.lock().unwrap().len(), 1);

        clock.0.store(2_000_000, Ordering::SeqCst);
        assert!(cache.set_if_absent("AV_JTI_a", CacheEntry::Yes, ttl).await.unwrap());
        assert_eq!(cache.slots.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_unknown_account_is_noop() {
        let store = MemoryRecordStore::new();
        store
            .update_account(9, "GOCAM", None)
            .await
            .expect("update");
        assert!(store.account(9).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let store = MemoryRecordStore::new();
        let token = AgeToken {
            token: "a".repeat(32),
            issued: 1,
            verified: false,
        };
        store.insert_token(&token).await.expect("first insert");
        assert!(store.insert_token(&token).await.is_err());
    }
}
