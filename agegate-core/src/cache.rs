//! Prefixed cache access shared by the region, record and token layers.
//!
//! Reads and writes are best effort: a cache outage degrades to store or geo
//! lookups and is logged, never surfaced to the visitor.

use std::sync::Arc;
use std::time::Duration;

use crate::error::AgeGateResult;
use crate::storage::{Cache, CacheEntry};

/// Cache handle that namespaces keys and honours the read switch.
#[derive(Clone)]
pub struct KeyedCache {
    inner: Arc<dyn Cache>,
    prefix: String,
    read_enabled: bool,
}

impl KeyedCache {
    /// Wraps `inner`, prefixing every key with `prefix`.
    ///
    /// With `read_enabled == false` lookups always miss but writes still
    /// happen, which keeps the cache warm while debugging.
    #[must_use]
    pub fn new(inner: Arc<dyn Cache>, prefix: impl Into<String>, read_enabled: bool) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            read_enabled,
        }
    }

    pub(crate) fn ip_key(&self, ip: &str) -> String {
        format!("{}IP_{ip}", self.prefix)
    }

    pub(crate) fn account_key(&self, account_id: u64) -> String {
        format!("{}ACCT_{account_id}", self.prefix)
    }

    pub(crate) fn token_key(&self, token: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
        format!("{}TOKEN_{encoded}", self.prefix)
    }

    pub(crate) fn assertion_key(&self, assertion_id: &str) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(assertion_id.as_bytes()).collect();
        format!("{}_REDACT_ID_TOKEN_USED_{encoded}", self.prefix)
    }

    /// Reads `key`, treating errors and disabled reads as a miss.
    pub(crate) async fn read(&self, key: &str) -> Option<CacheEntry> {
        if !self.read_enabled {
            return None;
        }
        match self.inner.get(key).await {
            Ok(entry) => {
                log::debug!("cache {} for {key}", if entry.is_some() { "hit" } else { "miss" });
                entry
            }
            Err(err) => {
                log::warn!("cache read failed for {key}: {err}");
                None
            }
        }
    }

    /// Writes `key`, logging failures.
    pub(crate) async fn write(&self, key: &str, entry: CacheEntry, ttl: Duration) {
        if let Err(err) = self.inner.set(key, entry, ttl).await {
            log::warn!("cache write failed for {key}: {err}");
        }
    }

    /// Atomically marks `key` as taken. Returns `false` if it already was.
    ///
    /// Unlike [`Self::read`] this ignores the read switch and propagates
    /// errors, since single-use checks cannot degrade to "allow".
    pub(crate) async fn claim(&self, key: &str, ttl: Duration) -> AgeGateResult<bool> {
        Ok(self.inner.set_if_absent(key, CacheEntry::Yes, ttl).await?)
    }
}
