//! SQLite-backed cache and record store.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::clock::{Clock, SystemClock};

use super::error::{StorageError, StorageResult};
use super::traits::{Cache, RecordStore};
use super::types::{AccountVerification, AgeToken, CacheEntry};

mod cache;
mod records;
mod schema;
mod util;

/// TTL cache stored in a SQLite database.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteCache {
    /// Opens or creates the cache database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|err| util::map_cache_err(&err))?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    /// Creates a private in-memory cache database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory(clock: Arc<dyn Clock>) -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|err| util::map_cache_err(&err))?;
        Self::from_connection(conn, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        schema::ensure_cache_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Cache("connection mutex poisoned".to_string()))?;
        f(&mut guard)
    }
}

#[async_trait]
impl Cache for SqliteCache {
    async fn get(&self, key: &str) -> StorageResult<Option<CacheEntry>> {
        let now = self.clock.now();
        self.with_conn(|conn| cache::get(conn, key, now))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> StorageResult<()> {
        let now = self.clock.now();
        self.with_conn(|conn| cache::put(conn, key, entry, now, ttl.as_secs()))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        entry: CacheEntry,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let now = self.clock.now();
        self.with_conn(|conn| cache::put_if_absent(conn, key, entry, now, ttl.as_secs()))
    }
}

/// Account and age token tables stored in a SQLite database.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Opens or creates the record database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path).map_err(|err| util::map_db_err(&err))?;
        Self::from_connection(conn)
    }

    /// Creates a private in-memory record database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|err| util::map_db_err(&err))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        schema::ensure_record_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Registers an unverified account row if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn register_account(&self, account_id: u64) -> StorageResult<()> {
        self.with_conn(|conn| records::insert_account(conn, account_id))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Database("connection mutex poisoned".to_string()))?;
        f(&guard)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn account(&self, account_id: u64) -> StorageResult<Option<AccountVerification>> {
        self.with_conn(|conn| records::account(conn, account_id))
    }

    async fn update_account(
        &self,
        account_id: u64,
        method: &str,
        reference: Option<&str>,
    ) -> StorageResult<()> {
        let updated =
            self.with_conn(|conn| records::update_account(conn, account_id, method, reference))?;
        if updated == 0 {
            log::warn!("account {account_id} not found while recording {method} verification");
        }
        Ok(())
    }

    async fn token(&self, token: &str) -> StorageResult<Option<AgeToken>> {
        self.with_conn(|conn| records::token(conn, token))
    }

    async fn insert_token(&self, token: &AgeToken) -> StorageResult<()> {
        self.with_conn(|conn| records::insert_token(conn, token))
    }

    async fn mark_token_verified(&self, token: &str) -> StorageResult<()> {
        self.with_conn(|conn| records::mark_token_verified(conn, token))
    }
}
