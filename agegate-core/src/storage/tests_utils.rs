//! Test helpers for the record layer.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::error::{StorageError, StorageResult};
use super::traits::RecordStore;
use super::types::{AccountVerification, AgeToken};

/// How a [`FaultyRecordStore`] misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every query and write fails.
    Unreachable,
    /// Every token looked up already exists (unverified); writes fail.
    EveryTokenTaken,
}

pub struct FaultyRecordStore {
    fault: Fault,
    token_lookups: AtomicUsize,
    writes: AtomicUsize,
}

impl FaultyRecordStore {
    pub const fn new(fault: Fault) -> Self {
        Self {
            fault,
            token_lookups: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn token_lookups(&self) -> usize {
        self.token_lookups.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write_failed(&self) -> StorageError {
        self.writes.fetch_add(1, Ordering::SeqCst);
        StorageError::Database("disk I/O error".to_string())
    }
}

#[async_trait]
impl RecordStore for FaultyRecordStore {
    async fn account(&self, _account_id: u64) -> StorageResult<Option<AccountVerification>> {
        Err(StorageError::Database("connection refused".to_string()))
    }

    async fn update_account(
        &self,
        _account_id: u64,
        _method: &str,
        _reference: Option<&str>,
    ) -> StorageResult<()> {
        Err(self.write_failed())
    }

    async fn token(&self, token: &str) -> StorageResult<Option<AgeToken>> {
        self.token_lookups.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::Unreachable => Err(StorageError::Database("connection refused".to_string())),
            Fault::EveryTokenTaken => Ok(Some(AgeToken {
                token: token.to_string(),
                issued: 0,
                verified: false,
            })),
        }
    }

    async fn insert_token(&self, _token: &AgeToken) -> StorageResult<()> {
        Err(self.write_failed())
    }

    async fn mark_token_verified(&self, _token: &str) -> StorageResult<()> {
        Err(self.write_failed())
    }
}
