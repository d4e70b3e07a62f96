//! Cache entry helpers.
//!
//! Every write prunes expired rows first so the table stays bounded by the
//! number of live keys.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::CacheEntry;

use super::util::{expiry_timestamp, map_cache_err, to_i64};

pub(super) fn get(conn: &Connection, key: &str, now: u64) -> StorageResult<Option<CacheEntry>> {
    let now_i64 = to_i64(now, "now")?;
    let raw: Option<i64> = conn
        .query_row(
            "SELECT entry
             FROM cache_entries
             WHERE cache_key = ?1
               AND expires_at > ?2",
            params![key, now_i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| map_cache_err(&err))?;
    raw.map(decode_entry).transpose()
}

pub(super) fn put(
    conn: &Connection,
    key: &str,
    entry: CacheEntry,
    now: u64,
    ttl_seconds: u64,
) -> StorageResult<()> {
    prune_expired(conn, now)?;
    let inserted_at_i64 = to_i64(now, "now")?;
    let expires_at_i64 = to_i64(expiry_timestamp(now, ttl_seconds), "expires_at")?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries (
            cache_key,
            entry,
            inserted_at,
            expires_at
         ) VALUES (?1, ?2, ?3, ?4)",
        params![key, i64::from(entry.as_byte()), inserted_at_i64, expires_at_i64],
    )
    .map_err(|err| map_cache_err(&err))?;
    Ok(())
}

/// Inserts `key` unless a live entry exists, inside one IMMEDIATE transaction
/// so concurrent writers on the same database serialize on the check.
pub(super) fn put_if_absent(
    conn: &mut Connection,
    key: &str,
    entry: CacheEntry,
    now: u64,
    ttl_seconds: u64,
) -> StorageResult<bool> {
    let now_i64 = to_i64(now, "now")?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| map_cache_err(&err))?;
    tx.execute(
        "DELETE FROM cache_entries WHERE expires_at <= ?1",
        params![now_i64],
    )
    .map_err(|err| map_cache_err(&err))?;

    let existing: Option<i64> = tx
        .query_row(
            "SELECT entry
             FROM cache_entries
             WHERE cache_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| map_cache_err(&err))?;
    if existing.is_some() {
        tx.commit().map_err(|err| map_cache_err(&err))?;
        return Ok(false);
    }

    let expires_at_i64 = to_i64(expiry_timestamp(now, ttl_seconds), "expires_at")?;
    tx.execute(
        "INSERT INTO cache_entries (cache_key, entry, inserted_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![key, i64::from(entry.as_byte()), now_i64, expires_at_i64],
    )
    .map_err(|err| map_cache_err(&err))?;
    tx.commit().map_err(|err| map_cache_err(&err))?;
    Ok(true)
}

fn prune_expired(conn: &Connection, now: u64) -> StorageResult<()> {
    let now_i64 = to_i64(now, "now")?;
    conn.execute(
        "DELETE FROM cache_entries WHERE expires_at <= ?1",
        params![now_i64],
    )
    .map_err(|err| map_cache_err(&err))?;
    Ok(())
}

fn decode_entry(raw: i64) -> StorageResult<CacheEntry> {
    let tag = u8::try_from(raw).map_err(|_| {
        StorageError::Serialization(format!("cache entry tag out of range: {raw}"))
    })?;
    CacheEntry::try_from(tag)
}
