//! SQLite schema management for the cache and record databases.

use rusqlite::{Connection, OptionalExtension};

use crate::storage::error::StorageResult;

use super::util::{map_cache_err, map_db_err};

const CACHE_SCHEMA_VERSION: i64 = 1;

/// Creates the cache tables, dropping them first if the schema version changed.
///
/// Cache contents are disposable, so a version mismatch simply resets them.
pub(super) fn ensure_cache_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_meta (
            schema_version  INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL
        );",
    )
    .map_err(|err| map_cache_err(&err))?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT schema_version FROM cache_meta LIMIT 1;",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| map_cache_err(&err))?;

    match existing {
        Some(version) if version == CACHE_SCHEMA_VERSION => ensure_entries_schema(conn),
        Some(_) => reset_cache_schema(conn),
        None => {
            ensure_entries_schema(conn)?;
            insert_meta(conn)
        }
    }
}

fn ensure_entries_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            cache_key       TEXT    NOT NULL,
            entry           INTEGER NOT NULL,
            inserted_at     INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL,
            PRIMARY KEY (cache_key)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
        ON cache_entries (expires_at);",
    )
    .map_err(|err| map_cache_err(&err))
}

fn reset_cache_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch("DROP TABLE IF EXISTS cache_entries;")
        .map_err(|err| map_cache_err(&err))?;
    ensure_entries_schema(conn)?;
    conn.execute("DELETE FROM cache_meta;", [])
        .map_err(|err| map_cache_err(&err))?;
    insert_meta(conn)
}

fn insert_meta(conn: &Connection) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO cache_meta (schema_version, created_at, updated_at)
         VALUES (?1, strftime('%s','now'), strftime('%s','now'))",
        [CACHE_SCHEMA_VERSION],
    )
    .map_err(|err| map_cache_err(&err))?;
    Ok(())
}

/// Creates the account and token tables if missing. Never drops data.
pub(super) fn ensure_record_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id              INTEGER PRIMARY KEY,
            age_verified            TEXT,
            verification_reference  TEXT
        );

        CREATE TABLE IF NOT EXISTS age_tokens (
            token_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            token       TEXT    NOT NULL UNIQUE,
            issued      INTEGER NOT NULL,
            verified    INTEGER NOT NULL DEFAULT 0
        );",
    )
    .map_err(|err| map_db_err(&err))
}
