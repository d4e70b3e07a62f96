//! Account and age token table helpers.

use rusqlite::{params, Connection, OptionalExtension};

use crate::storage::error::StorageResult;
use crate::storage::types::{AccountVerification, AgeToken};

use super::util::{from_i64, map_db_err, to_i64};

pub(super) fn account(
    conn: &Connection,
    account_id: u64,
) -> StorageResult<Option<AccountVerification>> {
    let id = to_i64(account_id, "account_id")?;
    conn.query_row(
        "SELECT age_verified, verification_reference
         FROM accounts
         WHERE account_id = ?1",
        params![id],
        |row| {
            Ok(AccountVerification {
                account_id,
                method: row.get(0)?,
                reference: row.get(1)?,
            })
        },
    )
    .optional()
    .map_err(|err| map_db_err(&err))
}

pub(super) fn insert_account(conn: &Connection, account_id: u64) -> StorageResult<()> {
    let id = to_i64(account_id, "account_id")?;
    conn.execute(
        "INSERT OR IGNORE INTO accounts (account_id) VALUES (?1)",
        params![id],
    )
    .map_err(|err| map_db_err(&err))?;
    Ok(())
}

pub(super) fn update_account(
    conn: &Connection,
    account_id: u64,
    method: &str,
    reference: Option<&str>,
) -> StorageResult<usize> {
    let id = to_i64(account_id, "account_id")?;
    conn.execute(
        "UPDATE accounts
         SET age_verified = ?1, verification_reference = ?2
         WHERE account_id = ?3",
        params![method, reference, id],
    )
    .map_err(|err| map_db_err(&err))
}

pub(super) fn token(conn: &Connection, token: &str) -> StorageResult<Option<AgeToken>> {
    let row: Option<(String, i64, bool)> = conn
        .query_row(
            "SELECT token, issued, verified
             FROM age_tokens
             WHERE token = ?1",
            params![token],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|err| map_db_err(&err))?;
    row.map(|(token, issued, verified)| {
        Ok(AgeToken {
            token,
            issued: from_i64(issued, "issued")?,
            verified,
        })
    })
    .transpose()
}

pub(super) fn insert_token(conn: &Connection, token: &AgeToken) -> StorageResult<()> {
    let issued = to_i64(token.issued, "issued")?;
    conn.execute(
        "INSERT INTO age_tokens (token, issued, verified) VALUES (?1, ?2, ?3)",
        params![token.token, issued, token.verified],
    )
    .map_err(|err| map_db_err(&err))?;
    Ok(())
}

pub(super) fn mark_token_verified(conn: &Connection, token: &str) -> StorageResult<()> {
    conn.execute(
        "UPDATE age_tokens SET verified = 1 WHERE token = ?1",
        params![token],
    )
    .map_err(|err| map_db_err(&err))?;
    Ok(())
}
