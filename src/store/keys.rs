//! API key rows.

use super::{get_opt_time, get_time, Store};
use crate::error::QuotaResult;
use crate::keys::ApiKeyRecord;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

const KEY_COLUMNS: &str = "id, account_id, name, key_hash, prefix, is_active, created_at, last_used";

fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        key_hash: row.get(3)?,
        prefix: row.get(4)?,
        is_active: row.get(5)?,
        created_at: get_time(row, 6)?,
        last_used: get_opt_time(row, 7)?,
    })
}

impl Store {
    /// Insert an active key unless the account already holds `max_active`
    /// active keys. Count and insert are one statement, so two concurrent
    /// creations cannot both slip under the limit.
    pub fn insert_key_within_limit(&self, record: &ApiKeyRecord, max_active: u32) -> QuotaResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO api_keys (id, account_id, name, key_hash, prefix, is_active, created_at, last_used)
             SELECT ?1, ?2, ?3, ?4, ?5, 1, ?6, NULL
             WHERE (SELECT COUNT(*) FROM api_keys WHERE account_id = ?2 AND is_active = 1) < ?7",
            params![
                record.id,
                record.account_id,
                record.name,
                record.key_hash,
                record.prefix,
                record.created_at.timestamp(),
                i64::from(max_active),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Find an active key by hash and stamp `last_used`.
    pub fn touch_active_key(&self, key_hash: &str, now: DateTime<Utc>) -> QuotaResult<Option<ApiKeyRecord>> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE api_keys SET last_used = ?1 WHERE key_hash = ?2 AND is_active = 1",
            params![now.timestamp(), key_hash],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        let record = conn
            .query_row(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE key_hash = ?1"),
                params![key_hash],
                key_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Keys owned by an account, newest first.
    pub fn list_keys(&self, account_id: &str) -> QuotaResult<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {KEY_COLUMNS} FROM api_keys WHERE account_id = ?1 ORDER BY created_at DESC, id"
        ))?;
        let keys = stmt
            .query_map(params![account_id], key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Delete a key owned by `account_id`. Returns false if no such key.
    pub fn delete_key(&self, account_id: &str, key_id: &str) -> QuotaResult<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM api_keys WHERE id = ?1 AND account_id = ?2",
            params![key_id, account_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn count_active_keys(&self, account_id: &str) -> QuotaResult<u32> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM api_keys WHERE account_id = ?1 AND is_active = 1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
