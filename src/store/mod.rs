//! SQLite-backed persistence for accounts, API keys, orders and settlements.
//!
//! Tables:
//! - `accounts`: ledger fields, entitlements, CAS `version`
//! - `api_keys`: key_hash, account_id, is_active, last_used
//! - `orders`: pending/completed/failed/expired purchase orders
//! - `transactions`: immutable credit records, unique per order
//! - `settlements`: consumed operation ids, unique per account and operation
//!
//! One connection is opened per process and shared behind a mutex. Every
//! ledger write is conditional on the account's `version`, and the balance
//! columns carry `CHECK` constraints, so the database itself refuses an
//! overdraft even if application code misbehaves.

mod accounts;
mod keys;
mod orders;

pub use accounts::WriteScope;
pub use orders::{PurchaseWrite, SettlementWrite};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::Connection;
use std::path::Path;

/// Shared database handle.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("creating database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                tier TEXT NOT NULL,
                daily_tokens INTEGER NOT NULL CHECK (daily_tokens >= 0),
                purchased_tokens INTEGER NOT NULL CHECK (purchased_tokens >= 0),
                last_daily_reset INTEGER NOT NULL,
                today_tokens INTEGER NOT NULL CHECK (today_tokens >= 0),
                today_requests INTEGER NOT NULL CHECK (today_requests >= 0),
                today_date TEXT NOT NULL,
                lifetime_tokens INTEGER NOT NULL CHECK (lifetime_tokens >= 0),
                lifetime_requests INTEGER NOT NULL CHECK (lifetime_requests >= 0),
                max_api_keys INTEGER NOT NULL CHECK (max_api_keys >= 0),
                features TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL UNIQUE,
                prefix TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                last_used INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_account ON api_keys(account_id);

            CREATE TABLE IF NOT EXISTS orders (
                order_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
                package_id TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                amount_minor INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'created',
                payment_id TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_account ON orders(account_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status, expires_at);

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL UNIQUE REFERENCES orders(order_id),
                account_id TEXT NOT NULL,
                payment_id TEXT NOT NULL,
                package_id TEXT NOT NULL,
                tokens INTEGER NOT NULL,
                amount_minor INTEGER NOT NULL,
                currency TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_account ON transactions(account_id);

            CREATE TABLE IF NOT EXISTS settlements (
                account_id TEXT NOT NULL,
                operation_id TEXT NOT NULL,
                cost INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (account_id, operation_id)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ── Column conversions ──────────────────────────────────────────────

/// Decode a column that must hold a non-negative integer.
fn get_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_u32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let value: i64 = row.get(idx)?;
    u32::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn get_opt_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.get(idx)?;
    secs.map(|s| {
        DateTime::from_timestamp(s, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, s))
    })
    .transpose()
}

fn get_date(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Decode a text column through `FromStr`.
fn get_parsed<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Encode a token count; counts beyond `i64::MAX` cannot be stored.
fn sql_int(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}
