//! Account rows and compare-and-swap ledger writes.

use super::{get_date, get_parsed, get_time, get_u32, get_u64, sql_int, Store};
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::{Account, DailyUsage, TokenBalance, Usage, UsageCounters};
use crate::tier::Feature;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;

const ACCOUNT_COLUMNS: &str = "id, tier, daily_tokens, purchased_tokens, last_daily_reset,
     today_tokens, today_requests, today_date, lifetime_tokens, lifetime_requests,
     max_api_keys, features, version, created_at, updated_at";

/// Which columns a compare-and-swap write touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScope {
    /// Balances, usage counters and reset timestamp.
    Ledger,
    /// Ledger columns plus tier, key limit and features.
    Entitlements,
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let features_json: String = row.get(11)?;
    let features: BTreeSet<Feature> = serde_json::from_str(&features_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, Box::new(e)))?;

    Ok(Account {
        id: row.get(0)?,
        tier: get_parsed(row, 1)?,
        token_balance: TokenBalance {
            daily: get_u64(row, 2)?,
            purchased: get_u64(row, 3)?,
        },
        last_daily_reset: get_time(row, 4)?,
        usage: Usage {
            today: DailyUsage {
                tokens: get_u64(row, 5)?,
                requests: get_u64(row, 6)?,
                date: get_date(row, 7)?,
            },
            lifetime: UsageCounters {
                tokens: get_u64(row, 8)?,
                requests: get_u64(row, 9)?,
            },
        },
        max_api_keys: get_u32(row, 10)?,
        features,
        version: get_u64(row, 12)?,
        created_at: get_time(row, 13)?,
        updated_at: get_time(row, 14)?,
    })
}

fn features_json(features: &BTreeSet<Feature>) -> rusqlite::Result<String> {
    serde_json::to_string(features).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

pub(super) fn load_account(conn: &Connection, id: &str) -> rusqlite::Result<Option<Account>> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
        params![id],
        account_from_row,
    )
    .optional()
}

/// Write `next` only if the stored row is still at `expected_version`.
/// Returns the re-read row, or `None` when another writer got there first.
pub(super) fn cas_account(
    conn: &Connection,
    expected_version: u64,
    next: &Account,
    scope: WriteScope,
) -> rusqlite::Result<Option<Account>> {
    let now = Utc::now().timestamp();
    let b = &next.token_balance;
    let u = &next.usage;

    let updated = match scope {
        WriteScope::Ledger => conn.execute(
            "UPDATE accounts SET
                daily_tokens = ?1, purchased_tokens = ?2, last_daily_reset = ?3,
                today_tokens = ?4, today_requests = ?5, today_date = ?6,
                lifetime_tokens = ?7, lifetime_requests = ?8,
                version = version + 1, updated_at = ?9
             WHERE id = ?10 AND version = ?11",
            params![
                sql_int(b.daily)?,
                sql_int(b.purchased)?,
                next.last_daily_reset.timestamp(),
                sql_int(u.today.tokens)?,
                sql_int(u.today.requests)?,
                u.today.date.format("%Y-%m-%d").to_string(),
                sql_int(u.lifetime.tokens)?,
                sql_int(u.lifetime.requests)?,
                now,
                next.id,
                sql_int(expected_version)?,
            ],
        )?,
        WriteScope::Entitlements => conn.execute(
            "UPDATE accounts SET
                daily_tokens = ?1, purchased_tokens = ?2, last_daily_reset = ?3,
                today_tokens = ?4, today_requests = ?5, today_date = ?6,
                lifetime_tokens = ?7, lifetime_requests = ?8,
                tier = ?9, max_api_keys = ?10, features = ?11,
                version = version + 1, updated_at = ?12
             WHERE id = ?13 AND version = ?14",
            params![
                sql_int(b.daily)?,
                sql_int(b.purchased)?,
                next.last_daily_reset.timestamp(),
                sql_int(u.today.tokens)?,
                sql_int(u.today.requests)?,
                u.today.date.format("%Y-%m-%d").to_string(),
                sql_int(u.lifetime.tokens)?,
                sql_int(u.lifetime.requests)?,
                next.tier.as_str(),
                i64::from(next.max_api_keys),
                features_json(&next.features)?,
                now,
                next.id,
                sql_int(expected_version)?,
            ],
        )?,
    };

    if updated == 0 {
        return Ok(None);
    }
    load_account(conn, &next.id)
}

impl Store {
    /// Insert a new account row exactly as given.
    pub fn insert_account(&self, account: &Account) -> QuotaResult<()> {
        let conn = self.conn.lock();
        let b = &account.token_balance;
        let u = &account.usage;
        let result = conn.execute(
            &format!(
                "INSERT INTO accounts ({ACCOUNT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                account.id,
                account.tier.as_str(),
                sql_int(b.daily)?,
                sql_int(b.purchased)?,
                account.last_daily_reset.timestamp(),
                sql_int(u.today.tokens)?,
                sql_int(u.today.requests)?,
                u.today.date.format("%Y-%m-%d").to_string(),
                sql_int(u.lifetime.tokens)?,
                sql_int(u.lifetime.requests)?,
                i64::from(account.max_api_keys),
                features_json(&account.features)?,
                sql_int(account.version)?,
                account.created_at.timestamp(),
                account.updated_at.timestamp(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(QuotaError::AccountExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up an account by ID. Malformed rows are an error, not `None`.
    pub fn get_account(&self, id: &str) -> QuotaResult<Option<Account>> {
        let conn = self.conn.lock();
        Ok(load_account(&conn, id)?)
    }

    /// Conditional write keyed on `(id, version)`.
    pub fn compare_and_swap_account(
        &self,
        expected_version: u64,
        next: &Account,
        scope: WriteScope,
    ) -> QuotaResult<Option<Account>> {
        let conn = self.conn.lock();
        Ok(cas_account(&conn, expected_version, next, scope)?)
    }

    /// Count registered accounts.
    pub fn account_count(&self) -> QuotaResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{seed_account, test_store};
    use super::*;
    use crate::tier::Tier;

    #[test]
    fn insert_and_get_roundtrip() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Verified);

        assert_eq!(account.id, "acc_1");
        assert_eq!(account.tier, Tier::Verified);
        assert_eq!(account.token_balance.daily, 2_500);
        assert_eq!(account.max_api_keys, 3);
        assert!(account.features.contains(&Feature::CodeReview));
        assert_eq!(account.version, 0);
    }

    #[test]
    fn duplicate_insert_is_account_exists() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);
        assert!(matches!(
            store.insert_account(&account),
            Err(QuotaError::AccountExists)
        ));
    }

    #[test]
    fn cas_write_bumps_version() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);

        let mut next = account.clone();
        next.token_balance.daily = 400;
        let written = store
            .compare_and_swap_account(account.version, &next, WriteScope::Ledger)
            .unwrap()
            .unwrap();
        assert_eq!(written.version, 1);
        assert_eq!(written.token_balance.daily, 400);
    }

    #[test]
    fn cas_write_with_stale_version_is_rejected() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);

        let mut first = account.clone();
        first.token_balance.daily = 900;
        store
            .compare_and_swap_account(account.version, &first, WriteScope::Ledger)
            .unwrap()
            .unwrap();

        let mut stale = account.clone();
        stale.token_balance.daily = 100;
        let result = store
            .compare_and_swap_account(account.version, &stale, WriteScope::Ledger)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(
            store.get_account("acc_1").unwrap().unwrap().token_balance.daily,
            900
        );
    }

    #[test]
    fn ledger_scope_does_not_touch_tier() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);

        let mut next = account.clone();
        next.tier = Tier::Premium;
        next.token_balance.purchased = 10;
        let written = store
            .compare_and_swap_account(account.version, &next, WriteScope::Ledger)
            .unwrap()
            .unwrap();
        assert_eq!(written.tier, Tier::Free);
        assert_eq!(written.token_balance.purchased, 10);

        let written = store
            .compare_and_swap_account(written.version, &next, WriteScope::Entitlements)
            .unwrap()
            .unwrap();
        assert_eq!(written.tier, Tier::Premium);
    }

    #[test]
    fn negative_balance_row_is_rejected_on_read() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        {
            let conn = store.conn.lock();
            // bypass the CHECK constraint to simulate a corrupted import
            conn.execute_batch("PRAGMA ignore_check_constraints = ON;").unwrap();
            conn.execute(
                "UPDATE accounts SET purchased_tokens = -5 WHERE id = 'acc_1'",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.get_account("acc_1"),
            Err(QuotaError::ServiceUnavailable(_))
        ));
    }

    #[test]
    fn unknown_tier_row_is_rejected_on_read() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        {
            let conn = store.conn.lock();
            conn.execute("UPDATE accounts SET tier = 'gold' WHERE id = 'acc_1'", [])
                .unwrap();
        }
        assert!(store.get_account("acc_1").is_err());
    }

    #[test]
    fn check_constraint_blocks_negative_writes() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        let conn = store.conn.lock();
        let result = conn.execute(
            "UPDATE accounts SET daily_tokens = daily_tokens - 5000 WHERE id = 'acc_1'",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn account_count_tracks_inserts() {
        let (_tmp, store) = test_store();
        assert_eq!(store.account_count().unwrap(), 0);
        seed_account(&store, "a", Tier::Free);
        seed_account(&store, "b", Tier::Premium);
        assert_eq!(store.account_count().unwrap(), 2);
    }
}
