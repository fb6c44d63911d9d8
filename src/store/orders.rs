//! Orders, purchase transactions and settlements.
//!
//! The two multi-row writes here (crediting a purchase, settling a metered
//! operation) run inside a single SQLite transaction so the order status,
//! the account ledger and the audit row move together or not at all.

use super::accounts::{cas_account, WriteScope};
use super::{get_parsed, get_time, get_u64, sql_int, Store};
use crate::billing::order::{OrderStatus, PendingOrder, PurchaseTransaction};
use crate::error::QuotaResult;
use crate::ledger::Account;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

const ORDER_COLUMNS: &str = "order_id, account_id, package_id, tokens, amount_minor, currency,
     status, payment_id, created_at, expires_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, order_id, account_id, payment_id, package_id, tokens, amount_minor, currency, created_at";

/// Outcome of [`Store::commit_purchase`].
#[derive(Debug)]
pub enum PurchaseWrite {
    Applied {
        account: Account,
        transaction: PurchaseTransaction,
    },
    /// The order left `created` before this write; nothing changed.
    OrderNotCreated,
    /// The account moved past the expected version; nothing changed.
    AccountConflict,
}

/// Outcome of [`Store::commit_settlement`].
#[derive(Debug)]
pub enum SettlementWrite {
    Applied(Account),
    /// The operation was already settled; nothing changed.
    Duplicate,
    /// The account moved past the expected version; nothing changed.
    AccountConflict,
}

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingOrder> {
    Ok(PendingOrder {
        order_id: row.get(0)?,
        account_id: row.get(1)?,
        package_id: row.get(2)?,
        tokens: get_u64(row, 3)?,
        amount_minor: get_u64(row, 4)?,
        currency: get_parsed(row, 5)?,
        status: get_parsed(row, 6)?,
        payment_id: row.get(7)?,
        created_at: get_time(row, 8)?,
        expires_at: get_time(row, 9)?,
        updated_at: get_time(row, 10)?,
    })
}

fn transaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PurchaseTransaction> {
    Ok(PurchaseTransaction {
        id: row.get(0)?,
        order_id: row.get(1)?,
        account_id: row.get(2)?,
        payment_id: row.get(3)?,
        package_id: row.get(4)?,
        tokens: get_u64(row, 5)?,
        amount_minor: get_u64(row, 6)?,
        currency: get_parsed(row, 7)?,
        created_at: get_time(row, 8)?,
    })
}

impl Store {
    pub fn insert_order(&self, order: &PendingOrder) -> QuotaResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO orders ({ORDER_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                order.order_id,
                order.account_id,
                order.package_id,
                sql_int(order.tokens)?,
                sql_int(order.amount_minor)?,
                order.currency.as_str(),
                order.status.as_str(),
                order.payment_id,
                order.created_at.timestamp(),
                order.expires_at.timestamp(),
                order.updated_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> QuotaResult<Option<PendingOrder>> {
        let conn = self.conn.lock();
        let order = conn
            .query_row(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = ?1"),
                params![order_id],
                order_from_row,
            )
            .optional()?;
        Ok(order)
    }

    /// Move a `created` order to a terminal status. Returns false if the
    /// order was not in `created`.
    pub fn close_order(&self, order_id: &str, status: OrderStatus) -> QuotaResult<bool> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orders SET status = ?1, updated_at = ?2
             WHERE order_id = ?3 AND status = 'created'",
            params![status.as_str(), Utc::now().timestamp(), order_id],
        )?;
        Ok(updated > 0)
    }

    /// Mark every `created` order past its deadline as `expired`.
    pub fn expire_stale_orders(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE orders SET status = 'expired', updated_at = ?1
             WHERE status = 'created' AND expires_at < ?1",
            params![now.timestamp()],
        )?;
        Ok(updated as u64)
    }

    /// Credit a purchase: order `created` → `completed`, account ledger CAS,
    /// and the transaction row, all or nothing.
    pub fn commit_purchase(
        &self,
        order_id: &str,
        payment_id: &str,
        expected_version: u64,
        next: &Account,
        transaction: &PurchaseTransaction,
    ) -> QuotaResult<PurchaseWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE orders SET status = 'completed', payment_id = ?1, updated_at = ?2
             WHERE order_id = ?3 AND status = 'created'",
            params![payment_id, Utc::now().timestamp(), order_id],
        )?;
        if updated == 0 {
            return Ok(PurchaseWrite::OrderNotCreated);
        }

        let Some(account) = cas_account(&tx, expected_version, next, WriteScope::Entitlements)?
        else {
            return Ok(PurchaseWrite::AccountConflict);
        };

        tx.execute(
            &format!(
                "INSERT INTO transactions ({TRANSACTION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                transaction.id,
                transaction.order_id,
                transaction.account_id,
                transaction.payment_id,
                transaction.package_id,
                sql_int(transaction.tokens)?,
                sql_int(transaction.amount_minor)?,
                transaction.currency.as_str(),
                transaction.created_at.timestamp(),
            ],
        )?;

        tx.commit()?;
        Ok(PurchaseWrite::Applied {
            account,
            transaction: transaction.clone(),
        })
    }

    /// Debit a settled operation: settlement row plus ledger-field CAS.
    pub fn commit_settlement(
        &self,
        operation_id: &str,
        cost: u64,
        expected_version: u64,
        next: &Account,
    ) -> QuotaResult<SettlementWrite> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let seen: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM settlements WHERE account_id = ?1 AND operation_id = ?2",
                params![next.id, operation_id],
                |row| row.get(0),
            )
            .optional()?;
        if seen.is_some() {
            return Ok(SettlementWrite::Duplicate);
        }

        let Some(account) = cas_account(&tx, expected_version, next, WriteScope::Ledger)? else {
            return Ok(SettlementWrite::AccountConflict);
        };

        tx.execute(
            "INSERT INTO settlements (operation_id, account_id, cost, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![operation_id, next.id, sql_int(cost)?, Utc::now().timestamp()],
        )?;

        tx.commit()?;
        Ok(SettlementWrite::Applied(account))
    }

    /// Whether the account has already settled this operation ID.
    pub fn is_settled(&self, account_id: &str, operation_id: &str) -> QuotaResult<bool> {
        let conn = self.conn.lock();
        let seen: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM settlements WHERE account_id = ?1 AND operation_id = ?2",
                params![account_id, operation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    /// Purchase history for an account, most recent first.
    pub fn list_transactions(&self, account_id: &str, limit: usize) -> QuotaResult<Vec<PurchaseTransaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE account_id = ?1 ORDER BY created_at DESC, id LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = stmt
            .query_map(params![account_id, limit], transaction_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{seed_account, test_store};
    use super::*;
    use crate::billing::catalog::Currency;
    use crate::tier::Tier;
    use chrono::Duration;

    fn order(order_id: &str, account_id: &str, expires_in: Duration) -> PendingOrder {
        let now = Utc::now();
        PendingOrder {
            order_id: order_id.into(),
            account_id: account_id.into(),
            package_id: "starter".into(),
            tokens: 5_000,
            amount_minor: 900,
            currency: Currency::Usd,
            status: OrderStatus::Created,
            payment_id: None,
            created_at: now,
            expires_at: now + expires_in,
            updated_at: now,
        }
    }

    fn transaction(order_id: &str, account_id: &str) -> PurchaseTransaction {
        PurchaseTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.into(),
            account_id: account_id.into(),
            payment_id: "pay_1".into(),
            package_id: "starter".into(),
            tokens: 5_000,
            amount_minor: 900,
            currency: Currency::Usd,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn order_roundtrip() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        store.insert_order(&order("order_1", "acc_1", Duration::minutes(20))).unwrap();

        let loaded = store.get_order("order_1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Created);
        assert_eq!(loaded.currency, Currency::Usd);
        assert_eq!(loaded.tokens, 5_000);
        assert!(store.get_order("nope").unwrap().is_none());
    }

    #[test]
    fn close_order_only_from_created() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        store.insert_order(&order("order_1", "acc_1", Duration::minutes(20))).unwrap();

        assert!(store.close_order("order_1", OrderStatus::Failed).unwrap());
        assert!(!store.close_order("order_1", OrderStatus::Expired).unwrap());
        assert_eq!(
            store.get_order("order_1").unwrap().unwrap().status,
            OrderStatus::Failed
        );
    }

    #[test]
    fn sweep_expires_only_overdue_created_orders() {
        let (_tmp, store) = test_store();
        seed_account(&store, "acc_1", Tier::Free);
        store.insert_order(&order("old", "acc_1", Duration::minutes(-5))).unwrap();
        store.insert_order(&order("fresh", "acc_1", Duration::minutes(20))).unwrap();

        assert_eq!(store.expire_stale_orders(Utc::now()).unwrap(), 1);
        assert_eq!(store.get_order("old").unwrap().unwrap().status, OrderStatus::Expired);
        assert_eq!(store.get_order("fresh").unwrap().unwrap().status, OrderStatus::Created);
        assert_eq!(store.expire_stale_orders(Utc::now()).unwrap(), 0);
    }

    #[test]
    fn commit_purchase_applies_once() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);
        store.insert_order(&order("order_1", "acc_1", Duration::minutes(20))).unwrap();

        let mut next = account.clone();
        next.token_balance.purchased = 5_000;
        let write = store
            .commit_purchase("order_1", "pay_1", account.version, &next, &transaction("order_1", "acc_1"))
            .unwrap();
        let PurchaseWrite::Applied { account: credited, .. } = write else {
            panic!("expected purchase to apply");
        };
        assert_eq!(credited.token_balance.purchased, 5_000);

        let again = store
            .commit_purchase("order_1", "pay_1", credited.version, &next, &transaction("order_1", "acc_1"))
            .unwrap();
        assert!(matches!(again, PurchaseWrite::OrderNotCreated));
        assert_eq!(store.list_transactions("acc_1", 10).unwrap().len(), 1);
    }

    #[test]
    fn commit_purchase_conflict_rolls_back_order() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);
        store.insert_order(&order("order_1", "acc_1", Duration::minutes(20))).unwrap();

        let mut next = account.clone();
        next.token_balance.purchased = 5_000;
        let write = store
            .commit_purchase("order_1", "pay_1", account.version + 7, &next, &transaction("order_1", "acc_1"))
            .unwrap();
        assert!(matches!(write, PurchaseWrite::AccountConflict));

        let loaded = store.get_order("order_1").unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Created);
        assert!(loaded.payment_id.is_none());
        assert!(store.list_transactions("acc_1", 10).unwrap().is_empty());
    }

    #[test]
    fn commit_settlement_rejects_duplicate_operation() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);

        let mut next = account.clone();
        next.token_balance.daily = 700;
        let first = store.commit_settlement("op_1", 300, account.version, &next).unwrap();
        let SettlementWrite::Applied(settled) = first else {
            panic!("expected settlement to apply");
        };
        assert_eq!(settled.token_balance.daily, 700);
        assert!(store.is_settled("acc_1", "op_1").unwrap());
        assert!(!store.is_settled("acc_2", "op_1").unwrap());

        let mut again = settled.clone();
        again.token_balance.daily = 400;
        let second = store.commit_settlement("op_1", 300, settled.version, &again).unwrap();
        assert!(matches!(second, SettlementWrite::Duplicate));
        assert_eq!(store.get_account("acc_1").unwrap().unwrap().token_balance.daily, 700);
    }

    #[test]
    fn commit_settlement_scopes_operation_ids_per_account() {
        let (_tmp, store) = test_store();
        let first = seed_account(&store, "acc_1", Tier::Free);
        let second = seed_account(&store, "acc_2", Tier::Free);

        let mut next = first.clone();
        next.token_balance.daily = 700;
        let write = store.commit_settlement("op_1", 300, first.version, &next).unwrap();
        assert!(matches!(write, SettlementWrite::Applied(_)));

        let mut next = second.clone();
        next.token_balance.daily = 100;
        let write = store.commit_settlement("op_1", 900, second.version, &next).unwrap();
        assert!(matches!(write, SettlementWrite::Applied(_)));
        assert_eq!(store.get_account("acc_2").unwrap().unwrap().token_balance.daily, 100);
    }

    #[test]
    fn commit_settlement_conflict_leaves_no_record() {
        let (_tmp, store) = test_store();
        let account = seed_account(&store, "acc_1", Tier::Free);

        let write = store
            .commit_settlement("op_1", 300, account.version + 1, &account)
            .unwrap();
        assert!(matches!(write, SettlementWrite::AccountConflict));
        assert!(!store.is_settled("acc_1", "op_1").unwrap());
    }
}
