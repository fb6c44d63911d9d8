//! Consumption settlement: debits the actual cost of a completed operation,
//! once per operation ID.

use crate::error::{QuotaError, QuotaResult};
use crate::ledger::service::{contention, MAX_CAS_ATTEMPTS};
use crate::ledger::{Account, AccountLedger, Ledger};
use crate::store::{SettlementWrite, Store};
use chrono::Utc;
use std::sync::Arc;

const MAX_OPERATION_ID_LEN: usize = 128;

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub account: Account,
    /// Tokens debited by this call; zero on replay.
    pub tokens_used: u64,
    pub already_settled: bool,
}

#[derive(Clone)]
pub struct Settlement {
    store: Arc<Store>,
    ledger: AccountLedger,
}

impl Settlement {
    pub fn new(ledger: AccountLedger) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
        }
    }

    /// Debit `actual_cost` from the account. An `operation_id` the same
    /// account already settled returns the current account without debiting
    /// again; operation ids of other accounts are unrelated.
    pub fn settle(
        &self,
        account_id: &str,
        operation_id: &str,
        actual_cost: u64,
    ) -> QuotaResult<SettlementOutcome> {
        let operation_id = operation_id.trim();
        if operation_id.is_empty() || operation_id.len() > MAX_OPERATION_ID_LEN {
            return Err(QuotaError::InvalidInput(format!(
                "operation id must be 1-{MAX_OPERATION_ID_LEN} characters"
            )));
        }

        if self.store.is_settled(account_id, operation_id)? {
            return self.replayed(account_id, operation_id);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.ledger.refresh_daily(account_id, Utc::now())?;
            let consumption = match Ledger::consume(&current, actual_cost) {
                Ok(consumption) => consumption,
                Err(err) => {
                    // The downstream work already ran; the shortfall is absorbed.
                    tracing::warn!(
                        account = account_id,
                        operation_id,
                        actual_cost,
                        available = current.total_tokens(),
                        "settlement denied after completed operation"
                    );
                    return Err(err);
                }
            };

            match self.store.commit_settlement(
                operation_id,
                actual_cost,
                current.version,
                &consumption.account,
            )? {
                SettlementWrite::Applied(account) => {
                    tracing::info!(
                        account = account_id,
                        operation_id,
                        from_daily = consumption.from_daily,
                        from_purchased = consumption.from_purchased,
                        "operation settled"
                    );
                    return Ok(SettlementOutcome {
                        account,
                        tokens_used: actual_cost,
                        already_settled: false,
                    });
                }
                SettlementWrite::Duplicate => return self.replayed(account_id, operation_id),
                SettlementWrite::AccountConflict => {
                    tracing::debug!(account = account_id, operation_id, "settlement lost a race, retrying");
                }
            }
        }
        Err(contention(account_id))
    }

    fn replayed(&self, account_id: &str, operation_id: &str) -> QuotaResult<SettlementOutcome> {
        tracing::debug!(account = account_id, operation_id, "settlement replayed");
        Ok(SettlementOutcome {
            account: self.ledger.account(account_id)?,
            tokens_used: 0,
            already_settled: true,
        })
    }
}
