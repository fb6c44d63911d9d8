//! Persisted ledger transitions.
//!
//! Each mutation reads a snapshot, computes the next state with [`Ledger`],
//! and writes it back conditionally on the snapshot's version. A lost race
//! reloads and recomputes; after [`MAX_CAS_ATTEMPTS`] the request fails
//! with `ServiceUnavailable` rather than spinning.

use super::{Account, Ledger};
use crate::error::{QuotaError, QuotaResult};
use crate::store::{Store, WriteScope};
use crate::tier::{Tier, TierTable};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Upper bound on reload-and-retry rounds for one compare-and-swap write.
pub const MAX_CAS_ATTEMPTS: usize = 5;

/// Ledger operations backed by the store.
#[derive(Clone)]
pub struct AccountLedger {
    store: Arc<Store>,
    ledger: Ledger,
}

impl AccountLedger {
    pub fn new(store: Arc<Store>, tiers: Arc<TierTable>) -> Self {
        Self {
            store,
            ledger: Ledger::new(tiers),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Provision a new account with a full daily allotment.
    pub fn open_account(&self, id: &str, tier: Tier) -> QuotaResult<Account> {
        let id = id.trim();
        if id.is_empty() || id.len() > 128 {
            return Err(QuotaError::InvalidInput(
                "account id must be 1-128 characters".into(),
            ));
        }
        let policy = self.ledger.tiers().resolve(tier)?;
        let account = Account::new(id, tier, policy, Utc::now());
        self.store.insert_account(&account)?;
        tracing::info!(account = id, %tier, "account opened");
        self.account(id)
    }

    pub fn account(&self, id: &str) -> QuotaResult<Account> {
        self.store.get_account(id)?.ok_or(QuotaError::AccountNotFound)
    }

    /// Apply the daily reset if the window has elapsed. Safe to call on every
    /// request: it only writes when a reset is due.
    pub fn refresh_daily(&self, id: &str, now: DateTime<Utc>) -> QuotaResult<Account> {
        self.update(id, WriteScope::Ledger, |account| {
            if !Ledger::should_reset_daily(account, now) {
                return Ok(None);
            }
            let next = self.ledger.reset_daily(account, now)?;
            tracing::info!(
                account = %account.id,
                daily = next.token_balance.daily,
                "daily allotment reset"
            );
            Ok(Some(next))
        })
    }

    /// Operator tier change.
    pub fn change_tier(&self, id: &str, tier: Tier) -> QuotaResult<Account> {
        self.update(id, WriteScope::Entitlements, |account| {
            if account.tier == tier {
                return Ok(None);
            }
            tracing::info!(account = %account.id, from = %account.tier, to = %tier, "tier changed");
            self.ledger.set_tier(account, tier).map(Some)
        })
    }

    /// Compare-and-swap loop. `step` returns `None` to leave the account as
    /// it is.
    fn update<F>(&self, id: &str, scope: WriteScope, step: F) -> QuotaResult<Account>
    where
        F: Fn(&Account) -> QuotaResult<Option<Account>>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.account(id)?;
            let Some(next) = step(&current)? else {
                return Ok(current);
            };
            if let Some(written) = self
                .store
                .compare_and_swap_account(current.version, &next, scope)?
            {
                return Ok(written);
            }
            tracing::debug!(account = id, "ledger write lost a race, retrying");
        }
        Err(contention(id))
    }
}

pub(crate) fn contention(account_id: &str) -> QuotaError {
    QuotaError::unavailable(
        "ledger write contention",
        anyhow::anyhow!("account {account_id} changed {MAX_CAS_ATTEMPTS} times during one write"),
    )
}
