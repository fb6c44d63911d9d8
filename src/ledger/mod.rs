//! Account ledger: the token economy of a single account.
//!
//! The functions on [`Ledger`] are pure: they take an account snapshot and
//! return the next snapshot or a typed denial, never touching storage.
//! [`AccountLedger`] persists those transitions through compare-and-swap
//! writes so concurrent requests cannot overdraw a balance.
//!
//! ## Policy decisions
//! - The daily window is rolling: it ends 24 hours after the last reset,
//!   not at midnight.
//! - Debits drain the daily pool before the purchased pool.
//! - A purchase promotes `free`/`verified` accounts to `premium`. The new
//!   key limit and features apply immediately; the larger daily allotment
//!   applies from the next reset.

pub mod account;
pub mod service;

pub use account::{Account, DailyUsage, TokenBalance, Usage, UsageCounters, UsageReport};
pub use service::AccountLedger;

use crate::billing::catalog::TokenPackage;
use crate::error::{QuotaError, QuotaResult};
use crate::tier::{Tier, TierTable};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Length of the daily allotment window.
pub const DAILY_WINDOW_HOURS: i64 = 24;

/// Result of a successful debit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumption {
    pub account: Account,
    pub from_daily: u64,
    pub from_purchased: u64,
}

/// Pure ledger transitions.
#[derive(Debug, Clone)]
pub struct Ledger {
    tiers: Arc<TierTable>,
}

impl Ledger {
    pub fn new(tiers: Arc<TierTable>) -> Self {
        Self { tiers }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// Whether the account can cover `amount` from its combined pools.
    pub fn can_consume(account: &Account, amount: u64) -> bool {
        account.total_tokens() >= amount
    }

    /// Debit `amount`, daily pool first. The input is left untouched on
    /// denial.
    pub fn consume(account: &Account, amount: u64) -> QuotaResult<Consumption> {
        if !Self::can_consume(account, amount) {
            return Err(QuotaError::InsufficientTokens {
                required: amount,
                available: account.total_tokens(),
            });
        }

        let mut next = account.clone();
        let from_daily = amount.min(next.token_balance.daily);
        let from_purchased = amount - from_daily;
        next.token_balance.daily -= from_daily;
        next.token_balance.purchased -= from_purchased;

        next.usage.today.tokens = next.usage.today.tokens.saturating_add(amount);
        next.usage.today.requests = next.usage.today.requests.saturating_add(1);
        next.usage.lifetime.record(amount);

        Ok(Consumption {
            account: next,
            from_daily,
            from_purchased,
        })
    }

    pub fn should_reset_daily(account: &Account, now: DateTime<Utc>) -> bool {
        now - account.last_daily_reset >= Duration::hours(DAILY_WINDOW_HOURS)
    }

    /// Refill the daily pool to the tier allotment and open a new usage
    /// window. Returns the account unchanged if the window is still open.
    pub fn reset_daily(&self, account: &Account, now: DateTime<Utc>) -> QuotaResult<Account> {
        if !Self::should_reset_daily(account, now) {
            return Ok(account.clone());
        }

        let policy = self.tiers.resolve(account.tier)?;
        let mut next = account.clone();
        next.token_balance.daily = policy.daily_tokens;
        next.usage.today = DailyUsage {
            tokens: 0,
            requests: 0,
            date: now.date_naive(),
        };
        next.last_daily_reset = now;
        Ok(next)
    }

    /// Credit a purchased package and promote the account to at least
    /// premium.
    pub fn add_purchased_tokens(
        &self,
        account: &Account,
        package: &TokenPackage,
        payment_id: &str,
    ) -> QuotaResult<Account> {
        let credit = package.total_tokens();
        let mut next = account.clone();
        next.token_balance.purchased = next
            .token_balance
            .purchased
            .checked_add(credit)
            .ok_or_else(|| QuotaError::InvalidInput("purchased balance overflow".into()))?;

        let tier = account.tier.max(Tier::Premium);
        if tier != account.tier {
            let policy = self.tiers.resolve(tier)?;
            next.apply_entitlements(tier, policy);
        }

        tracing::debug!(
            account = %account.id,
            package = package.id,
            payment_id,
            credit,
            "purchased tokens applied"
        );
        Ok(next)
    }

    /// Operator tier change. Entitlements follow immediately; the daily
    /// allotment follows at the next reset.
    pub fn set_tier(&self, account: &Account, tier: Tier) -> QuotaResult<Account> {
        let policy = self.tiers.resolve(tier)?;
        let mut next = account.clone();
        next.apply_entitlements(tier, policy);
        Ok(next)
    }
}
