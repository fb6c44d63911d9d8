//! Typed account record.
//!
//! `total` is never stored; it is computed from the two pools whenever it is
//! observed, so the `total == daily + purchased` invariant cannot drift.

use crate::tier::{Feature, Tier, TierPolicy};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The two token pools of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "BalanceSnapshot")]
pub struct TokenBalance {
    /// Free allotment, refilled at every daily reset.
    pub daily: u64,
    /// Durable balance bought through the reconciler.
    pub purchased: u64,
}

impl TokenBalance {
    pub fn total(&self) -> u64 {
        self.daily.saturating_add(self.purchased)
    }
}

#[derive(Serialize)]
struct BalanceSnapshot {
    daily: u64,
    purchased: u64,
    total: u64,
}

impl From<TokenBalance> for BalanceSnapshot {
    fn from(b: TokenBalance) -> Self {
        Self {
            daily: b.daily,
            purchased: b.purchased,
            total: b.total(),
        }
    }
}

/// Token and request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub tokens: u64,
    pub requests: u64,
}

impl UsageCounters {
    pub(crate) fn record(&mut self, tokens: u64) {
        self.tokens = self.tokens.saturating_add(tokens);
        self.requests = self.requests.saturating_add(1);
    }
}

/// Counters for the current daily window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub tokens: u64,
    pub requests: u64,
    /// UTC date the window started on.
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub today: DailyUsage,
    pub lifetime: UsageCounters,
}

/// An account's ledger and entitlements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub tier: Tier,
    pub token_balance: TokenBalance,
    pub last_daily_reset: DateTime<Utc>,
    pub usage: Usage,
    pub max_api_keys: u32,
    /// Snapshot of the tier's feature set, rewritten on every tier change.
    pub features: BTreeSet<Feature>,
    /// Compare-and-swap guard; bumped by the store on every ledger write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// A fresh account with a full daily allotment.
    pub fn new(id: impl Into<String>, tier: Tier, policy: &TierPolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            tier,
            token_balance: TokenBalance {
                daily: policy.daily_tokens,
                purchased: 0,
            },
            last_daily_reset: now,
            usage: Usage {
                today: DailyUsage {
                    tokens: 0,
                    requests: 0,
                    date: now.date_naive(),
                },
                lifetime: UsageCounters::default(),
            },
            max_api_keys: policy.max_api_keys,
            features: policy.features.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_balance.total()
    }

    /// Apply a tier's entitlements (not its daily allotment).
    pub(crate) fn apply_entitlements(&mut self, tier: Tier, policy: &TierPolicy) {
        self.tier = tier;
        self.max_api_keys = policy.max_api_keys;
        self.features = policy.features.clone();
    }
}

/// Client-facing usage summary attached to successful responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tokens_used: u64,
    pub remaining_tokens: u64,
    pub tier: Tier,
}

impl UsageReport {
    pub fn new(tokens_used: u64, account: &Account) -> Self {
        Self {
            tokens_used,
            remaining_tokens: account.total_tokens(),
            tier: account.tier,
        }
    }
}
