//! Authorization gate: the single pre-flight check every metered endpoint
//! goes through.
//!
//! ```text
//! Unauthenticated -> KeyValidated -> TierChecked -> DailyReset? -> FeatureChecked
//!                 -> BudgetChecked -> Authorized
//! ```
//!
//! Any step may end in a denial. The gate never debits; settlement does,
//! once the real cost is known.

use crate::cost::CostTable;
use crate::error::{QuotaError, QuotaResult};
use crate::keys::{ApiKeyRecord, ApiKeyRegistry};
use crate::ledger::{Account, AccountLedger, Ledger};
use crate::tier::Feature;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;

/// Steps of one gate evaluation, used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Unauthenticated,
    KeyValidated,
    TierChecked,
    DailyReset,
    FeatureChecked,
    BudgetChecked,
    Authorized,
}

impl fmt::Display for GateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::KeyValidated => "key_validated",
            Self::TierChecked => "tier_checked",
            Self::DailyReset => "daily_reset",
            Self::FeatureChecked => "feature_checked",
            Self::BudgetChecked => "budget_checked",
            Self::Authorized => "authorized",
        };
        f.write_str(name)
    }
}

/// A metered request asking for admission.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    /// Value of the `x-api-key` header, if present.
    pub api_key: Option<&'a str>,
    pub feature: Feature,
    pub endpoint: &'a str,
    /// Number of downstream calls the operation will make.
    pub multiplier: u32,
}

/// An admitted request.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub account: Account,
    pub key_id: String,
    pub feature: Feature,
    pub estimate: u64,
    /// Whether this evaluation refilled the daily allotment.
    pub daily_reset: bool,
}

/// An authenticated caller, without a feature or budget check.
#[derive(Debug, Clone)]
pub struct Caller {
    pub key: ApiKeyRecord,
    pub account: Account,
    pub daily_reset: bool,
}

#[derive(Clone)]
pub struct AuthorizationGate {
    registry: ApiKeyRegistry,
    ledger: AccountLedger,
    costs: Arc<CostTable>,
}

impl AuthorizationGate {
    pub fn new(registry: ApiKeyRegistry, ledger: AccountLedger, costs: Arc<CostTable>) -> Self {
        Self {
            registry,
            ledger,
            costs,
        }
    }

    pub fn costs(&self) -> &CostTable {
        &self.costs
    }

    /// Resolve the key and its account, applying a due daily reset.
    pub fn authenticate(&self, api_key: Option<&str>) -> QuotaResult<Caller> {
        let raw = api_key.map(str::trim).filter(|k| !k.is_empty());
        let Some(raw) = raw else {
            return Err(deny(GateState::Unauthenticated, QuotaError::MissingKey));
        };
        let Some(key) = self.registry.validate(raw)? else {
            return Err(deny(GateState::Unauthenticated, QuotaError::InvalidKey));
        };
        trace(GateState::KeyValidated, &key.account_id);

        let account = match self.ledger.account(&key.account_id) {
            Ok(account) => account,
            Err(err) => return Err(deny(GateState::KeyValidated, err)),
        };
        self.ledger.ledger().tiers().resolve(account.tier)?;
        trace(GateState::TierChecked, &account.id);

        let now = Utc::now();
        let daily_reset = Ledger::should_reset_daily(&account, now);
        let account = if daily_reset {
            let refreshed = self.ledger.refresh_daily(&account.id, now)?;
            trace(GateState::DailyReset, &account.id);
            refreshed
        } else {
            account
        };

        Ok(Caller {
            key,
            account,
            daily_reset,
        })
    }

    /// Run the full gate for a metered request.
    pub fn authorize(&self, request: GateRequest<'_>) -> QuotaResult<Authorization> {
        let Caller {
            key,
            account,
            daily_reset,
        } = self.authenticate(request.api_key)?;

        let cost = self.costs.get(request.endpoint)?;
        if cost.feature != request.feature {
            return Err(QuotaError::InvalidInput(format!(
                "endpoint '{}' belongs to feature '{}', not '{}'",
                request.endpoint, cost.feature, request.feature
            )));
        }

        let tiers = self.ledger.ledger().tiers();
        if !tiers.allows(account.tier, request.feature)? {
            tracing::info!(
                account = %account.id,
                feature = %request.feature,
                tier = %account.tier,
                "gate denied: feature not in tier"
            );
            return Err(QuotaError::FeatureNotAvailable {
                feature: request.feature,
                tier: account.tier,
            });
        }
        trace(GateState::FeatureChecked, &account.id);

        let estimate = self.costs.estimate(request.endpoint, request.multiplier)?;
        if !Ledger::can_consume(&account, estimate) {
            tracing::info!(
                account = %account.id,
                required = estimate,
                available = account.total_tokens(),
                "gate denied: insufficient tokens"
            );
            return Err(QuotaError::InsufficientTokens {
                required: estimate,
                available: account.total_tokens(),
            });
        }
        trace(GateState::BudgetChecked, &account.id);
        trace(GateState::Authorized, &account.id);

        Ok(Authorization {
            account,
            key_id: key.id,
            feature: request.feature,
            estimate,
            daily_reset,
        })
    }
}

fn trace(state: GateState, account: &str) {
    tracing::debug!(%state, account, "gate transition");
}

fn deny(state: GateState, err: QuotaError) -> QuotaError {
    tracing::debug!(%state, reason = err.code(), "gate denied");
    err
}
