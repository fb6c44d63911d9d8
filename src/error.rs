//! Typed outcomes for the quota engine.
//!
//! Every denial the request layer can see is a variant here. Storage and
//! provider faults collapse into [`QuotaError::ServiceUnavailable`]; the
//! underlying cause is logged where it is wrapped and never rendered to
//! clients.

use crate::tier::{Feature, Tier};

/// Errors returned by the ledger, registry, gate, settlement and reconciler.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("missing API key")]
    MissingKey,

    #[error("invalid or inactive API key")]
    InvalidKey,

    #[error("API key limit reached ({max} active keys)")]
    KeyLimitExceeded { max: u32 },

    #[error("API key not found")]
    KeyNotFound,

    #[error("feature '{feature}' is not available on the {tier} tier")]
    FeatureNotAvailable { feature: Feature, tier: Tier },

    #[error("insufficient tokens: required {required}, available {available}")]
    InsufficientTokens { required: u64, available: u64 },

    #[error("order not found")]
    OrderNotFound,

    #[error("order already processed")]
    OrderAlreadyProcessed,

    #[error("order expired")]
    OrderExpired,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("account not found")]
    AccountNotFound,

    #[error("account already exists")]
    AccountExists,

    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error("unknown endpoint '{0}'")]
    UnknownEndpoint(String),

    #[error("unknown token package '{0}'")]
    UnknownPackage(String),

    #[error("package '{package}' is not sold in {currency}")]
    UnsupportedCurrency { package: String, currency: String },

    #[error("payment has not been captured")]
    PaymentNotCaptured,

    #[error("{0}")]
    InvalidInput(String),

    #[error("service unavailable")]
    ServiceUnavailable(#[source] anyhow::Error),
}

impl QuotaError {
    /// Wrap an internal fault, logging the cause.
    pub fn unavailable(context: &str, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        tracing::error!(error = %format!("{err:#}"), "{context}");
        Self::ServiceUnavailable(err.context(context.to_string()))
    }

    /// Tokens missing to cover the request, if this is a balance denial.
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            Self::InsufficientTokens {
                required,
                available,
            } => Some(required.saturating_sub(*available)),
            _ => None,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingKey => "missing_key",
            Self::InvalidKey => "invalid_key",
            Self::KeyLimitExceeded { .. } => "key_limit_exceeded",
            Self::KeyNotFound => "key_not_found",
            Self::FeatureNotAvailable { .. } => "feature_not_available",
            Self::InsufficientTokens { .. } => "insufficient_tokens",
            Self::OrderNotFound => "order_not_found",
            Self::OrderAlreadyProcessed => "order_already_processed",
            Self::OrderExpired => "order_expired",
            Self::InvalidSignature => "invalid_signature",
            Self::AccountNotFound => "account_not_found",
            Self::AccountExists => "account_exists",
            Self::UnknownTier(_) => "unknown_tier",
            Self::UnknownEndpoint(_) => "unknown_endpoint",
            Self::UnknownPackage(_) => "unknown_package",
            Self::UnsupportedCurrency { .. } => "unsupported_currency",
            Self::PaymentNotCaptured => "payment_not_captured",
            Self::InvalidInput(_) => "invalid_input",
            Self::ServiceUnavailable(_) => "service_unavailable",
        }
    }
}

impl From<rusqlite::Error> for QuotaError {
    fn from(err: rusqlite::Error) -> Self {
        Self::unavailable("storage error", err)
    }
}

pub type QuotaResult<T> = Result<T, QuotaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_only_for_balance_denials() {
        let err = QuotaError::InsufficientTokens {
            required: 400,
            available: 300,
        };
        assert_eq!(err.shortfall(), Some(100));
        assert_eq!(QuotaError::InvalidKey.shortfall(), None);
    }

    #[test]
    fn service_unavailable_hides_cause_in_display() {
        let err = QuotaError::unavailable("storage error", anyhow::anyhow!("disk I/O error at page 7"));
        assert_eq!(err.to_string(), "service unavailable");
        assert_eq!(err.code(), "service_unavailable");
    }

    #[test]
    fn feature_denial_names_feature_and_tier() {
        let err = QuotaError::FeatureNotAvailable {
            feature: Feature::ChatAssistant,
            tier: Tier::Free,
        };
        assert_eq!(
            err.to_string(),
            "feature 'chat_assistant' is not available on the free tier"
        );
    }
}
