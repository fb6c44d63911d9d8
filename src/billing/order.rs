//! Purchase order and transaction records.

use super::catalog::Currency;
use crate::error::QuotaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a purchase order. `Created` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Completed,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = QuotaError;

    // Unknown statuses are an error; defaulting one to `created` would make a
    // settled order creditable again.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "expired" => Ok(Self::Expired),
            other => Err(QuotaError::InvalidInput(format!("unknown order status '{other}'"))),
        }
    }
}

/// A purchase order awaiting (or past) payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    /// Provider-assigned order ID.
    pub order_id: String,
    pub account_id: String,
    pub package_id: String,
    /// Tokens (base + bonus) credited on completion, fixed at creation.
    pub tokens: u64,
    pub amount_minor: u64,
    pub currency: Currency,
    pub status: OrderStatus,
    /// Provider payment ID, set on completion.
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingOrder {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Immutable record of a credited purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseTransaction {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    pub payment_id: String,
    pub package_id: String,
    pub tokens: u64,
    pub amount_minor: u64,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}
