//! Token packages available for purchase.

use crate::error::{QuotaError, QuotaResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Settlement currency. Prices are kept in minor units (cents, paise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Currency {
    Usd,
    Inr,
    Eur,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Inr => "inr",
            Self::Eur => "eur",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "usd" => Ok(Self::Usd),
            "inr" => Ok(Self::Inr),
            "eur" => Ok(Self::Eur),
            other => Err(QuotaError::InvalidInput(format!("unknown currency '{other}'"))),
        }
    }
}

/// Predefined token package.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPackage {
    /// Package identifier.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Base tokens granted.
    pub tokens: u64,
    /// Promotional tokens granted on top of the base.
    pub bonus: u64,
    /// Price per currency in minor units.
    pub prices: &'static [(Currency, u64)],
}

impl TokenPackage {
    /// Tokens credited on purchase.
    pub fn total_tokens(&self) -> u64 {
        self.tokens.saturating_add(self.bonus)
    }

    pub fn price_in(&self, currency: Currency) -> QuotaResult<u64> {
        self.prices
            .iter()
            .find(|(c, _)| *c == currency)
            .map(|(_, amount)| *amount)
            .ok_or_else(|| QuotaError::UnsupportedCurrency {
                package: self.id.to_string(),
                currency: currency.to_string(),
            })
    }
}

/// Available token packages.
pub const TOKEN_PACKAGES: &[TokenPackage] = &[
    TokenPackage {
        id: "starter",
        name: "Starter",
        tokens: 5_000,
        bonus: 0,
        prices: &[(Currency::Usd, 900), (Currency::Inr, 49_900), (Currency::Eur, 900)],
    },
    TokenPackage {
        id: "builder",
        name: "Builder",
        tokens: 15_000,
        bonus: 1_500,
        prices: &[(Currency::Usd, 2_400), (Currency::Inr, 149_900), (Currency::Eur, 2_200)],
    },
    TokenPackage {
        id: "team",
        name: "Team",
        tokens: 50_000,
        bonus: 10_000,
        prices: &[(Currency::Usd, 6_900), (Currency::Inr, 449_900)],
    },
];

/// Look up a token package by ID.
pub fn find_package(package_id: &str) -> QuotaResult<&'static TokenPackage> {
    TOKEN_PACKAGES
        .iter()
        .find(|p| p.id == package_id)
        .ok_or_else(|| QuotaError::UnknownPackage(package_id.to_string()))
}
