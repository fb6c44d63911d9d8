//! Account tiers and the static policy table behind them.
//!
//! A tier decides three things: the daily free token allotment, how many
//! API keys an account may hold, and which metered features it may call.

use crate::error::{QuotaError, QuotaResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Service level of an account. Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Verified,
    Premium,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Verified, Tier::Premium];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Verified => "verified",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "free" => Ok(Self::Free),
            "verified" => Ok(Self::Verified),
            "premium" => Ok(Self::Premium),
            other => Err(QuotaError::UnknownTier(other.to_string())),
        }
    }
}

/// A metered, AI-backed feature that tiers can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ProfileAnalysis,
    RepoSummary,
    CodeReview,
    CareerAdvice,
    ChatAssistant,
}

impl Feature {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProfileAnalysis => "profile_analysis",
            Self::RepoSummary => "repo_summary",
            Self::CodeReview => "code_review",
            Self::CareerAdvice => "career_advice",
            Self::ChatAssistant => "chat_assistant",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "profile_analysis" => Ok(Self::ProfileAnalysis),
            "repo_summary" => Ok(Self::RepoSummary),
            "code_review" => Ok(Self::CodeReview),
            "career_advice" => Ok(Self::CareerAdvice),
            "chat_assistant" => Ok(Self::ChatAssistant),
            other => Err(QuotaError::InvalidInput(format!("unknown feature '{other}'"))),
        }
    }
}

/// What a tier grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Free tokens granted at every daily reset.
    pub daily_tokens: u64,
    /// Maximum number of active API keys.
    pub max_api_keys: u32,
    /// Enabled features.
    pub features: BTreeSet<Feature>,
}

/// Lookup table from tier to policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    policies: BTreeMap<Tier, TierPolicy>,
}

impl Default for TierTable {
    fn default() -> Self {
        use Feature::*;

        let free = TierPolicy {
            daily_tokens: 1_000,
            max_api_keys: 1,
            features: BTreeSet::from([ProfileAnalysis, RepoSummary]),
        };
        let verified = TierPolicy {
            daily_tokens: 2_500,
            max_api_keys: 3,
            features: BTreeSet::from([ProfileAnalysis, RepoSummary, CodeReview, CareerAdvice]),
        };
        let premium = TierPolicy {
            daily_tokens: 10_000,
            max_api_keys: 10,
            features: BTreeSet::from([
                ProfileAnalysis,
                RepoSummary,
                CodeReview,
                CareerAdvice,
                ChatAssistant,
            ]),
        };

        Self {
            policies: BTreeMap::from([
                (Tier::Free, free),
                (Tier::Verified, verified),
                (Tier::Premium, premium),
            ]),
        }
    }
}

impl TierTable {
    /// Build a table from explicit rows. Every tier must be present.
    pub fn from_policies(policies: BTreeMap<Tier, TierPolicy>) -> QuotaResult<Self> {
        for tier in Tier::ALL {
            if !policies.contains_key(&tier) {
                return Err(QuotaError::InvalidInput(format!(
                    "tier table is missing a policy for '{tier}'"
                )));
            }
        }
        Ok(Self { policies })
    }

    /// Apply config overrides keyed by tier name on top of the defaults.
    pub fn with_overrides(overrides: &BTreeMap<String, TierPolicy>) -> QuotaResult<Self> {
        let mut table = Self::default();
        for (name, policy) in overrides {
            let tier: Tier = name.parse()?;
            table.policies.insert(tier, policy.clone());
        }
        Ok(table)
    }

    /// Policy for a tier. A tier without a row is an error, never a default.
    pub fn resolve(&self, tier: Tier) -> QuotaResult<&TierPolicy> {
        self.policies
            .get(&tier)
            .ok_or_else(|| QuotaError::UnknownTier(tier.to_string()))
    }

    /// Whether the tier enables the feature.
    pub fn allows(&self, tier: Tier, feature: Feature) -> QuotaResult<bool> {
        Ok(self.resolve(tier)?.features.contains(&feature))
    }
}
