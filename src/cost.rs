//! Per-endpoint pre-flight token estimates.

use crate::error::{QuotaError, QuotaResult};
use crate::tier::Feature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observed token cost range of one metered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointCost {
    /// Feature the endpoint belongs to.
    pub feature: Feature,
    pub min: u64,
    pub max: u64,
    pub average: u64,
}

impl EndpointCost {
    fn validate(&self, endpoint: &str) -> QuotaResult<()> {
        if self.min > self.average || self.average > self.max {
            return Err(QuotaError::InvalidInput(format!(
                "endpoint '{endpoint}' cost must satisfy min <= average <= max \
                 (got {} / {} / {})",
                self.min, self.average, self.max
            )));
        }
        Ok(())
    }
}

/// Static `{endpoint -> cost}` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTable {
    endpoints: BTreeMap<String, EndpointCost>,
}

fn row(feature: Feature, min: u64, max: u64, average: u64) -> EndpointCost {
    EndpointCost {
        feature,
        min,
        max,
        average,
    }
}

impl Default for CostTable {
    fn default() -> Self {
        let endpoints = BTreeMap::from([
            ("profile-analysis".to_string(), row(Feature::ProfileAnalysis, 200, 800, 400)),
            ("repo-summary".to_string(), row(Feature::RepoSummary, 100, 600, 300)),
            ("code-review".to_string(), row(Feature::CodeReview, 500, 3_000, 1_500)),
            ("career-advice".to_string(), row(Feature::CareerAdvice, 300, 1_200, 600)),
            ("chat-message".to_string(), row(Feature::ChatAssistant, 50, 400, 150)),
        ]);
        Self { endpoints }
    }
}

impl CostTable {
    /// Defaults plus config overrides; every row is range-checked.
    pub fn with_overrides(overrides: &BTreeMap<String, EndpointCost>) -> QuotaResult<Self> {
        let mut table = Self::default();
        for (endpoint, cost) in overrides {
            table.endpoints.insert(endpoint.clone(), cost.clone());
        }
        for (endpoint, cost) in &table.endpoints {
            cost.validate(endpoint)?;
        }
        Ok(table)
    }

    pub fn get(&self, endpoint: &str) -> QuotaResult<&EndpointCost> {
        self.endpoints
            .get(endpoint)
            .ok_or_else(|| QuotaError::UnknownEndpoint(endpoint.to_string()))
    }

    /// Pre-flight estimate: the endpoint's average times the number of calls
    /// the operation will make (at least one).
    pub fn estimate(&self, endpoint: &str, multiplier: u32) -> QuotaResult<u64> {
        let cost = self.get(endpoint)?;
        Ok(cost.average.saturating_mul(u64::from(multiplier.max(1))))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EndpointCost)> {
        self.endpoints.iter().map(|(k, v)| (k.as_str(), v))
    }
}
