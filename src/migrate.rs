//! Legacy account import.
//!
//! Older deployments kept accounts as loosely-typed JSON documents and filled
//! missing fields with defaults on every read. This module converts those
//! documents once, up front: every default it fills in is logged, and a
//! document whose ledger fields are present but malformed is rejected rather
//! than guessed at.

use crate::error::QuotaError;
use crate::ledger::{Account, AccountLedger};
use crate::tier::Tier;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Summary of one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: usize,
    /// Documents whose account already exists.
    pub skipped_existing: usize,
    /// `(document index, reason)` for each rejected document.
    pub rejected: Vec<(usize, String)>,
    /// Number of fields filled with a default.
    pub backfilled_fields: usize,
}

/// Import a JSON file holding an array of legacy account documents.
pub fn import_legacy_file(ledger: &AccountLedger, path: &Path) -> anyhow::Result<ImportReport> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read legacy export {}", path.display()))?;
    let docs: Vec<Value> = serde_json::from_str(&contents)
        .with_context(|| format!("Legacy export {} is not a JSON array", path.display()))?;
    import_legacy(ledger, &docs, Utc::now())
}

pub fn import_legacy(
    ledger: &AccountLedger,
    docs: &[Value],
    now: DateTime<Utc>,
) -> anyhow::Result<ImportReport> {
    let mut report = ImportReport::default();

    for (index, doc) in docs.iter().enumerate() {
        let mut backfills = Vec::new();
        let account = match convert(ledger, doc, now, &mut backfills) {
            Ok(account) => account,
            Err(reason) => {
                tracing::warn!(index, %reason, "legacy document rejected");
                report.rejected.push((index, reason));
                continue;
            }
        };

        match ledger.store().insert_account(&account) {
            Ok(()) => {
                for field in &backfills {
                    tracing::info!(account = %account.id, field, "legacy field backfilled");
                }
                report.backfilled_fields += backfills.len();
                report.imported += 1;
            }
            Err(QuotaError::AccountExists) => {
                tracing::info!(account = %account.id, "legacy account already present, skipped");
                report.skipped_existing += 1;
            }
            Err(err) => return Err(err).context("Failed to write imported account"),
        }
    }

    tracing::info!(
        imported = report.imported,
        skipped = report.skipped_existing,
        rejected = report.rejected.len(),
        backfilled = report.backfilled_fields,
        "legacy import finished"
    );
    Ok(report)
}

/// Build a typed account from one document. `backfills` collects the names
/// of fields that were absent and defaulted.
fn convert(
    ledger: &AccountLedger,
    doc: &Value,
    now: DateTime<Utc>,
    backfills: &mut Vec<&'static str>,
) -> Result<Account, String> {
    let obj = doc.as_object().ok_or("document is not an object")?;

    let id = ["id", "userId", "uid"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or("document has no account id")?;

    let tier = match obj.get("tier") {
        None | Some(Value::Null) => {
            backfills.push("tier");
            Tier::Free
        }
        Some(Value::String(name)) => name.parse::<Tier>().map_err(|e| e.to_string())?,
        Some(other) => return Err(format!("tier has unexpected type: {other}")),
    };
    let policy = ledger.ledger().tiers().resolve(tier).map_err(|e| e.to_string())?;

    let last_daily_reset = match obj.get("lastDailyReset") {
        None | Some(Value::Null) => {
            backfills.push("lastDailyReset");
            now
        }
        Some(value) => parse_time(value).ok_or("lastDailyReset is not a timestamp")?,
    };

    let mut account = Account::new(id, tier, policy, now);
    account.last_daily_reset = last_daily_reset;
    account.usage.today.date = last_daily_reset.date_naive();

    let empty = Map::new();
    let balance = match obj.get("tokenBalance") {
        None | Some(Value::Null) => {
            backfills.push("tokenBalance");
            &empty
        }
        Some(Value::Object(balance)) => balance,
        Some(_) => return Err("tokenBalance is not an object".into()),
    };
    account.token_balance.daily =
        count(balance, "daily", "tokenBalance.daily", backfills)?.unwrap_or(policy.daily_tokens);
    account.token_balance.purchased =
        count(balance, "purchased", "tokenBalance.purchased", backfills)?.unwrap_or(0);

    if let Some(Value::Object(usage)) = obj.get("usage") {
        if let Some(Value::Object(lifetime)) = usage.get("lifetime") {
            account.usage.lifetime.tokens =
                count(lifetime, "tokens", "usage.lifetime.tokens", backfills)?.unwrap_or(0);
            account.usage.lifetime.requests =
                count(lifetime, "requests", "usage.lifetime.requests", backfills)?.unwrap_or(0);
        }
    }

    if let Some(created) = obj.get("createdAt").and_then(parse_time) {
        account.created_at = created;
    }
    Ok(account)
}

/// A non-negative integer field. `Ok(None)` when absent (recorded as a
/// backfill); `Err` when present but not a non-negative integer.
fn count(
    obj: &Map<String, Value>,
    key: &str,
    field: &'static str,
    backfills: &mut Vec<&'static str>,
) -> Result<Option<u64>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => {
            backfills.push(field);
            Ok(None)
        }
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("{field} must be a non-negative integer, got {value}")),
    }
}

/// RFC 3339 string or epoch milliseconds.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
