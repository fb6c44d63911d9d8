//! API key registry.
//!
//! Keys are opaque `tgk_`-prefixed random strings. Only their SHA-256 hash
//! is stored; the plaintext is handed to the caller once, at creation.

use crate::error::{QuotaError, QuotaResult};
use crate::ledger::AccountLedger;
use crate::store::Store;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Namespace tag on every issued key, for operator triage.
pub const KEY_PREFIX: &str = "tgk_";

/// Random bytes per key before hex encoding (32 bytes = 64 hex chars).
const KEY_BYTES: usize = 32;

/// Characters of the plaintext kept for display.
const DISPLAY_PREFIX_LEN: usize = 12;

const MAX_KEY_NAME_LEN: usize = 64;

/// Stored API key. Never contains the plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub account_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    /// Leading characters of the plaintext, safe to show.
    pub prefix: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

/// A freshly created key. `plaintext` is not recoverable afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedApiKey {
    #[serde(flatten)]
    pub record: ApiKeyRecord,
    #[serde(rename = "key")]
    pub plaintext: String,
}

/// Generate a key: `(plaintext, key_hash)`.
pub fn generate() -> (String, String) {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let plaintext = format!("{KEY_PREFIX}{}", hex::encode(bytes));
    let key_hash = hash_key(&plaintext);
    (plaintext, key_hash)
}

/// Hash a key (SHA-256, single pass; keys are already high-entropy).
pub fn hash_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Cheap shape check before touching storage.
fn looks_like_key(candidate: &str) -> bool {
    candidate
        .strip_prefix(KEY_PREFIX)
        .is_some_and(|rest| rest.len() == KEY_BYTES * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Issues, validates and revokes API keys.
#[derive(Clone)]
pub struct ApiKeyRegistry {
    store: Arc<Store>,
    ledger: AccountLedger,
}

impl ApiKeyRegistry {
    pub fn new(ledger: AccountLedger) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
        }
    }

    /// Create a key for `account_id`, bounded by the account's key limit.
    pub fn create(&self, account_id: &str, name: &str) -> QuotaResult<IssuedApiKey> {
        let name = name.trim();
        if name.is_empty() {
            return Err(QuotaError::InvalidInput("key name cannot be empty".into()));
        }
        if name.chars().count() > MAX_KEY_NAME_LEN {
            return Err(QuotaError::InvalidInput(format!(
                "key name too long (max {MAX_KEY_NAME_LEN} characters)"
            )));
        }

        let account = self.ledger.account(account_id)?;
        let (plaintext, key_hash) = generate();
        let record = ApiKeyRecord {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            name: name.to_string(),
            key_hash,
            prefix: plaintext[..DISPLAY_PREFIX_LEN].to_string(),
            is_active: true,
            created_at: Utc::now(),
            last_used: None,
        };

        if !self.store.insert_key_within_limit(&record, account.max_api_keys)? {
            tracing::warn!(
                account = %account.id,
                active = self.store.count_active_keys(&account.id)?,
                max = account.max_api_keys,
                "API key creation refused: limit reached"
            );
            return Err(QuotaError::KeyLimitExceeded {
                max: account.max_api_keys,
            });
        }

        tracing::info!(account = %account.id, key_id = %record.id, "API key created");
        Ok(IssuedApiKey { record, plaintext })
    }

    /// Resolve a plaintext key. `None` for malformed, unknown or inactive
    /// keys; the authorization decision stays with the caller.
    pub fn validate(&self, plaintext: &str) -> QuotaResult<Option<ApiKeyRecord>> {
        let candidate = plaintext.trim();
        if !looks_like_key(candidate) {
            return Ok(None);
        }
        self.store.touch_active_key(&hash_key(candidate), Utc::now())
    }

    /// Delete one of the account's keys.
    pub fn revoke(&self, account_id: &str, key_id: &str) -> QuotaResult<()> {
        if !self.store.delete_key(account_id, key_id)? {
            return Err(QuotaError::KeyNotFound);
        }
        tracing::info!(account = account_id, key_id, "API key revoked");
        Ok(())
    }

    pub fn list(&self, account_id: &str) -> QuotaResult<Vec<ApiKeyRecord>> {
        self.store.list_keys(account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::test_store;
    use crate::tier::{Tier, TierTable};

    fn registry() -> (tempfile::TempDir, ApiKeyRegistry, AccountLedger) {
        let (tmp, store) = test_store();
        let ledger = AccountLedger::new(Arc::new(store), Arc::new(TierTable::default()));
        (tmp, ApiKeyRegistry::new(ledger.clone()), ledger)
    }

    #[test]
    fn generated_key_has_prefix_and_matching_hash() {
        let (plaintext, key_hash) = generate();
        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + 64);
        assert_eq!(hash_key(&plaintext), key_hash);
        assert!(looks_like_key(&plaintext));
    }

    #[test]
    fn generated_keys_are_unique() {
        let (a, _) = generate();
        let (b, _) = generate();
        assert_ne!(a, b);
    }

    #[test]
    fn create_then_validate() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();

        let issued = registry.create("acc_1", "laptop").unwrap();
        assert_ne!(issued.record.key_hash, issued.plaintext);

        let record = registry.validate(&issued.plaintext).unwrap().unwrap();
        assert_eq!(record.account_id, "acc_1");
        assert!(record.last_used.is_some());
    }

    #[test]
    fn issued_key_serialization_hides_hash() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();

        let issued = registry.create("acc_1", "laptop").unwrap();
        let json = serde_json::to_value(&issued).unwrap();
        assert_eq!(json["key"], issued.plaintext.as_str());
        assert!(json.get("keyHash").is_none());
        assert_eq!(json["accountId"], "acc_1");
    }

    #[test]
    fn key_limit_exceeded_creates_nothing() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();

        registry.create("acc_1", "first").unwrap();
        let err = registry.create("acc_1", "second").unwrap_err();
        assert!(matches!(err, QuotaError::KeyLimitExceeded { max: 1 }));
        assert_eq!(registry.list("acc_1").unwrap().len(), 1);
    }

    #[test]
    fn revoke_frees_a_slot() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();

        let issued = registry.create("acc_1", "first").unwrap();
        registry.revoke("acc_1", &issued.record.id).unwrap();
        assert!(registry.validate(&issued.plaintext).unwrap().is_none());
        registry.create("acc_1", "second").unwrap();
    }

    #[test]
    fn revoke_foreign_key_is_not_found() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();
        ledger.open_account("acc_2", Tier::Free).unwrap();

        let issued = registry.create("acc_1", "first").unwrap();
        assert!(matches!(
            registry.revoke("acc_2", &issued.record.id),
            Err(QuotaError::KeyNotFound)
        ));
        assert!(registry.validate(&issued.plaintext).unwrap().is_some());
    }

    #[test]
    fn validate_rejects_garbage_without_error() {
        let (_tmp, registry, _ledger) = registry();
        assert!(registry.validate("").unwrap().is_none());
        assert!(registry.validate("not-a-key").unwrap().is_none());
        let (unknown, _) = generate();
        assert!(registry.validate(&unknown).unwrap().is_none());
    }

    #[test]
    fn create_for_missing_account_fails() {
        let (_tmp, registry, _ledger) = registry();
        assert!(matches!(
            registry.create("ghost", "key"),
            Err(QuotaError::AccountNotFound)
        ));
    }

    #[test]
    fn create_rejects_blank_name() {
        let (_tmp, registry, ledger) = registry();
        ledger.open_account("acc_1", Tier::Free).unwrap();
        assert!(matches!(
            registry.create("acc_1", "  "),
            Err(QuotaError::InvalidInput(_))
        ));
    }
}
