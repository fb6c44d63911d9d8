//! Process configuration: a TOML file with per-field defaults, plus
//! environment overrides for secrets.

use crate::cost::{CostTable, EndpointCost};
use crate::tier::{TierPolicy, TierTable};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "TOKENGATE_CONFIG";
pub const ADMIN_TOKEN_ENV: &str = "TOKENGATE_ADMIN_TOKEN";
pub const PAYMENT_KEY_SECRET_ENV: &str = "TOKENGATE_PAYMENT_KEY_SECRET";
pub const PAYMENT_WEBHOOK_SECRET_ENV: &str = "TOKENGATE_PAYMENT_WEBHOOK_SECRET";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
    /// Overrides keyed by tier name (`free`, `verified`, `premium`).
    #[serde(default)]
    pub tiers: BTreeMap<String, TierPolicy>,
    /// Overrides keyed by endpoint name.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointCost>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token for the admin routes. Admin routes reject every request
    /// when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8787
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `<data_dir>/tokengate/tokengate.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_db_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.db_path {
            return Ok(path.clone());
        }
        let dirs = directories::ProjectDirs::from("dev", "tokengate", "tokengate")
            .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory"))?;
        Ok(dirs.data_dir().join("tokengate.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_payment_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_secret: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_order_ttl_minutes")]
    pub order_ttl_minutes: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_payment_base_url() -> String {
    "https://api.payments.example".into()
}

fn default_order_ttl_minutes() -> u64 {
    20
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_payment_base_url(),
            key_id: String::new(),
            key_secret: None,
            webhook_secret: None,
            order_ttl_minutes: default_order_ttl_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load from `explicit`, else `$TOKENGATE_CONFIG`, else the platform
    /// config dir. A missing default file yields defaults; a missing explicit
    /// file is an error.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let (path, required) = match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => (Some(path), true),
            None => (default_config_path(), false),
        };

        let mut config = match path {
            Some(path) if path.exists() || required => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(token) = env_secret(ADMIN_TOKEN_ENV) {
            self.gateway.admin_token = Some(token);
        }
        if let Some(secret) = env_secret(PAYMENT_KEY_SECRET_ENV) {
            self.payment.key_secret = Some(secret);
        }
        if let Some(secret) = env_secret(PAYMENT_WEBHOOK_SECRET_ENV) {
            self.payment.webhook_secret = Some(secret);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.tier_table().context("Invalid [tiers] section")?;
        self.cost_table().context("Invalid [endpoints] section")?;

        if self.gateway.request_timeout_secs == 0 {
            anyhow::bail!("gateway.request_timeout_secs must be greater than zero");
        }
        if self.payment.order_ttl_minutes == 0 {
            anyhow::bail!("payment.order_ttl_minutes must be greater than zero");
        }
        if self.payment.sweep_interval_secs == 0 {
            anyhow::bail!("payment.sweep_interval_secs must be greater than zero");
        }
        if self.payment.enabled {
            if self.payment.key_id.trim().is_empty() {
                anyhow::bail!("payment.key_id is required when payments are enabled");
            }
            if is_blank(self.payment.key_secret.as_deref()) {
                anyhow::bail!(
                    "payment.key_secret (or {PAYMENT_KEY_SECRET_ENV}) is required when payments are enabled"
                );
            }
            if is_blank(self.payment.webhook_secret.as_deref()) {
                anyhow::bail!(
                    "payment.webhook_secret (or {PAYMENT_WEBHOOK_SECRET_ENV}) is required when payments are enabled"
                );
            }
        }
        Ok(())
    }

    pub fn tier_table(&self) -> anyhow::Result<TierTable> {
        Ok(TierTable::with_overrides(&self.tiers)?)
    }

    pub fn cost_table(&self) -> anyhow::Result<CostTable> {
        Ok(CostTable::with_overrides(&self.endpoints)?)
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "tokengate", "tokengate")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn env_secret(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{Feature, Tier};
    use tempfile::TempDir;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.gateway.port, 8787);
        assert_eq!(config.payment.order_ttl_minutes, 20);
        assert_eq!(config.payment.sweep_interval_secs, 300);
        assert_eq!(config.logging.filter, "info");
        assert!(!config.payment.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn tier_and_endpoint_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [tiers.free]
            daily_tokens = 2000
            max_api_keys = 2
            features = ["profile_analysis"]

            [endpoints.repo-summary]
            feature = "repo_summary"
            min = 10
            max = 90
            average = 50
            "#,
        )
        .unwrap();

        let tiers = config.tier_table().unwrap();
        let free = tiers.resolve(Tier::Free).unwrap();
        assert_eq!(free.daily_tokens, 2_000);
        assert!(!tiers.allows(Tier::Free, Feature::RepoSummary).unwrap());
        assert_eq!(tiers.resolve(Tier::Premium).unwrap().daily_tokens, 10_000);

        let costs = config.cost_table().unwrap();
        assert_eq!(costs.estimate("repo-summary", 1).unwrap(), 50);
    }

    #[test]
    fn unknown_tier_section_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [tiers.gold]
            daily_tokens = 1
            max_api_keys = 1
            features = []
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn inconsistent_cost_row_is_rejected() {
        let config: Config = toml::from_str(
            r#"
            [endpoints.code-review]
            feature = "code_review"
            min = 500
            max = 400
            average = 450
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_order_ttl_is_rejected() {
        let mut config = Config::default();
        config.payment.order_ttl_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn enabled_payment_requires_secrets() {
        let mut config = Config::default();
        config.payment.enabled = true;
        config.payment.key_id = "key_123".into();
        assert!(config.validate().is_err());

        config.payment.key_secret = Some("secret".into());
        assert!(config.validate().is_err());

        config.payment.webhook_secret = Some("whsec".into());
        config.validate().unwrap();
    }

    #[test]
    fn from_file_reads_toml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[gateway]\nport = 9000\n\n[storage]\ndb_path = \"/tmp/tg.db\"\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(
            config.storage.resolved_db_path().unwrap(),
            PathBuf::from("/tmp/tg.db")
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(Config::load(Some(&tmp.path().join("absent.toml"))).is_err());
    }
}
