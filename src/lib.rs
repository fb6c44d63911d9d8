pub mod billing;
pub mod config;
pub mod cost;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod keys;
pub mod ledger;
pub mod migrate;
pub mod settlement;
pub mod store;
pub mod tier;

pub use config::Config;
pub use error::{QuotaError, QuotaResult};
pub use gate::{Authorization, AuthorizationGate, GateRequest};
pub use keys::ApiKeyRegistry;
pub use ledger::{Account, AccountLedger, UsageReport};
pub use settlement::{Settlement, SettlementOutcome};
pub use store::Store;
pub use tier::{Feature, Tier, TierTable};
