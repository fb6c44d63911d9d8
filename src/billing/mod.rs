//! Token purchases.
//!
//! ## Design
//! - Static package catalog priced in minor currency units
//! - Orders persisted as `created` and time-boxed; every other status is terminal
//! - Client callback and provider webhook share one completion path
//! - Credit, order status and transaction record commit in one SQLite transaction

pub mod catalog;
pub mod order;
pub mod provider;
pub mod reconciler;

pub use catalog::{find_package, Currency, TokenPackage, TOKEN_PACKAGES};
pub use order::{OrderStatus, PendingOrder, PurchaseTransaction};
pub use provider::{HttpPaymentProvider, PaymentProvider, ProviderOrder, ProviderPayment};
pub use reconciler::{CompletedPurchase, PurchaseReconciler, ReconcilerSettings, WebhookOutcome};
