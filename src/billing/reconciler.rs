//! Purchase reconciliation: order creation, payment verification and the
//! exactly-once credit of purchased tokens.
//!
//! The client callback and the provider webhook both end in
//! [`PurchaseReconciler::complete`], so an order is credited by whichever
//! arrives first and rejected as already processed for the other.

use super::catalog::{find_package, Currency};
use super::order::{OrderStatus, PendingOrder, PurchaseTransaction};
use super::provider::{verify_payment_signature, verify_webhook_signature, PaymentProvider};
use crate::error::{QuotaError, QuotaResult};
use crate::ledger::service::{contention, MAX_CAS_ATTEMPTS};
use crate::ledger::{Account, AccountLedger};
use crate::store::{PurchaseWrite, Store};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Secrets and timing for the purchase flow.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Signs the client callback (`"{order_id}|{payment_id}"`).
    pub key_secret: String,
    /// Signs webhook bodies.
    pub webhook_secret: String,
    pub order_ttl: Duration,
}

/// A credited purchase.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPurchase {
    pub account: Account,
    pub transaction: PurchaseTransaction,
}

/// What a webhook delivery did.
#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Completed(CompletedPurchase),
    Failed { order_id: String },
    /// Event type this service does not act on.
    Ignored { event: String },
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    event: String,
    payload: WebhookPayload,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    order_id: String,
    #[serde(default)]
    payment_id: Option<String>,
}

pub struct PurchaseReconciler {
    store: Arc<Store>,
    ledger: AccountLedger,
    provider: Arc<dyn PaymentProvider>,
    settings: ReconcilerSettings,
}

impl PurchaseReconciler {
    pub fn new(
        ledger: AccountLedger,
        provider: Arc<dyn PaymentProvider>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
            provider,
            settings,
        }
    }

    /// Register an order with the provider and persist it as `created`.
    pub async fn create_order(
        &self,
        account_id: &str,
        package_id: &str,
        currency: Currency,
    ) -> QuotaResult<PendingOrder> {
        let account = self.ledger.account(account_id)?;
        let package = find_package(package_id)?;
        let amount_minor = package.price_in(currency)?;

        let receipt = uuid::Uuid::new_v4().to_string();
        let remote = self
            .provider
            .create_order(amount_minor, currency, &receipt)
            .await
            .map_err(|e| QuotaError::unavailable("payment provider order creation", e))?;
        if remote.amount != amount_minor || !remote.currency.eq_ignore_ascii_case(currency.as_str())
        {
            return Err(QuotaError::unavailable(
                "payment provider order creation",
                anyhow::anyhow!(
                    "provider order {} is {} {}, expected {amount_minor} {currency}",
                    remote.id,
                    remote.amount,
                    remote.currency
                ),
            ));
        }

        let now = Utc::now();
        let order = PendingOrder {
            order_id: remote.id,
            account_id: account.id,
            package_id: package.id.to_string(),
            tokens: package.total_tokens(),
            amount_minor,
            currency,
            status: OrderStatus::Created,
            payment_id: None,
            created_at: now,
            expires_at: now + self.settings.order_ttl,
            updated_at: now,
        };
        self.store.insert_order(&order)?;
        tracing::info!(
            account = %order.account_id,
            order_id = %order.order_id,
            package = package.id,
            amount_minor,
            %currency,
            "purchase order created"
        );
        Ok(order)
    }

    /// Client callback after checkout. The order must belong to `account_id`.
    pub async fn verify_and_complete(
        &self,
        account_id: &str,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> QuotaResult<CompletedPurchase> {
        if !verify_payment_signature(&self.settings.key_secret, order_id, payment_id, signature) {
            tracing::warn!(order_id, payment_id, "payment signature mismatch");
            return Err(QuotaError::InvalidSignature);
        }
        self.complete(order_id, payment_id, Some(account_id)).await
    }

    /// Provider webhook. `raw_body` must be the exact bytes that were signed.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> QuotaResult<WebhookOutcome> {
        let Some(signature) = signature_header else {
            tracing::warn!("webhook without signature header");
            return Err(QuotaError::InvalidSignature);
        };
        if !verify_webhook_signature(&self.settings.webhook_secret, raw_body, signature) {
            tracing::warn!("webhook signature mismatch");
            return Err(QuotaError::InvalidSignature);
        }

        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|e| QuotaError::InvalidInput(format!("malformed webhook body: {e}")))?;
        tracing::info!(event = %event.event, order_id = %event.payload.order_id, "webhook received");

        match event.event.as_str() {
            "payment.captured" | "order.paid" => {
                let Some(payment_id) = event.payload.payment_id.as_deref() else {
                    return Err(QuotaError::InvalidInput(
                        "webhook payload is missing payment_id".into(),
                    ));
                };
                self.complete(&event.payload.order_id, payment_id, None)
                    .await
                    .map(WebhookOutcome::Completed)
            }
            "payment.failed" => {
                let order_id = event.payload.order_id;
                if !self.store.close_order(&order_id, OrderStatus::Failed)? {
                    return match self.store.get_order(&order_id)? {
                        Some(_) => Err(QuotaError::OrderAlreadyProcessed),
                        None => Err(QuotaError::OrderNotFound),
                    };
                }
                tracing::info!(order_id = %order_id, "purchase order failed");
                Ok(WebhookOutcome::Failed { order_id })
            }
            _ => Ok(WebhookOutcome::Ignored { event: event.event }),
        }
    }

    /// Close an overdue order as `expired` and report the denial. An order
    /// another path closed first reads as already processed.
    fn expire_order(&self, order_id: &str) -> QuotaResult<QuotaError> {
        if !self.store.close_order(order_id, OrderStatus::Expired)? {
            tracing::info!(order_id, "order closed before expiry");
            return Ok(QuotaError::OrderAlreadyProcessed);
        }
        tracing::warn!(order_id, "verification after order expiry");
        Ok(QuotaError::OrderExpired)
    }

    /// Shared completion path. `owner` restricts the order to one account.
    async fn complete(
        &self,
        order_id: &str,
        payment_id: &str,
        owner: Option<&str>,
    ) -> QuotaResult<CompletedPurchase> {
        let order = self
            .store
            .get_order(order_id)?
            .filter(|order| owner.is_none_or(|owner| owner == order.account_id))
            .ok_or(QuotaError::OrderNotFound)?;

        if order.status != OrderStatus::Created {
            tracing::info!(order_id, status = %order.status, "order already processed");
            return Err(QuotaError::OrderAlreadyProcessed);
        }
        if order.is_expired_at(Utc::now()) {
            return Err(self.expire_order(order_id)?);
        }

        let payment = self
            .provider
            .fetch_payment(payment_id)
            .await
            .map_err(|e| QuotaError::unavailable("payment provider lookup", e))?;
        if !payment.is_captured_for(&order) {
            tracing::warn!(
                order_id,
                payment_id,
                status = %payment.status,
                "payment not captured for order"
            );
            return Err(QuotaError::PaymentNotCaptured);
        }

        let package = find_package(&order.package_id)?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let account = self.ledger.account(&order.account_id)?;
            let next = self
                .ledger
                .ledger()
                .add_purchased_tokens(&account, package, payment_id)?;
            let transaction = PurchaseTransaction {
                id: uuid::Uuid::new_v4().to_string(),
                order_id: order.order_id.clone(),
                account_id: order.account_id.clone(),
                payment_id: payment_id.to_string(),
                package_id: order.package_id.clone(),
                tokens: order.tokens,
                amount_minor: order.amount_minor,
                currency: order.currency,
                created_at: Utc::now(),
            };

            match self.store.commit_purchase(
                order_id,
                payment_id,
                account.version,
                &next,
                &transaction,
            )? {
                PurchaseWrite::Applied {
                    account,
                    transaction,
                } => {
                    tracing::info!(
                        account = %account.id,
                        order_id,
                        payment_id,
                        tokens = transaction.tokens,
                        tier = %account.tier,
                        "purchase credited"
                    );
                    return Ok(CompletedPurchase {
                        account,
                        transaction,
                    });
                }
                PurchaseWrite::OrderNotCreated => return Err(QuotaError::OrderAlreadyProcessed),
                PurchaseWrite::AccountConflict => {
                    tracing::debug!(order_id, "purchase credit lost a race, retrying");
                }
            }
        }
        Err(contention(&order.account_id))
    }

    /// Mark overdue `created` orders as `expired`.
    pub fn expire_stale_orders(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        let expired = self.store.expire_stale_orders(now)?;
        if expired > 0 {
            tracing::info!(expired, "stale purchase orders expired");
        }
        Ok(expired)
    }

    /// An order, visible only to its owner.
    pub fn order(&self, account_id: &str, order_id: &str) -> QuotaResult<PendingOrder> {
        self.store
            .get_order(order_id)?
            .filter(|order| order.account_id == account_id)
            .ok_or(QuotaError::OrderNotFound)
    }

    pub fn transactions(&self, account_id: &str, limit: usize) -> QuotaResult<Vec<PurchaseTransaction>> {
        self.store.list_transactions(account_id, limit)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;
    use crate::billing::provider::{payment_signature, sign};
    use crate::store::testutil::test_store;
    use crate::tier::{Tier, TierTable};
    use std::sync::atomic::Ordering;

    const KEY_SECRET: &str = "key-secret";
    const WEBHOOK_SECRET: &str = "webhook-secret";

    struct Fixture {
        _tmp: tempfile::TempDir,
        reconciler: PurchaseReconciler,
        ledger: AccountLedger,
        provider: Arc<MockProvider>,
    }

    fn fixture() -> Fixture {
        let (tmp, store) = test_store();
        let ledger = AccountLedger::new(Arc::new(store), Arc::new(TierTable::default()));
        let provider = Arc::new(MockProvider::default());
        let reconciler = PurchaseReconciler::new(
            ledger.clone(),
            provider.clone(),
            ReconcilerSettings {
                key_secret: KEY_SECRET.into(),
                webhook_secret: WEBHOOK_SECRET.into(),
                order_ttl: Duration::minutes(20),
            },
        );
        ledger.open_account("acc_1", Tier::Free).unwrap();
        Fixture {
            _tmp: tmp,
            reconciler,
            ledger,
            provider,
        }
    }

    fn webhook(event: &str, order_id: &str, payment_id: &str) -> (Vec<u8>, String) {
        let body = serde_json::json!({
            "event": event,
            "payload": { "order_id": order_id, "payment_id": payment_id }
        })
        .to_string()
        .into_bytes();
        let signature = sign(WEBHOOK_SECRET, &body);
        (body, signature)
    }

    #[tokio::test]
    async fn create_order_prices_package() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "builder", Currency::Inr)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.tokens, 16_500);
        assert_eq!(order.amount_minor, 149_900);
        assert_eq!(order.expires_at - order.created_at, Duration::minutes(20));
        let stored = f.reconciler.order("acc_1", &order.order_id).unwrap();
        assert_eq!(stored.package_id, "builder");
        assert_eq!(stored.currency, Currency::Inr);
    }

    #[tokio::test]
    async fn create_order_rejects_unknown_package_and_currency() {
        let f = fixture();
        assert!(matches!(
            f.reconciler.create_order("acc_1", "mega", Currency::Usd).await,
            Err(QuotaError::UnknownPackage(_))
        ));
        assert!(matches!(
            f.reconciler.create_order("acc_1", "team", Currency::Eur).await,
            Err(QuotaError::UnsupportedCurrency { .. })
        ));
    }

    #[tokio::test]
    async fn verify_credits_purchase_and_promotes() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");

        let sig = payment_signature(KEY_SECRET, &order.order_id, "pay_1");
        let done = f
            .reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", &sig)
            .await
            .unwrap();

        assert_eq!(done.account.token_balance.purchased, 5_000);
        assert_eq!(done.account.total_tokens(), 6_000);
        assert_eq!(done.account.tier, Tier::Premium);
        assert_eq!(done.transaction.tokens, 5_000);
        assert_eq!(
            f.reconciler.order("acc_1", &order.order_id).unwrap().status,
            OrderStatus::Completed
        );
        assert_eq!(f.reconciler.transactions("acc_1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_verification_is_already_processed() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");
        let sig = payment_signature(KEY_SECRET, &order.order_id, "pay_1");

        f.reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", &sig)
            .await
            .unwrap();
        let err = f
            .reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::OrderAlreadyProcessed));
        assert_eq!(f.ledger.account("acc_1").unwrap().token_balance.purchased, 5_000);
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_before_lookup() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");

        let err = f
            .reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", "deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::InvalidSignature));
        assert_eq!(f.provider.lookups.load(Ordering::SeqCst), 0);
        assert_eq!(f.ledger.account("acc_1").unwrap().token_balance.purchased, 0);
    }

    #[tokio::test]
    async fn foreign_order_is_not_found() {
        let f = fixture();
        f.ledger.open_account("acc_2", Tier::Free).unwrap();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");
        let sig = payment_signature(KEY_SECRET, &order.order_id, "pay_1");

        let err = f
            .reconciler
            .verify_and_complete("acc_2", &order.order_id, "pay_1", &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::OrderNotFound));
    }

    #[tokio::test]
    async fn expired_order_fails_closed() {
        let f = fixture();
        let past = Utc::now() - Duration::hours(1);
        let order = PendingOrder {
            order_id: "order_old".into(),
            account_id: "acc_1".into(),
            package_id: "starter".into(),
            tokens: 5_000,
            amount_minor: 900,
            currency: Currency::Usd,
            status: OrderStatus::Created,
            payment_id: None,
            created_at: past - Duration::minutes(20),
            expires_at: past,
            updated_at: past,
        };
        f.ledger.store().insert_order(&order).unwrap();
        f.provider.capture(&order, "pay_1");
        let sig = payment_signature(KEY_SECRET, "order_old", "pay_1");

        let err = f
            .reconciler
            .verify_and_complete("acc_1", "order_old", "pay_1", &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::OrderExpired));
        assert_eq!(
            f.reconciler.order("acc_1", "order_old").unwrap().status,
            OrderStatus::Expired
        );
        assert_eq!(f.ledger.account("acc_1").unwrap().token_balance.purchased, 0);
    }

    #[tokio::test]
    async fn uncaptured_payment_is_rejected() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.stage(&order, "pay_1", "authorized");
        let sig = payment_signature(KEY_SECRET, &order.order_id, "pay_1");

        let err = f
            .reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", &sig)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::PaymentNotCaptured));
        assert_eq!(
            f.reconciler.order("acc_1", &order.order_id).unwrap().status,
            OrderStatus::Created
        );
    }

    #[tokio::test]
    async fn duplicate_webhook_credits_once() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");
        let (body, sig) = webhook("payment.captured", &order.order_id, "pay_1");

        let first = f.reconciler.handle_webhook(&body, Some(&sig)).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Completed(_)));

        let second = f.reconciler.handle_webhook(&body, Some(&sig)).await.unwrap_err();
        assert!(matches!(second, QuotaError::OrderAlreadyProcessed));

        let account = f.ledger.account("acc_1").unwrap();
        assert_eq!(account.token_balance.purchased, 5_000);
        assert_eq!(f.reconciler.transactions("acc_1", 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn webhook_then_client_callback_credits_once() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        f.provider.capture(&order, "pay_1");
        let (body, sig) = webhook("order.paid", &order.order_id, "pay_1");
        f.reconciler.handle_webhook(&body, Some(&sig)).await.unwrap();

        let client_sig = payment_signature(KEY_SECRET, &order.order_id, "pay_1");
        let err = f
            .reconciler
            .verify_and_complete("acc_1", &order.order_id, "pay_1", &client_sig)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::OrderAlreadyProcessed));
        assert_eq!(f.ledger.account("acc_1").unwrap().token_balance.purchased, 5_000);
    }

    #[tokio::test]
    async fn webhook_signature_is_required() {
        let f = fixture();
        let (body, _) = webhook("payment.captured", "order_1", "pay_1");
        assert!(matches!(
            f.reconciler.handle_webhook(&body, None).await,
            Err(QuotaError::InvalidSignature)
        ));
        let forged = sign("wrong-secret", &body);
        assert!(matches!(
            f.reconciler.handle_webhook(&body, Some(&forged)).await,
            Err(QuotaError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn failed_payment_closes_order() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        let (body, sig) = webhook("payment.failed", &order.order_id, "pay_1");

        let outcome = f.reconciler.handle_webhook(&body, Some(&sig)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Failed { .. }));
        assert_eq!(
            f.reconciler.order("acc_1", &order.order_id).unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_webhook_event_is_ignored() {
        let f = fixture();
        let (body, sig) = webhook("refund.created", "order_1", "pay_1");
        let outcome = f.reconciler.handle_webhook(&body, Some(&sig)).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
    }

    #[tokio::test]
    async fn expiry_of_a_completed_order_reports_already_processed() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();

        assert!(f
            .ledger
            .store()
            .close_order(&order.order_id, OrderStatus::Completed)
            .unwrap());
        let err = f.reconciler.expire_order(&order.order_id).unwrap();
        assert!(matches!(err, QuotaError::OrderAlreadyProcessed));
        assert_eq!(
            f.reconciler.order("acc_1", &order.order_id).unwrap().status,
            OrderStatus::Completed
        );

        let fresh = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();
        let err = f.reconciler.expire_order(&fresh.order_id).unwrap();
        assert!(matches!(err, QuotaError::OrderExpired));
        assert_eq!(
            f.reconciler.order("acc_1", &fresh.order_id).unwrap().status,
            OrderStatus::Expired
        );
    }

    #[tokio::test]
    async fn sweep_expires_overdue_orders() {
        let f = fixture();
        let order = f
            .reconciler
            .create_order("acc_1", "starter", Currency::Usd)
            .await
            .unwrap();

        assert_eq!(f.reconciler.expire_stale_orders(Utc::now()).unwrap(), 0);
        let later = order.expires_at + Duration::seconds(1);
        assert_eq!(f.reconciler.expire_stale_orders(later).unwrap(), 1);
        assert_eq!(
            f.reconciler.order("acc_1", &order.order_id).unwrap().status,
            OrderStatus::Expired
        );
    }
}
