//! Payment provider client and signature checks.

use super::catalog::Currency;
use super::order::PendingOrder;
use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const PROVIDER_TIMEOUT_SECS: u64 = 15;

/// Order as created on the provider side.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderOrder {
    pub id: String,
    /// Minor currency units.
    pub amount: u64,
    pub currency: String,
}

/// Payment as reported by the provider's capture lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderPayment {
    pub id: String,
    pub order_id: String,
    pub status: String,
    pub amount: u64,
    pub currency: String,
}

impl ProviderPayment {
    /// Whether this payment settles `order` in full.
    pub fn is_captured_for(&self, order: &PendingOrder) -> bool {
        self.status == "captured"
            && self.order_id == order.order_id
            && self.amount == order.amount_minor
            && self.currency.eq_ignore_ascii_case(order.currency.as_str())
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Register an order for `amount_minor` with the provider.
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: Currency,
        receipt: &str,
    ) -> anyhow::Result<ProviderOrder>;

    /// Look up a payment by its provider ID.
    async fn fetch_payment(&self, payment_id: &str) -> anyhow::Result<ProviderPayment>;
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount: u64,
    currency: &'a str,
    receipt: &'a str,
}

/// REST client for the provider API.
pub struct HttpPaymentProvider {
    base_url: String,
    key_id: String,
    key_secret: String,
    http: reqwest::Client,
}

impl HttpPaymentProvider {
    pub fn new(base_url: &str, key_id: &str, key_secret: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(PROVIDER_TIMEOUT_SECS))
            .build()
            .context("failed to build payment provider HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            key_id: key_id.to_string(),
            key_secret: key_secret.to_string(),
            http,
        })
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_order(
        &self,
        amount_minor: u64,
        currency: Currency,
        receipt: &str,
    ) -> anyhow::Result<ProviderOrder> {
        let resp = self
            .http
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&CreateOrderRequest {
                amount: amount_minor,
                currency: currency.as_str(),
                receipt,
            })
            .send()
            .await
            .context("order request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider rejected order ({status}): {body}");
        }
        resp.json().await.context("malformed provider order")
    }

    async fn fetch_payment(&self, payment_id: &str) -> anyhow::Result<ProviderPayment> {
        let resp = self
            .http
            .get(format!("{}/v1/payments/{payment_id}", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await
            .context("payment lookup failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider rejected payment lookup ({status}): {body}");
        }
        resp.json().await.context("malformed provider payment")
    }
}

// ── Signatures ──────────────────────────────────────────────────

/// Hex HMAC-SHA256 of `payload` under `secret`, as the provider signs.
#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Signature the checkout client echoes back for a completed payment.
#[cfg(test)]
pub(crate) fn payment_signature(key_secret: &str, order_id: &str, payment_id: &str) -> String {
    sign(key_secret, format!("{order_id}|{payment_id}").as_bytes())
}

pub fn verify_payment_signature(
    key_secret: &str,
    order_id: &str,
    payment_id: &str,
    signature: &str,
) -> bool {
    verify(key_secret, format!("{order_id}|{payment_id}").as_bytes(), signature)
}

/// Verify the `x-payment-signature` header against the raw webhook body.
/// A `sha256=` prefix is tolerated.
pub fn verify_webhook_signature(webhook_secret: &str, body: &[u8], signature_header: &str) -> bool {
    let signature = signature_header.trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    verify(webhook_secret, body, signature)
}

fn verify(secret: &str, payload: &[u8], hex_signature: &str) -> bool {
    let Ok(expected) = hex::decode(hex_signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&expected).is_ok()
}
