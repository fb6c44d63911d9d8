//! Axum-based HTTP gateway exposing the quota engine.
//!
//! - Request body size limits (64KB max)
//! - Request timeouts (configurable, 30s default)
//! - Metered routes authenticate with `x-api-key`
//! - Admin routes authenticate with a bearer token, compared by SHA-256 hash
//! - The provider webhook is verified against the raw body bytes

use crate::billing::{
    Currency, HttpPaymentProvider, PurchaseReconciler, ReconcilerSettings, WebhookOutcome,
    TOKEN_PACKAGES,
};
use crate::config::Config;
use crate::cost::CostTable;
use crate::error::QuotaError;
use crate::gate::{AuthorizationGate, Caller, GateRequest};
use crate::keys::ApiKeyRegistry;
use crate::ledger::{AccountLedger, UsageReport};
use crate::settlement::Settlement;
use crate::store::Store;
use crate::tier::{Feature, Tier, TierTable};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB): prevents memory exhaustion
pub const MAX_BODY_SIZE: usize = 65_536;
/// Header carrying the caller's API key on metered routes.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the provider's webhook signature.
pub const PAYMENT_SIGNATURE_HEADER: &str = "x-payment-signature";
/// Upper bound on `limit` for transaction history.
const MAX_TRANSACTIONS_PAGE: usize = 100;

fn hash_admin_token(value: &str) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(value.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub ledger: AccountLedger,
    pub registry: ApiKeyRegistry,
    pub gate: AuthorizationGate,
    pub settlement: Settlement,
    /// Present when payments are enabled.
    pub reconciler: Option<Arc<PurchaseReconciler>>,
    /// SHA-256 hash of the admin bearer token (hex-encoded), never plaintext.
    pub admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        tiers: Arc<TierTable>,
        costs: Arc<CostTable>,
        admin_token: Option<&str>,
    ) -> Self {
        let ledger = AccountLedger::new(store, tiers);
        let registry = ApiKeyRegistry::new(ledger.clone());
        let gate = AuthorizationGate::new(registry.clone(), ledger.clone(), costs);
        let settlement = Settlement::new(ledger.clone());
        Self {
            ledger,
            registry,
            gate,
            settlement,
            reconciler: None,
            admin_token_hash: admin_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| Arc::from(hash_admin_token(t))),
        }
    }

    pub fn with_reconciler(mut self, reconciler: PurchaseReconciler) -> Self {
        self.reconciler = Some(Arc::new(reconciler));
        self
    }

    /// Wire every component from a validated config.
    pub fn from_config(config: &Config, store: Arc<Store>) -> Result<Self> {
        let state = Self::new(
            store,
            Arc::new(config.tier_table()?),
            Arc::new(config.cost_table()?),
            config.gateway.admin_token.as_deref(),
        );
        if state.admin_token_hash.is_none() {
            tracing::warn!("No admin token configured; admin routes will reject every request");
        }
        if !config.payment.enabled {
            tracing::info!("Payments disabled; purchase routes will return 503");
            return Ok(state);
        }

        let payment = &config.payment;
        let key_secret = payment.key_secret.clone().unwrap_or_default();
        let provider = HttpPaymentProvider::new(&payment.base_url, &payment.key_id, &key_secret)?;
        let ttl_minutes = i64::try_from(payment.order_ttl_minutes)
            .context("payment.order_ttl_minutes is out of range")?;
        let reconciler = PurchaseReconciler::new(
            state.ledger.clone(),
            Arc::new(provider),
            ReconcilerSettings {
                key_secret,
                webhook_secret: payment.webhook_secret.clone().unwrap_or_default(),
                order_ttl: chrono::Duration::minutes(ttl_minutes),
            },
        );
        Ok(state.with_reconciler(reconciler))
    }
}

/// Build the router with its middleware stack.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    // ── CORS: browser clients call the metered routes directly ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(API_KEY_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/gate/endpoints", get(handle_endpoints))
        .route("/api/gate/authorize", post(handle_authorize))
        .route("/api/gate/settle", post(handle_settle))
        .route("/api/usage", get(handle_usage))
        .route("/api/billing/packages", get(handle_packages))
        .route("/api/billing/orders", post(handle_create_order))
        .route("/api/billing/verify", post(handle_verify_payment))
        .route("/api/billing/transactions", get(handle_transactions))
        .route("/api/billing/webhook", post(handle_payment_webhook))
        .route("/api/admin/accounts", post(handle_admin_create_account))
        .route("/api/admin/accounts/{id}", get(handle_admin_get_account))
        .route("/api/admin/accounts/{id}/tier", put(handle_admin_set_tier))
        .route(
            "/api/admin/accounts/{id}/keys",
            get(handle_admin_list_keys).post(handle_admin_create_key),
        )
        .route(
            "/api/admin/accounts/{id}/keys/{key_id}",
            axum::routing::delete(handle_admin_revoke_key),
        )
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

/// Run the HTTP gateway until Ctrl-C.
pub async fn run_gateway(config: &Config, state: AppState) -> Result<()> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Gateway listening on http://{}", listener.local_addr()?);

    if let Some(reconciler) = state.reconciler.clone() {
        spawn_order_sweeper(
            reconciler,
            Duration::from_secs(config.payment.sweep_interval_secs),
        );
    }

    let app = router(
        state,
        Duration::from_secs(config.gateway.request_timeout_secs),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Periodically expire overdue purchase orders.
fn spawn_order_sweeper(reconciler: Arc<PurchaseReconciler>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = reconciler.expire_stale_orders(chrono::Utc::now()) {
                tracing::warn!("Order sweep failed: {e}");
            }
        }
    });
}

// ══════════════════════════════════════════════════════════════════════════════
// RESPONSES
// ══════════════════════════════════════════════════════════════════════════════

/// Concrete return type for handlers (avoids `impl IntoResponse` inference issues).
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn status_for(err: &QuotaError) -> StatusCode {
    match err {
        QuotaError::MissingKey | QuotaError::InvalidKey => StatusCode::UNAUTHORIZED,
        QuotaError::FeatureNotAvailable { .. } => StatusCode::FORBIDDEN,
        QuotaError::InsufficientTokens { .. } | QuotaError::PaymentNotCaptured => {
            StatusCode::PAYMENT_REQUIRED
        }
        QuotaError::KeyNotFound | QuotaError::OrderNotFound | QuotaError::AccountNotFound => {
            StatusCode::NOT_FOUND
        }
        QuotaError::KeyLimitExceeded { .. }
        | QuotaError::OrderAlreadyProcessed
        | QuotaError::AccountExists => StatusCode::CONFLICT,
        QuotaError::OrderExpired => StatusCode::GONE,
        QuotaError::InvalidSignature
        | QuotaError::UnknownTier(_)
        | QuotaError::UnknownEndpoint(_)
        | QuotaError::UnknownPackage(_)
        | QuotaError::UnsupportedCurrency { .. }
        | QuotaError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        QuotaError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Map a typed denial to its HTTP shape. Internal causes are never rendered.
fn error_response(err: &QuotaError) -> ApiResponse {
    let mut body = serde_json::json!({
        "error": err.to_string(),
        "code": err.code(),
    });
    match err {
        QuotaError::InsufficientTokens {
            required,
            available,
        } => {
            body["required"] = (*required).into();
            body["available"] = (*available).into();
            body["shortfall"] = err.shortfall().unwrap_or_default().into();
        }
        QuotaError::FeatureNotAvailable { feature, tier } => {
            body["feature"] = feature.as_str().into();
            body["tier"] = tier.as_str().into();
        }
        QuotaError::KeyLimitExceeded { max } => {
            body["maxApiKeys"] = (*max).into();
        }
        _ => {}
    }
    (status_for(err), Json(body))
}

fn bad_request(rejection: &JsonRejection) -> ApiResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": format!("Invalid request: {rejection}"),
            "code": "invalid_input",
        })),
    )
}

fn payments_disabled() -> ApiResponse {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({
            "error": "payments are not enabled",
            "code": "service_unavailable",
        })),
    )
}

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Caller, ApiResponse> {
    state
        .gate
        .authenticate(api_key(headers))
        .map_err(|e| error_response(&e))
}

/// Check `Authorization: Bearer <token>` against the hashed admin token.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiResponse> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "admin authorization required",
                "code": "unauthorized",
            })),
        )
    };
    let Some(ref expected_hash) = state.admin_token_hash else {
        return Err(unauthorized());
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .trim();
    if token.is_empty() || !constant_time_eq(&hash_admin_token(token), expected_hash) {
        return Err(unauthorized());
    }
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// METERED HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health(State(state): State<AppState>) -> ApiResponse {
    match state.ledger.store().account_count() {
        Ok(accounts) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "payments": state.reconciler.is_some(),
                "accounts": accounts,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/gate/endpoints: public cost table used for pre-flight estimates.
async fn handle_endpoints(State(state): State<AppState>) -> ApiResponse {
    let endpoints: serde_json::Map<String, serde_json::Value> = state
        .gate
        .costs()
        .iter()
        .map(|(name, cost)| {
            (
                name.to_string(),
                serde_json::json!({
                    "feature": cost.feature,
                    "min": cost.min,
                    "max": cost.max,
                    "average": cost.average,
                }),
            )
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "endpoints": endpoints })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeBody {
    feature: Feature,
    endpoint: String,
    #[serde(default)]
    multiplier: Option<u32>,
}

/// POST /api/gate/authorize: pre-flight check before a metered operation.
async fn handle_authorize(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AuthorizeBody>, JsonRejection>,
) -> ApiResponse {
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };

    let request = GateRequest {
        api_key: api_key(&headers),
        feature: body.feature,
        endpoint: &body.endpoint,
        multiplier: body.multiplier.unwrap_or(1),
    };
    match state.gate.authorize(request) {
        Ok(auth) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "authorized": true,
                "accountId": auth.account.id,
                "keyId": auth.key_id,
                "feature": auth.feature,
                "estimate": auth.estimate,
                "dailyReset": auth.daily_reset,
                "usage": UsageReport::new(0, &auth.account),
            })),
        ),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleBody {
    operation_id: String,
    actual_cost: u64,
}

/// POST /api/gate/settle: debit the actual cost of a completed operation.
async fn handle_settle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SettleBody>, JsonRejection>,
) -> ApiResponse {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };

    match state
        .settlement
        .settle(&caller.account.id, &body.operation_id, body.actual_cost)
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "settled": true,
                "alreadySettled": outcome.already_settled,
                "usage": UsageReport::new(outcome.tokens_used, &outcome.account),
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/usage: balances, counters and entitlements of the caller.
async fn handle_usage(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let usage = UsageReport::new(0, &caller.account);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "account": caller.account,
            "usage": usage,
        })),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// BILLING HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /api/billing/packages: public catalog.
async fn handle_packages() -> ApiResponse {
    let packages: Vec<serde_json::Value> = TOKEN_PACKAGES
        .iter()
        .map(|p| {
            let prices: serde_json::Map<String, serde_json::Value> = p
                .prices
                .iter()
                .map(|(currency, amount)| (currency.as_str().to_string(), (*amount).into()))
                .collect();
            serde_json::json!({
                "id": p.id,
                "name": p.name,
                "tokens": p.tokens,
                "bonus": p.bonus,
                "totalTokens": p.total_tokens(),
                "prices": prices,
            })
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "packages": packages })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody {
    package_id: String,
    currency: String,
}

/// POST /api/billing/orders: open a purchase order.
async fn handle_create_order(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateOrderBody>, JsonRejection>,
) -> ApiResponse {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(reconciler) = state.reconciler.as_ref() else {
        return payments_disabled();
    };
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };
    let currency: Currency = match body.currency.parse() {
        Ok(c) => c,
        Err(e) => return error_response(&e),
    };

    match reconciler
        .create_order(&caller.account.id, &body.package_id, currency)
        .await
    {
        Ok(order) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "order": order })),
        ),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyPaymentBody {
    order_id: String,
    payment_id: String,
    signature: String,
}

/// POST /api/billing/verify: client callback after checkout.
async fn handle_verify_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<VerifyPaymentBody>, JsonRejection>,
) -> ApiResponse {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(reconciler) = state.reconciler.as_ref() else {
        return payments_disabled();
    };
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };

    match reconciler
        .verify_and_complete(
            &caller.account.id,
            &body.order_id,
            &body.payment_id,
            &body.signature,
        )
        .await
    {
        Ok(done) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "completed",
                "transaction": done.transaction,
                "usage": UsageReport::new(0, &done.account),
            })),
        ),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
struct TransactionsQuery {
    limit: Option<usize>,
}

/// GET /api/billing/transactions: purchase history, most recent first.
async fn handle_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TransactionsQuery>,
) -> ApiResponse {
    let caller = match authenticate(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(reconciler) = state.reconciler.as_ref() else {
        return payments_disabled();
    };
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_TRANSACTIONS_PAGE);

    match reconciler.transactions(&caller.account.id, limit) {
        Ok(transactions) => (
            StatusCode::OK,
            Json(serde_json::json!({ "transactions": transactions })),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /api/billing/webhook: provider event, verified over the raw body.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResponse {
    let Some(reconciler) = state.reconciler.as_ref() else {
        return payments_disabled();
    };
    let signature = headers
        .get(PAYMENT_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match reconciler.handle_webhook(&body, signature).await {
        Ok(WebhookOutcome::Completed(done)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "completed",
                "orderId": done.transaction.order_id,
            })),
        ),
        Ok(WebhookOutcome::Failed { order_id }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "failed", "orderId": order_id })),
        ),
        Ok(WebhookOutcome::Ignored { event }) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ignored", "event": event })),
        ),
        // Acknowledge redeliveries so the provider stops retrying.
        Err(QuotaError::OrderAlreadyProcessed) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "already_processed" })),
        ),
        Err(e) => error_response(&e),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// ADMIN HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountBody {
    account_id: String,
    #[serde(default)]
    tier: Option<String>,
}

#[derive(Deserialize)]
struct SetTierBody {
    tier: String,
}

#[derive(Deserialize)]
struct CreateKeyBody {
    name: String,
}

/// POST /api/admin/accounts: provision an account.
async fn handle_admin_create_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateAccountBody>, JsonRejection>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };
    let tier = match body.tier.as_deref().map(str::parse::<Tier>).transpose() {
        Ok(t) => t.unwrap_or(Tier::Free),
        Err(e) => return error_response(&e),
    };

    match state.ledger.open_account(&body.account_id, tier) {
        Ok(account) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "account": account })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/admin/accounts/{id}: inspect an account and its keys.
async fn handle_admin_get_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let result = state
        .ledger
        .account(&id)
        .and_then(|account| Ok((account, state.registry.list(&id)?)));
    match result {
        Ok((account, keys)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "account": account, "keys": keys })),
        ),
        Err(e) => error_response(&e),
    }
}

/// PUT /api/admin/accounts/{id}/tier: change an account's tier.
async fn handle_admin_set_tier(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<SetTierBody>, JsonRejection>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };

    match body
        .tier
        .parse::<Tier>()
        .and_then(|tier| state.ledger.change_tier(&id, tier))
    {
        Ok(account) => (
            StatusCode::OK,
            Json(serde_json::json!({ "account": account })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /api/admin/accounts/{id}/keys: list keys (never plaintext).
async fn handle_admin_list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    match state.ledger.account(&id).and_then(|_| state.registry.list(&id)) {
        Ok(keys) => (StatusCode::OK, Json(serde_json::json!({ "keys": keys }))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/admin/accounts/{id}/keys: issue a key. The plaintext is only
/// in this response.
async fn handle_admin_create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<CreateKeyBody>, JsonRejection>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    let body = match body {
        Ok(Json(b)) => b,
        Err(e) => return bad_request(&e),
    };

    match state.registry.create(&id, &body.name) {
        Ok(issued) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "apiKey": issued })),
        ),
        Err(e) => error_response(&e),
    }
}

/// DELETE /api/admin/accounts/{id}/keys/{key_id}: revoke a key.
async fn handle_admin_revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, key_id)): Path<(String, String)>,
) -> ApiResponse {
    if let Err(resp) = authenticate_admin(&state, &headers) {
        return resp;
    }
    match state.registry.revoke(&id, &key_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "revoked", "keyId": key_id })),
        ),
        Err(e) => error_response(&e),
    }
}
