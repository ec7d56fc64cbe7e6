use crate::AppState;
use crate::error::GateError;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::HeaderMap;
use axum::http::header::ORIGIN;
use axum::middleware;
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
pub struct LpFormGateRequest {
    pub email: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub lp_id: String,
    pub product_type: String,
    pub recaptcha_token: String,
}

#[derive(Serialize, Deserialize)]
pub struct StorefrontGateRequest {
    pub email: String,
    #[serde(default)]
    pub tenant: Option<String>,
    pub lp_id: String,
    pub product_type: String,
    pub store_token: String,
}

#[derive(Serialize, Deserialize)]
pub struct GateResponse {
    pub request_id: Uuid,
}

#[derive(Serialize, Deserialize)]
pub struct ExchangeRequest {
    pub token: String,
}

#[derive(Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub memory_id: Uuid,
    pub redirect_url: String,
}

#[derive(Serialize, Deserialize)]
pub struct EmailChangeRequest {
    pub token: String,
    pub new_email: String,
}

#[derive(Serialize, Deserialize)]
pub struct EmailChangeConfirmRequest {
    pub token: String,
}

fn bearer_credential(headers: &HeaderMap) -> Result<&str, GateError> {
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|credential| !credential.is_empty())
        .ok_or(GateError::Unauthorized)
}

fn origin(headers: &HeaderMap) -> Option<&str> {
    headers.get(ORIGIN).and_then(|value| value.to_str().ok())
}

#[axum::debug_handler]
pub async fn gate_lp_form(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<LpFormGateRequest>,
) -> Result<Json<GateResponse>, GateError> {
    let tenant = state.resolve_tenant(body.tenant.as_deref(), origin(&headers));
    let request_id = state
        .gate
        .admit_lp_form(
            &body.email,
            &tenant,
            &body.lp_id,
            &body.product_type,
            &body.recaptcha_token,
        )
        .await?;
    Ok(Json(GateResponse { request_id }))
}

#[axum::debug_handler]
pub async fn gate_storefront(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<StorefrontGateRequest>,
) -> Result<Json<GateResponse>, GateError> {
    let tenant = state.resolve_tenant(body.tenant.as_deref(), origin(&headers));
    let request_id = state
        .gate
        .admit_storefront(
            &body.email,
            &tenant,
            &body.lp_id,
            &body.product_type,
            &body.store_token,
        )
        .await?;
    Ok(Json(GateResponse { request_id }))
}

/// Stripe retries deliveries until it sees a 2xx, so events this service
/// does not handle are still acknowledged.
#[axum::debug_handler]
pub async fn gate_stripe(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, GateError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| GateError::SignatureRejected("missing Stripe-Signature header".into()))?;

    match state.gate.admit_stripe(signature, &body).await? {
        Some(request_id) => Ok(Json(json!({ "received": true, "requestId": request_id }))),
        None => Ok(Json(json!({ "received": true }))),
    }
}

#[axum::debug_handler]
pub async fn exchange_claim(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, GateError> {
    let credential = bearer_credential(&headers)?;
    let outcome = state.exchange.exchange(&body.token, credential).await?;
    Ok(Json(ExchangeResponse {
        memory_id: outcome.memory_id,
        redirect_url: outcome.redirect_url,
    }))
}

#[axum::debug_handler]
pub async fn request_email_change(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Json(body): Json<EmailChangeRequest>,
) -> Result<Json<GateResponse>, GateError> {
    let credential = bearer_credential(&headers)?;
    let request_id = state
        .email_change
        .request_change(&body.token, credential, &body.new_email)
        .await?;
    Ok(Json(GateResponse { request_id }))
}

#[axum::debug_handler]
pub async fn confirm_email_change(
    Extension(state): Extension<AppState>,
    Json(body): Json<EmailChangeConfirmRequest>,
) -> Result<Json<GateResponse>, GateError> {
    let request_id = state.email_change.confirm_change(&body.token).await?;
    Ok(Json(GateResponse { request_id }))
}

#[axum::debug_handler]
pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/gate/lp-form", post(gate_lp_form))
        .route("/gate/storefront", post(gate_storefront))
        .route("/gate/stripe", post(gate_stripe))
        .route("/claim/exchange", post(exchange_claim))
        .route("/claim/email-change", post(request_email_change))
        .route("/claim/email-change/confirm", post(confirm_email_change))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn(super::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(Extension(state))
}
