use crate::identity::IdentityError;
use crate::mailer::MailError;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use memory_gate_claim::{ClaimStatus, TokenError};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the gate, exchange and email-change operations,
/// each mapped to exactly one HTTP status code.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Admission proof rejected: {0}")]
    InvalidProof(String),

    #[error("Webhook signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Claim request not found")]
    NotFound,

    #[error("Claim request already claimed")]
    AlreadyClaimed,

    #[error("Claim email does not match signed-in account")]
    EmailMismatch {
        claim_email: String,
        user_email: String,
    },

    #[error("Claim request is in state {0}")]
    InvalidState(ClaimStatus),

    #[error("Claim link has expired")]
    DeliveryExpired,

    #[error("Mail dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::InvalidProof(_) | GateError::InvalidState(_) => StatusCode::BAD_REQUEST,
            GateError::SignatureRejected(_) | GateError::Unauthorized => StatusCode::UNAUTHORIZED,
            GateError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GateError::Token(error) => error.status_code(),
            GateError::NotFound => StatusCode::NOT_FOUND,
            GateError::AlreadyClaimed => StatusCode::CONFLICT,
            GateError::EmailMismatch { .. } => StatusCode::FORBIDDEN,
            GateError::DeliveryExpired => StatusCode::GONE,
            GateError::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
            GateError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for GateError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => GateError::NotFound,
            // A failed status CAS reports what the row actually was, which is
            // exactly what the caller needs to answer with.
            StoreError::PreconditionFailed {
                actual: ClaimStatus::Claimed,
            } => GateError::AlreadyClaimed,
            StoreError::PreconditionFailed {
                actual: ClaimStatus::Expired,
            } => GateError::DeliveryExpired,
            StoreError::PreconditionFailed { actual } => GateError::InvalidState(actual),
            StoreError::Backend(message) => GateError::Internal(message),
        }
    }
}

impl From<MailError> for GateError {
    fn from(error: MailError) -> Self {
        GateError::DispatchFailed(error.to_string())
    }
}

impl From<IdentityError> for GateError {
    fn from(_: IdentityError) -> Self {
        GateError::Unauthorized
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            GateError::EmailMismatch {
                claim_email,
                user_email,
            } => json!({
                "error": self.to_string(),
                "errorType": "email_mismatch",
                "claimEmail": claim_email,
                "userEmail": user_email,
            }),
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
