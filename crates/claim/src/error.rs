use axum::http::StatusCode;
use thiserror::Error;

/// Token verification errors with API error codes
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidToken,

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unexpected token kind {0}")]
    UnexpectedKind(u8),

    #[error("Token has expired")]
    TokenExpired,

    #[error("AEAD decryption failed")]
    AeadFail,

    #[error("Key not found: {0}")]
    KeyNotFound(u8),
}

impl TokenError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            TokenError::InvalidToken
            | TokenError::InvalidHeader(_)
            | TokenError::InvalidPayload(_)
            | TokenError::UnexpectedKind(_)
            | TokenError::AeadFail
            | TokenError::KeyNotFound(_) => StatusCode::UNAUTHORIZED,
            TokenError::TokenExpired => StatusCode::GONE,
        }
    }
}
