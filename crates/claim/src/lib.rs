pub mod codec;
pub mod error;
mod header;
pub mod request;
pub mod token;

// Re-export public types and functions
pub use codec::TokenCodec;
pub use error::TokenError;
pub use request::{ClaimRequest, ClaimSource, ClaimStatus};
pub use token::{TokenKind, TokenPayloadV1};

/// Default validity of a claim token in seconds (72 hours)
pub const CLAIM_TOKEN_TTL_SECS: u32 = 259_200;
/// Default validity of an email-confirm token in seconds (24 hours)
pub const EMAIL_CONFIRM_TTL_SECS: u32 = 86_400;
