use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::warn;

/// Verified subject returned by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("Malformed credential")]
    Malformed,

    #[error("Credential signature mismatch")]
    BadSignature,

    #[error("Credential expired")]
    Expired,
}

/// Verifies a bearer credential and yields the stable subject id plus the
/// verified email. Credential issuance and account management live outside
/// this service.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    uid: String,
    email: String,
    exp: i64,
}

/// Verifies HMAC-SHA256 assertions minted by the external IdP with a shared
/// secret: `base64url(json { uid, email, exp }).hex_sig`.
pub struct HmacIdentityProvider {
    secret: Vec<u8>,
}

impl HmacIdentityProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn verify_assertion(&self, credential: &str) -> Result<Identity, IdentityError> {
        let (payload_b64, sig_hex) = credential
            .split_once('.')
            .ok_or(IdentityError::Malformed)?;

        let signature = hex::decode(sig_hex).map_err(|_| IdentityError::Malformed)?;
        let mut mac = <Hmac<Sha256>>::new_from_slice(&self.secret)
            .map_err(|_| IdentityError::BadSignature)?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| IdentityError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| IdentityError::Malformed)?;
        let claims: AssertionClaims =
            serde_json::from_slice(&payload).map_err(|_| IdentityError::Malformed)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(IdentityError::Expired);
        }

        Ok(Identity {
            uid: claims.uid,
            email: claims.email,
        })
    }
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        self.verify_assertion(credential).inspect_err(|error| {
            warn!(?error, "Rejected identity assertion");
        })
    }
}
