use crate::error::GateError;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

/// Proof material handed to an admission check. `proof` is the
/// source-specific token or signature header; `raw_body` carries the exact
/// request bytes for sources that sign the body.
pub struct AdmissionInput<'a> {
    pub proof: &'a str,
    pub raw_body: &'a [u8],
}

impl<'a> AdmissionInput<'a> {
    pub fn proof(proof: &'a str) -> Self {
        Self {
            proof,
            raw_body: &[],
        }
    }
}

/// Pass/fail oracle for one admission source. Failures never create state.
#[async_trait]
pub trait AdmissionVerifier: Send + Sync {
    async fn verify(&self, input: AdmissionInput<'_>) -> Result<(), GateError>;
}

#[derive(Debug, Deserialize)]
struct CaptchaVerdict {
    success: bool,
    score: Option<f64>,
}

/// Verifies a CAPTCHA response token against the configured siteverify
/// endpoint.
pub struct CaptchaVerifier {
    client: reqwest::Client,
    verify_url: String,
    secret: String,
    min_score: f64,
}

impl CaptchaVerifier {
    pub fn new(
        client: reqwest::Client,
        verify_url: impl Into<String>,
        secret: impl Into<String>,
        min_score: f64,
    ) -> Self {
        Self {
            client,
            verify_url: verify_url.into(),
            secret: secret.into(),
            min_score,
        }
    }
}

#[async_trait]
impl AdmissionVerifier for CaptchaVerifier {
    async fn verify(&self, input: AdmissionInput<'_>) -> Result<(), GateError> {
        let response = self
            .client
            .post(&self.verify_url)
            .form(&[("secret", self.secret.as_str()), ("response", input.proof)])
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|error| GateError::Internal(format!("captcha verify failed: {error}")))?;

        let verdict: CaptchaVerdict = response
            .json()
            .await
            .map_err(|error| GateError::Internal(format!("captcha verdict unreadable: {error}")))?;

        if !verdict.success {
            warn!("CAPTCHA verification rejected");
            return Err(GateError::InvalidProof("captcha rejected".to_string()));
        }
        if let Some(score) = verdict.score
            && score < self.min_score
        {
            warn!(score, min_score = self.min_score, "CAPTCHA score too low");
            return Err(GateError::InvalidProof("captcha score too low".to_string()));
        }

        debug!("CAPTCHA verification passed");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct StorefrontClaims {
    store_id: String,
    issued_at: i64,
}

/// Verifies the HMAC-signed kiosk token minted by in-store hardware:
/// `base64url(json { store_id, issued_at }).hex_sig`, bounded age.
pub struct StorefrontVerifier {
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl StorefrontVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, max_age_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            max_age_secs,
        }
    }
}

#[async_trait]
impl AdmissionVerifier for StorefrontVerifier {
    async fn verify(&self, input: AdmissionInput<'_>) -> Result<(), GateError> {
        let (payload_b64, sig_hex) = input
            .proof
            .split_once('.')
            .ok_or_else(|| GateError::InvalidProof("malformed store token".to_string()))?;

        let signature = hex::decode(sig_hex)
            .map_err(|_| GateError::InvalidProof("malformed store token".to_string()))?;
        let mut mac = <Hmac<Sha256>>::new_from_slice(&self.secret)
            .map_err(|_| GateError::InvalidProof("store token rejected".to_string()))?;
        mac.update(payload_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| GateError::InvalidProof("store token rejected".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| GateError::InvalidProof("malformed store token".to_string()))?;
        let claims: StorefrontClaims = serde_json::from_slice(&payload)
            .map_err(|_| GateError::InvalidProof("malformed store token".to_string()))?;

        let age = Utc::now().timestamp() - claims.issued_at;
        if age < 0 || age > self.max_age_secs {
            warn!(store_id = claims.store_id, age, "Store token outside validity window");
            return Err(GateError::InvalidProof("store token expired".to_string()));
        }

        debug!(store_id = claims.store_id, "Store token accepted");
        Ok(())
    }
}

/// Fields the gate needs from a completed checkout event.
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub customer_email: String,
    pub tenant: String,
    pub lp_id: String,
    pub product_type: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    customer_email: Option<String>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// Verifies the payment webhook signature header `t=<unix>,v1=<hexhmac>`
/// computed over `"{t}.{raw body}"`, with a bounded timestamp tolerance.
pub struct StripeWebhookVerifier {
    secret: Vec<u8>,
    tolerance_secs: i64,
}

impl StripeWebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Extract the checkout fields after the signature has been verified.
    /// Returns `Ok(None)` for event types this gate ignores.
    pub fn parse_event(&self, raw_body: &[u8]) -> Result<Option<CheckoutSession>, GateError> {
        let event: WebhookEvent = serde_json::from_slice(raw_body)
            .map_err(|_| GateError::InvalidProof("unreadable webhook event".to_string()))?;

        if event.event_type != "checkout.session.completed" {
            debug!(event_type = event.event_type, "Ignoring webhook event");
            return Ok(None);
        }

        let object = event.data.object;
        let customer_email = object
            .customer_email
            .filter(|email| !email.is_empty())
            .ok_or_else(|| {
                GateError::InvalidProof("checkout event missing customer_email".to_string())
            })?;

        let field = |name: &str| {
            object
                .metadata
                .get(name)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| {
                    GateError::InvalidProof(format!("checkout event missing metadata.{name}"))
                })
        };

        Ok(Some(CheckoutSession {
            customer_email,
            tenant: field("tenant")?,
            lp_id: field("lp_id")?,
            product_type: field("product_type")?,
        }))
    }
}

#[async_trait]
impl AdmissionVerifier for StripeWebhookVerifier {
    async fn verify(&self, input: AdmissionInput<'_>) -> Result<(), GateError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();

        for part in input.proof.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => {
                    if let Ok(sig) = hex::decode(value) {
                        signatures.push(sig);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            GateError::SignatureRejected("missing timestamp in signature header".to_string())
        })?;
        if signatures.is_empty() {
            return Err(GateError::SignatureRejected(
                "missing v1 signature".to_string(),
            ));
        }

        let skew = (Utc::now().timestamp() - timestamp).abs();
        if skew > self.tolerance_secs {
            warn!(skew, "Webhook signature timestamp outside tolerance");
            return Err(GateError::SignatureRejected(
                "signature timestamp outside tolerance".to_string(),
            ));
        }

        let matched = signatures.iter().any(|signature| {
            let Ok(mut mac) = <Hmac<Sha256>>::new_from_slice(&self.secret) else {
                return false;
            };
            mac.update(timestamp.to_string().as_bytes());
            mac.update(b".");
            mac.update(input.raw_body);
            mac.verify_slice(signature).is_ok()
        });

        if !matched {
            warn!("Webhook signature mismatch");
            return Err(GateError::SignatureRejected(
                "signature mismatch".to_string(),
            ));
        }

        Ok(())
    }
}
