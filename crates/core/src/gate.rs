use crate::admission::{AdmissionInput, AdmissionVerifier};
use crate::audit::{AuditEvent, AuditRecorder};
use crate::error::GateError;
use crate::mailer::{MailDispatcher, MailKind};
use crate::rate_limit::RateLimiter;
use crate::store::{Datastore, TransitionUpdate};
use chrono::Utc;
use memory_gate_claim::{
    ClaimRequest, ClaimSource, ClaimStatus, TokenCodec, TokenPayloadV1,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Front door of the service: verifies an external trust signal, opens a
/// claim row and sends the claim link.
///
/// The row is created `pending` and only moves to `sent` after the mail
/// dispatch succeeds. A failed dispatch leaves the row pending so the whole
/// admission can be driven again once the mail service recovers.
pub struct GateService {
    store: Arc<dyn Datastore>,
    codec: TokenCodec,
    audit: AuditRecorder,
    rate_limiter: RateLimiter,
    mailer: Arc<dyn MailDispatcher>,
    captcha: Arc<dyn AdmissionVerifier>,
    storefront: Arc<dyn AdmissionVerifier>,
    stripe: crate::admission::StripeWebhookVerifier,
    claim_base_url: String,
    claim_token_ttl_secs: u32,
}

impl GateService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Datastore>,
        codec: TokenCodec,
        audit: AuditRecorder,
        rate_limiter: RateLimiter,
        mailer: Arc<dyn MailDispatcher>,
        captcha: Arc<dyn AdmissionVerifier>,
        storefront: Arc<dyn AdmissionVerifier>,
        stripe: crate::admission::StripeWebhookVerifier,
        claim_base_url: impl Into<String>,
        claim_token_ttl_secs: u32,
    ) -> Self {
        Self {
            store,
            codec,
            audit,
            rate_limiter,
            mailer,
            captcha,
            storefront,
            stripe,
            claim_base_url: claim_base_url.into(),
            claim_token_ttl_secs,
        }
    }

    /// Landing-page form submission, trust signal is a CAPTCHA response.
    pub async fn admit_lp_form(
        &self,
        email: &str,
        tenant: &str,
        lp_id: &str,
        product_type: &str,
        recaptcha_token: &str,
    ) -> Result<Uuid, GateError> {
        self.captcha
            .verify(AdmissionInput::proof(recaptcha_token))
            .await?;
        self.admit(email, tenant, lp_id, product_type, ClaimSource::LpForm)
            .await
    }

    /// Storefront purchase, trust signal is the storefront's signed token.
    pub async fn admit_storefront(
        &self,
        email: &str,
        tenant: &str,
        lp_id: &str,
        product_type: &str,
        store_token: &str,
    ) -> Result<Uuid, GateError> {
        self.storefront
            .verify(AdmissionInput::proof(store_token))
            .await?;
        self.admit(email, tenant, lp_id, product_type, ClaimSource::Storefront)
            .await
    }

    /// Stripe webhook delivery. Returns `Ok(None)` for event types this
    /// service does not handle, so the endpoint can acknowledge them
    /// without creating anything.
    pub async fn admit_stripe(
        &self,
        signature_header: &str,
        raw_body: &[u8],
    ) -> Result<Option<Uuid>, GateError> {
        self.stripe
            .verify(AdmissionInput {
                proof: signature_header,
                raw_body,
            })
            .await?;

        let Some(session) = self.stripe.parse_event(raw_body)? else {
            info!("Ignoring unhandled webhook event type");
            return Ok(None);
        };

        let request_id = self
            .admit(
                &session.customer_email,
                &session.tenant,
                &session.lp_id,
                &session.product_type,
                ClaimSource::Stripe,
            )
            .await?;
        Ok(Some(request_id))
    }

    /// Shared admission pipeline once the trust signal has been verified.
    async fn admit(
        &self,
        email: &str,
        tenant: &str,
        lp_id: &str,
        product_type: &str,
        source: ClaimSource,
    ) -> Result<Uuid, GateError> {
        validate_email(email)?;
        self.rate_limiter.check_admission(email).await?;

        let request = ClaimRequest::new(email, tenant, lp_id, product_type, source);
        self.store
            .create_claim_request(&request)
            .await
            .map_err(|error| GateError::Internal(error.to_string()))?;

        self.audit
            .record(
                AuditEvent::GateAccepted,
                &request,
                "system",
                json!({ "source": source.as_str() }),
            )
            .await;

        let payload = TokenPayloadV1::claim(request.request_id, self.claim_token_ttl_secs)
            .map_err(|error| GateError::Internal(error.to_string()))?;
        let token = self
            .codec
            .sign(&payload)
            .map_err(|error| GateError::Internal(error.to_string()))?;
        let link = format!("{}?token={token}", self.claim_base_url);

        // Row stays pending when this fails, so the admission can be retried.
        self.mailer.dispatch(email, &link, MailKind::Claim).await?;

        let now = Utc::now();
        let request = self
            .store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(now),
            )
            .await?;

        self.audit
            .record(AuditEvent::ClaimSent, &request, "system", json!({}))
            .await;

        info!(
            request_id = %request.request_id,
            source = source.as_str(),
            "Claim link sent"
        );
        Ok(request.request_id)
    }
}

/// Minimal shape check. The mail dispatch is the real test of whether the
/// address is deliverable.
fn validate_email(email: &str) -> Result<(), GateError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => {
            warn!("Rejected malformed email address");
            Err(GateError::InvalidProof("invalid email address".into()))
        }
    }
}
