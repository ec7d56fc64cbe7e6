use crate::audit::{AuditEvent, AuditRecorder, email_hash};
use crate::error::GateError;
use crate::identity::IdentityProvider;
use crate::mailer::{MailDispatcher, MailKind};
use crate::rate_limit::RateLimiter;
use crate::store::{Datastore, TransitionUpdate};
use chrono::Utc;
use memory_gate_claim::{ClaimStatus, TokenCodec, TokenError, TokenKind, TokenPayloadV1};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Moves an unredeemed claim to a different address.
///
/// Two steps: the holder of a live claim token asks for the change, a
/// confirmation link goes to the NEW address, and only confirming from that
/// inbox rewrites the row and re-arms the claim. The confirm token binds
/// the new address inside its payload, so nothing between the two steps is
/// trusted from the client.
pub struct EmailChangeService {
    store: Arc<dyn Datastore>,
    codec: TokenCodec,
    identity: Arc<dyn IdentityProvider>,
    audit: AuditRecorder,
    rate_limiter: RateLimiter,
    mailer: Arc<dyn MailDispatcher>,
    confirm_base_url: String,
    claim_base_url: String,
    email_confirm_ttl_secs: u32,
    claim_token_ttl_secs: u32,
}

impl EmailChangeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Datastore>,
        codec: TokenCodec,
        identity: Arc<dyn IdentityProvider>,
        audit: AuditRecorder,
        rate_limiter: RateLimiter,
        mailer: Arc<dyn MailDispatcher>,
        confirm_base_url: impl Into<String>,
        claim_base_url: impl Into<String>,
        email_confirm_ttl_secs: u32,
        claim_token_ttl_secs: u32,
    ) -> Self {
        Self {
            store,
            codec,
            identity,
            audit,
            rate_limiter,
            mailer,
            confirm_base_url: confirm_base_url.into(),
            claim_base_url: claim_base_url.into(),
            email_confirm_ttl_secs,
            claim_token_ttl_secs,
        }
    }

    /// Step one: a signed-in user holding the claim token asks to move the
    /// claim to `new_email`. Sends the confirmation link there.
    pub async fn request_change(
        &self,
        token: &str,
        credential: &str,
        new_email: &str,
    ) -> Result<Uuid, GateError> {
        self.identity.verify(credential).await?;
        let payload = self.codec.verify(token, TokenKind::Claim)?;

        let request = self.store.get_claim_request(payload.request_id).await?;
        self.rate_limiter.check_email_change(&request)?;

        match request.status {
            ClaimStatus::Pending | ClaimStatus::Sent => {}
            ClaimStatus::Claimed => return Err(GateError::AlreadyClaimed),
            other => return Err(GateError::InvalidState(other)),
        }

        validate_email(new_email)?;

        let request = self
            .store
            .mark_email_change_requested(request.request_id, Utc::now())
            .await?;

        let confirm_payload = TokenPayloadV1::email_confirm(
            request.request_id,
            new_email,
            self.email_confirm_ttl_secs,
        )
        .map_err(|error| GateError::Internal(error.to_string()))?;
        let confirm_token = self
            .codec
            .sign(&confirm_payload)
            .map_err(|error| GateError::Internal(error.to_string()))?;
        let link = format!("{}?token={confirm_token}", self.confirm_base_url);

        self.mailer
            .dispatch(new_email, &link, MailKind::EmailConfirm)
            .await?;

        self.audit
            .record(
                AuditEvent::EmailChangeRequested,
                &request,
                "system",
                json!({ "newEmailHash": email_hash(new_email) }),
            )
            .await;

        info!(request_id = %request.request_id, "Email change confirmation sent");
        Ok(request.request_id)
    }

    /// Step two: the confirmation link from the new inbox. Rewrites the
    /// address, then re-arms the claim with a fresh token to that address.
    pub async fn confirm_change(&self, token: &str) -> Result<Uuid, GateError> {
        let payload = self.codec.verify(token, TokenKind::EmailConfirm)?;
        let Some(new_email) = payload.email else {
            warn!("Email-confirm token without a bound address");
            return Err(GateError::Token(TokenError::InvalidPayload(
                "missing email".into(),
            )));
        };

        let request = self.store.get_claim_request(payload.request_id).await?;
        let request = self
            .store
            .set_email(request.request_id, &new_email)
            .await?;

        self.audit
            .record(AuditEvent::EmailChanged, &request, "system", json!({}))
            .await;

        let claim_payload = TokenPayloadV1::claim(request.request_id, self.claim_token_ttl_secs)
            .map_err(|error| GateError::Internal(error.to_string()))?;
        let claim_token = self
            .codec
            .sign(&claim_payload)
            .map_err(|error| GateError::Internal(error.to_string()))?;
        let link = format!("{}?token={claim_token}", self.claim_base_url);

        self.mailer
            .dispatch(&new_email, &link, MailKind::Claim)
            .await?;

        let request = self
            .store
            .transition(
                request.request_id,
                request.status,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(Utc::now()),
            )
            .await?;

        self.audit
            .record(AuditEvent::ClaimResent, &request, "system", json!({}))
            .await;

        info!(request_id = %request.request_id, "Claim re-armed after email change");
        Ok(request.request_id)
    }
}

fn validate_email(email: &str) -> Result<(), GateError> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(GateError::InvalidProof("invalid email address".into())),
    }
}
