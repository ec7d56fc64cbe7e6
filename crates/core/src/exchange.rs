use crate::audit::{AuditEvent, AuditRecorder};
use crate::error::GateError;
use crate::identity::IdentityProvider;
use crate::store::{Datastore, Memory, TransitionUpdate};
use chrono::{Duration, Utc};
use memory_gate_claim::{ClaimStatus, TokenCodec, TokenKind};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a successful exchange: the freshly created record and where
/// the client should send the user next.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub memory_id: Uuid,
    pub redirect_url: String,
}

/// Redeems a claim token exactly once.
///
/// The `sent -> claimed` compare-and-set is the single arbiter of
/// concurrent redemption. The memory record is created before the CAS and
/// rolled back when the CAS loses, so a winner never observes a half-built
/// record and a loser leaves nothing behind.
pub struct ExchangeService {
    store: Arc<dyn Datastore>,
    codec: TokenCodec,
    identity: Arc<dyn IdentityProvider>,
    audit: AuditRecorder,
    delivery_window: Duration,
    redirect_base_url: String,
}

impl ExchangeService {
    pub fn new(
        store: Arc<dyn Datastore>,
        codec: TokenCodec,
        identity: Arc<dyn IdentityProvider>,
        audit: AuditRecorder,
        delivery_window_secs: i64,
        redirect_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            codec,
            identity,
            audit,
            delivery_window: Duration::seconds(delivery_window_secs),
            redirect_base_url: redirect_base_url.into(),
        }
    }

    pub async fn exchange(
        &self,
        token: &str,
        credential: &str,
    ) -> Result<ExchangeOutcome, GateError> {
        let identity = self.identity.verify(credential).await?;
        let payload = self.codec.verify(token, TokenKind::Claim)?;

        let request = self.store.get_claim_request(payload.request_id).await?;

        if !request.email.eq_ignore_ascii_case(&identity.email) {
            warn!(request_id = %request.request_id, "Claim email does not match signed-in user");
            return Err(GateError::EmailMismatch {
                claim_email: request.email,
                user_email: identity.email,
            });
        }

        match request.status {
            ClaimStatus::Sent => {}
            ClaimStatus::Claimed => return Err(GateError::AlreadyClaimed),
            ClaimStatus::Expired => return Err(GateError::DeliveryExpired),
            other => return Err(GateError::InvalidState(other)),
        }

        let now = Utc::now();
        if request.is_delivery_expired(self.delivery_window, now) {
            let request = self
                .store
                .transition(
                    request.request_id,
                    ClaimStatus::Sent,
                    TransitionUpdate::to(ClaimStatus::Expired),
                )
                .await?;
            self.audit
                .record(AuditEvent::ClaimExpired, &request, "system", json!({}))
                .await;
            return Err(GateError::DeliveryExpired);
        }

        let memory = Memory::draft(&identity.uid, &request.tenant, &request.lp_id);
        self.store
            .create_memory(&memory)
            .await
            .map_err(|error| GateError::Internal(error.to_string()))?;

        let request = match self
            .store
            .transition(
                request.request_id,
                ClaimStatus::Sent,
                TransitionUpdate::to(ClaimStatus::Claimed).with_claim(
                    now,
                    &identity.uid,
                    memory.id,
                ),
            )
            .await
        {
            Ok(request) => request,
            Err(error) => {
                // CAS lost, another exchange won. Remove the orphan record.
                if let Err(rollback) = self.store.delete_memory(memory.id).await {
                    warn!(memory_id = %memory.id, ?rollback, "Failed to roll back memory");
                }
                return Err(error.into());
            }
        };

        self.audit
            .record(
                AuditEvent::ClaimUsed,
                &request,
                &identity.uid,
                json!({ "memoryId": memory.id }),
            )
            .await;

        info!(
            request_id = %request.request_id,
            memory_id = %memory.id,
            "Claim exchanged"
        );
        Ok(ExchangeOutcome {
            memory_id: memory.id,
            redirect_url: format!("{}/{}", self.redirect_base_url, memory.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDatastore;
    use async_trait::async_trait;
    use memory_gate_claim::{ClaimRequest, ClaimSource, TokenPayloadV1};

    struct FixedIdentity {
        uid: &'static str,
        email: &'static str,
    }

    #[async_trait]
    impl IdentityProvider for FixedIdentity {
        async fn verify(
            &self,
            _credential: &str,
        ) -> Result<crate::identity::Identity, crate::identity::IdentityError> {
            Ok(crate::identity::Identity {
                uid: self.uid.to_string(),
                email: self.email.to_string(),
            })
        }
    }

    struct RejectingIdentity;

    #[async_trait]
    impl IdentityProvider for RejectingIdentity {
        async fn verify(
            &self,
            _credential: &str,
        ) -> Result<crate::identity::Identity, crate::identity::IdentityError> {
            Err(crate::identity::IdentityError::BadSignature)
        }
    }

    fn service(
        store: Arc<MemDatastore>,
        codec: TokenCodec,
        identity: Arc<dyn IdentityProvider>,
    ) -> ExchangeService {
        let store: Arc<dyn Datastore> = store;
        ExchangeService::new(
            store.clone(),
            codec,
            identity,
            AuditRecorder::new(store),
            259_200,
            "http://localhost/memories",
        )
    }

    async fn seed_sent(store: &MemDatastore) -> ClaimRequest {
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);
        store.create_claim_request(&request).await.unwrap();
        store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(Utc::now()),
            )
            .await
            .unwrap()
    }

    fn claim_token(codec: &TokenCodec, request_id: Uuid) -> String {
        let payload = TokenPayloadV1::claim(request_id, 3600).unwrap();
        codec.sign(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_creates_memory_and_redirects() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = service(
            store.clone(),
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
        );

        let outcome = exchange.exchange(&token, "cred").await.unwrap();
        assert_eq!(
            outcome.redirect_url,
            format!("http://localhost/memories/{}", outcome.memory_id)
        );

        let request = store.get_claim_request(request.request_id).await.unwrap();
        assert_eq!(request.status, ClaimStatus::Claimed);
        assert_eq!(request.claimed_by_uid.as_deref(), Some("uid-1"));
        assert_eq!(request.memory_id, Some(outcome.memory_id));

        let memory = store.memory(outcome.memory_id).unwrap();
        assert_eq!(memory.owner_uid, "uid-1");
        assert_eq!(memory.tenant, "t1");

        assert_eq!(store.audit_events_for(request.request_id), vec!["claim.used"]);
    }

    #[tokio::test]
    async fn test_second_exchange_conflicts() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = service(
            store.clone(),
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
        );

        exchange.exchange(&token, "cred").await.unwrap();
        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::AlreadyClaimed)
        ));
    }

    #[tokio::test]
    async fn test_email_mismatch_is_rejected_without_mutation() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = service(
            store.clone(),
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-2",
                email: "other@x.com",
            }),
        );

        let result = exchange.exchange(&token, "cred").await;
        match result {
            Err(GateError::EmailMismatch {
                claim_email,
                user_email,
            }) => {
                assert_eq!(claim_email, "a@x.com");
                assert_eq!(user_email, "other@x.com");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let request = store.get_claim_request(request.request_id).await.unwrap();
        assert_eq!(request.status, ClaimStatus::Sent);
    }

    #[tokio::test]
    async fn test_email_match_is_case_insensitive() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = service(
            store.clone(),
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "A@X.COM",
            }),
        );

        exchange.exchange(&token, "cred").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_credential_is_unauthorized() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = service(store, codec, Arc::new(RejectingIdentity));

        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let token = claim_token(&codec, Uuid::new_v4());
        let exchange = service(
            store,
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
        );

        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_stale_delivery_expires_row_and_stays_expired() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        // Zero-width delivery window: everything already sent is stale.
        let exchange = ExchangeService::new(
            store.clone() as Arc<dyn Datastore>,
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
            AuditRecorder::new(store.clone() as Arc<dyn Datastore>),
            -1,
            "http://localhost/memories",
        );

        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::DeliveryExpired)
        ));
        let row = store.get_claim_request(request.request_id).await.unwrap();
        assert_eq!(row.status, ClaimStatus::Expired);
        assert_eq!(
            store.audit_events_for(request.request_id),
            vec!["claim.expired"]
        );

        // A retry on the expired row gives the same terminal answer.
        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::DeliveryExpired)
        ));
        // No memory record was ever created.
        assert_eq!(store.memory_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_row_is_invalid_state() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);
        store.create_claim_request(&request).await.unwrap();
        let token = claim_token(&codec, request.request_id);
        let exchange = service(
            store,
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
        );

        assert!(matches!(
            exchange.exchange(&token, "cred").await,
            Err(GateError::InvalidState(ClaimStatus::Pending))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_single_winner() {
        let store = Arc::new(MemDatastore::new());
        let codec = TokenCodec::new();
        let request = seed_sent(&store).await;
        let token = claim_token(&codec, request.request_id);
        let exchange = Arc::new(service(
            store.clone(),
            codec,
            Arc::new(FixedIdentity {
                uid: "uid-1",
                email: "a@x.com",
            }),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let exchange = exchange.clone();
            let token = token.clone();
            handles.push(tokio::spawn(
                async move { exchange.exchange(&token, "cred").await },
            ));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(GateError::AlreadyClaimed) => conflicts += 1,
                Err(other) => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
        // Losers rolled their records back.
        assert_eq!(store.memory_count(), 1);
    }
}
