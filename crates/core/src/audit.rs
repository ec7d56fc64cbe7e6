use crate::store::Datastore;
use chrono::{DateTime, Utc};
use memory_gate_claim::ClaimRequest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Audit event vocabulary, one entry per state transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AuditEvent {
    GateAccepted,
    ClaimSent,
    ClaimResent,
    ClaimUsed,
    ClaimExpired,
    EmailChangeRequested,
    EmailChanged,
    /// Reserved for administrative tooling; nothing customer-facing emits it.
    ClaimCanceled,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::GateAccepted => "gate.accepted",
            AuditEvent::ClaimSent => "claim.sent",
            AuditEvent::ClaimResent => "claim.resent",
            AuditEvent::ClaimUsed => "claim.used",
            AuditEvent::ClaimExpired => "claim.expired",
            AuditEvent::EmailChangeRequested => "claim.emailChangeRequested",
            AuditEvent::EmailChanged => "claim.emailChanged",
            AuditEvent::ClaimCanceled => "claim.canceled",
        }
    }
}

/// One append-only audit record, partitioned by UTC day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: Uuid,
    pub day: String,
    pub event: String,
    pub actor: String,
    pub tenant: String,
    pub lp_id: String,
    pub request_id: Uuid,
    pub email_hash: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Lowercase hex SHA-256 of the trimmed, lowercased address. Audit rows
/// never carry a plaintext email.
pub fn email_hash(email: &str) -> String {
    hex::encode(Sha256::digest(email.trim().to_lowercase().as_bytes()))
}

pub fn day_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d").to_string()
}

/// Builds audit entries and appends them through the datastore. A failed
/// append is logged and swallowed; the business operation never fails on
/// audit alone.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn Datastore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        event: AuditEvent,
        request: &ClaimRequest,
        actor: &str,
        metadata: serde_json::Value,
    ) {
        let now = Utc::now();
        let entry = AuditEntry {
            log_id: Uuid::new_v4(),
            day: day_bucket(now),
            event: event.as_str().to_string(),
            actor: actor.to_string(),
            tenant: request.tenant.clone(),
            lp_id: request.lp_id.clone(),
            request_id: request.request_id,
            email_hash: email_hash(&request.email),
            metadata,
            timestamp: now,
        };

        if let Err(error) = self.store.append_audit(&entry).await {
            error!(
                request_id = %request.request_id,
                event = entry.event,
                ?error,
                "Failed to append audit entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemDatastore;
    use memory_gate_claim::ClaimSource;
    use serde_json::json;

    #[test]
    fn test_email_hash_normalizes() {
        let hash = email_hash("a@x.com");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(email_hash("  A@X.Com "), hash);
        assert_ne!(email_hash("b@x.com"), hash);
        // Nothing resembling the address leaks into the digest.
        assert!(!hash.contains("a@x"));
    }

    #[test]
    fn test_day_bucket_format() {
        let at = DateTime::parse_from_rfc3339("2026-08-06T23:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(day_bucket(at), "20260806");
    }

    #[tokio::test]
    async fn test_record_appends_day_bucketed_entry() {
        let store = Arc::new(MemDatastore::new());
        let recorder = AuditRecorder::new(store.clone());
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);

        recorder
            .record(
                AuditEvent::GateAccepted,
                &request,
                "system",
                json!({ "source": "lp-form" }),
            )
            .await;

        let day = day_bucket(Utc::now());
        let entries = store.audit_entries(&day);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "gate.accepted");
        assert_eq!(entries[0].actor, "system");
        assert_eq!(entries[0].tenant, "t1");
        assert_eq!(entries[0].email_hash, email_hash("a@x.com"));
        assert_eq!(entries[0].metadata["source"], "lp-form");
    }
}
