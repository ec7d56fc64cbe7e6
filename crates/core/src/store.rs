use crate::audit::AuditEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use memory_gate_claim::{ClaimRequest, ClaimStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found")]
    NotFound,

    #[error("Precondition failed: status is {actual}")]
    PreconditionFailed { actual: ClaimStatus },

    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Content record bound to a claiming subject at exchange time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub owner_uid: String,
    pub tenant: String,
    pub lp_id: String,
    pub design: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Memory {
    /// A fresh draft with the default design skeleton, owned from birth.
    pub fn draft(
        owner_uid: impl Into<String>,
        tenant: impl Into<String>,
        lp_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_uid: owner_uid.into(),
            tenant: tenant.into(),
            lp_id: lp_id.into(),
            design: json!({ "version": 1, "blocks": [] }),
            status: "draft".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Field updates applied together with a status CAS.
#[derive(Debug, Clone)]
pub struct TransitionUpdate {
    pub status: ClaimStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_uid: Option<String>,
    pub memory_id: Option<Uuid>,
}

impl TransitionUpdate {
    pub fn to(status: ClaimStatus) -> Self {
        Self {
            status,
            sent_at: None,
            claimed_at: None,
            claimed_by_uid: None,
            memory_id: None,
        }
    }

    pub fn with_sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = Some(at);
        self
    }

    pub fn with_claim(mut self, at: DateTime<Utc>, uid: impl Into<String>, memory_id: Uuid) -> Self {
        self.claimed_at = Some(at);
        self.claimed_by_uid = Some(uid.into());
        self.memory_id = Some(memory_id);
        self
    }
}

/// Persistence seam for claim requests, memories and the audit log.
///
/// `transition` is the single transactional primitive: it updates the row
/// only when the current status matches `expected`, otherwise it reports
/// `PreconditionFailed` with the status actually found.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn create_claim_request(&self, request: &ClaimRequest) -> Result<(), StoreError>;

    async fn get_claim_request(&self, request_id: Uuid) -> Result<ClaimRequest, StoreError>;

    async fn transition(
        &self,
        request_id: Uuid,
        expected: ClaimStatus,
        update: TransitionUpdate,
    ) -> Result<ClaimRequest, StoreError>;

    /// Replace the target address. Guarded: only `pending` and `sent` rows
    /// may change address.
    async fn set_email(&self, request_id: Uuid, new_email: &str)
    -> Result<ClaimRequest, StoreError>;

    async fn mark_email_change_requested(
        &self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ClaimRequest, StoreError>;

    /// Whether an active (`pending` or `sent`) request for this address was
    /// created at or after `since`.
    async fn has_active_request_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn create_memory(&self, memory: &Memory) -> Result<(), StoreError>;

    async fn delete_memory(&self, memory_id: Uuid) -> Result<(), StoreError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemDatastoreInner {
    claims: HashMap<Uuid, ClaimRequest>,
    memories: HashMap<Uuid, Memory>,
    // Audit entries bucketed by UTC day, append-only.
    audits: BTreeMap<String, Vec<AuditEntry>>,
}

/// In-memory datastore backing local runs and every test. A document-DB
/// adapter for production deployments sits behind the same trait.
#[derive(Default)]
pub struct MemDatastore {
    inner: RwLock<MemDatastoreInner>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim_count(&self) -> usize {
        self.inner.read().claims.len()
    }

    pub fn memory(&self, memory_id: Uuid) -> Option<Memory> {
        self.inner.read().memories.get(&memory_id).cloned()
    }

    pub fn memory_count(&self) -> usize {
        self.inner.read().memories.len()
    }

    pub fn audit_entries(&self, day: &str) -> Vec<AuditEntry> {
        self.inner
            .read()
            .audits
            .get(day)
            .cloned()
            .unwrap_or_default()
    }

    /// Audit event names recorded for one request, in append order.
    pub fn audit_events_for(&self, request_id: Uuid) -> Vec<String> {
        self.inner
            .read()
            .audits
            .values()
            .flatten()
            .filter(|entry| entry.request_id == request_id)
            .map(|entry| entry.event.clone())
            .collect()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn create_claim_request(&self, request: &ClaimRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.claims.contains_key(&request.request_id) {
            return Err(StoreError::Backend(format!(
                "Duplicate request id {}",
                request.request_id
            )));
        }
        inner.claims.insert(request.request_id, request.clone());
        Ok(())
    }

    async fn get_claim_request(&self, request_id: Uuid) -> Result<ClaimRequest, StoreError> {
        self.inner
            .read()
            .claims
            .get(&request_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn transition(
        &self,
        request_id: Uuid,
        expected: ClaimStatus,
        update: TransitionUpdate,
    ) -> Result<ClaimRequest, StoreError> {
        let mut inner = self.inner.write();
        let claim = inner.claims.get_mut(&request_id).ok_or(StoreError::NotFound)?;

        if claim.status != expected {
            return Err(StoreError::PreconditionFailed {
                actual: claim.status,
            });
        }
        if !claim.status.can_transition_to(update.status) {
            return Err(StoreError::PreconditionFailed {
                actual: claim.status,
            });
        }

        claim.status = update.status;
        claim.updated_at = Utc::now();
        if let Some(at) = update.sent_at {
            claim.sent_at = Some(at);
        }
        if let Some(at) = update.claimed_at {
            claim.claimed_at = Some(at);
        }
        if let Some(uid) = update.claimed_by_uid {
            claim.claimed_by_uid = Some(uid);
        }
        if let Some(memory_id) = update.memory_id {
            claim.memory_id = Some(memory_id);
        }

        Ok(claim.clone())
    }

    async fn set_email(
        &self,
        request_id: Uuid,
        new_email: &str,
    ) -> Result<ClaimRequest, StoreError> {
        let mut inner = self.inner.write();
        let claim = inner.claims.get_mut(&request_id).ok_or(StoreError::NotFound)?;

        if !matches!(claim.status, ClaimStatus::Pending | ClaimStatus::Sent) {
            return Err(StoreError::PreconditionFailed {
                actual: claim.status,
            });
        }

        claim.email = new_email.to_string();
        claim.updated_at = Utc::now();
        Ok(claim.clone())
    }

    async fn mark_email_change_requested(
        &self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ClaimRequest, StoreError> {
        let mut inner = self.inner.write();
        let claim = inner.claims.get_mut(&request_id).ok_or(StoreError::NotFound)?;
        claim.email_change_requested_at = Some(at);
        claim.updated_at = at;
        Ok(claim.clone())
    }

    async fn has_active_request_since(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.read();
        Ok(inner.claims.values().any(|claim| {
            claim.email.eq_ignore_ascii_case(email)
                && matches!(claim.status, ClaimStatus::Pending | ClaimStatus::Sent)
                && claim.created_at >= since
        }))
    }

    async fn create_memory(&self, memory: &Memory) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.memories.contains_key(&memory.id) {
            return Err(StoreError::Backend(format!(
                "Duplicate memory id {}",
                memory.id
            )));
        }
        inner.memories.insert(memory.id, memory.clone());
        Ok(())
    }

    async fn delete_memory(&self, memory_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .memories
            .remove(&memory_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .audits
            .entry(entry.day.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use memory_gate_claim::ClaimSource;

    async fn seeded(store: &MemDatastore) -> ClaimRequest {
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);
        store.create_claim_request(&request).await.unwrap();
        request
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemDatastore::new();
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);
        store.create_claim_request(&request).await.unwrap();

        let loaded = store.get_claim_request(request.request_id).await.unwrap();
        assert_eq!(loaded.email, "a@x.com");
        assert_eq!(loaded.status, ClaimStatus::Pending);

        assert!(matches!(
            store.get_claim_request(Uuid::new_v4()).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_transition_cas_success_and_mismatch() {
        let store = MemDatastore::new();
        let request = seeded(&store).await;
        let now = Utc::now();

        let updated = store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(now),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, ClaimStatus::Sent);
        assert_eq!(updated.sent_at, Some(now));

        // Expecting pending again fails and reports the actual status.
        let error = store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            StoreError::PreconditionFailed {
                actual: ClaimStatus::Sent
            }
        ));
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_move() {
        let store = MemDatastore::new();
        let request = seeded(&store).await;

        // pending -> claimed is not a legal move even with a matching CAS.
        let error = store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Claimed),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_claim_fields_set_together() {
        let store = MemDatastore::new();
        let request = seeded(&store).await;
        let now = Utc::now();
        let memory_id = Uuid::new_v4();

        store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(now),
            )
            .await
            .unwrap();
        let claimed = store
            .transition(
                request.request_id,
                ClaimStatus::Sent,
                TransitionUpdate::to(ClaimStatus::Claimed).with_claim(now, "uid-1", memory_id),
            )
            .await
            .unwrap();

        assert_eq!(claimed.status, ClaimStatus::Claimed);
        assert_eq!(claimed.claimed_at, Some(now));
        assert_eq!(claimed.claimed_by_uid.as_deref(), Some("uid-1"));
        assert_eq!(claimed.memory_id, Some(memory_id));
    }

    #[tokio::test]
    async fn test_set_email_guard() {
        let store = MemDatastore::new();
        let request = seeded(&store).await;
        let now = Utc::now();

        let updated = store
            .set_email(request.request_id, "b@x.com")
            .await
            .unwrap();
        assert_eq!(updated.email, "b@x.com");

        store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(now),
            )
            .await
            .unwrap();
        store
            .transition(
                request.request_id,
                ClaimStatus::Sent,
                TransitionUpdate::to(ClaimStatus::Claimed).with_claim(now, "u", Uuid::new_v4()),
            )
            .await
            .unwrap();

        let error = store
            .set_email(request.request_id, "c@x.com")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            StoreError::PreconditionFailed {
                actual: ClaimStatus::Claimed
            }
        ));
    }

    #[tokio::test]
    async fn test_active_request_window() {
        let store = MemDatastore::new();
        let request = seeded(&store).await;
        let now = Utc::now();

        assert!(
            store
                .has_active_request_since("a@x.com", now - Duration::hours(1))
                .await
                .unwrap()
        );
        // Case-insensitive address match.
        assert!(
            store
                .has_active_request_since("A@X.COM", now - Duration::hours(1))
                .await
                .unwrap()
        );
        assert!(
            !store
                .has_active_request_since("other@x.com", now - Duration::hours(1))
                .await
                .unwrap()
        );
        // Outside the window.
        assert!(
            !store
                .has_active_request_since("a@x.com", now + Duration::seconds(5))
                .await
                .unwrap()
        );

        // Terminal rows no longer count as active.
        store
            .transition(
                request.request_id,
                ClaimStatus::Pending,
                TransitionUpdate::to(ClaimStatus::Sent).with_sent_at(now),
            )
            .await
            .unwrap();
        store
            .transition(
                request.request_id,
                ClaimStatus::Sent,
                TransitionUpdate::to(ClaimStatus::Expired),
            )
            .await
            .unwrap();
        assert!(
            !store
                .has_active_request_since("a@x.com", now - Duration::hours(1))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_memory_create_and_rollback() {
        let store = MemDatastore::new();
        let memory = Memory::draft("uid-1", "t1", "lp1");

        store.create_memory(&memory).await.unwrap();
        assert!(store.memory(memory.id).is_some());
        assert_eq!(store.memory(memory.id).unwrap().status, "draft");

        store.delete_memory(memory.id).await.unwrap();
        assert!(store.memory(memory.id).is_none());
        assert!(matches!(
            store.delete_memory(memory.id).await,
            Err(StoreError::NotFound)
        ));
    }
}
