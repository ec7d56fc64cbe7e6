use crate::error::GateError;
use crate::store::Datastore;
use chrono::{Duration, Utc};
use memory_gate_claim::ClaimRequest;
use std::sync::Arc;
use tracing::warn;

/// Trailing-window limits on admission and email-change requests.
///
/// Admission is a read-then-write check against the store and best effort
/// under concurrency; the status CAS downstream is the real arbiter of
/// anything that must be exact.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Datastore>,
    admission_window: Duration,
    email_change_window: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn Datastore>,
        admission_window_secs: i64,
        email_change_window_secs: i64,
    ) -> Self {
        Self {
            store,
            admission_window: Duration::seconds(admission_window_secs),
            email_change_window: Duration::seconds(email_change_window_secs),
        }
    }

    /// Reject when an active request for this address already exists inside
    /// the trailing window.
    pub async fn check_admission(&self, email: &str) -> Result<(), GateError> {
        let since = Utc::now() - self.admission_window;
        let active = self
            .store
            .has_active_request_since(email, since)
            .await
            .map_err(|error| GateError::Internal(error.to_string()))?;

        if active {
            warn!("Admission rate limit hit");
            return Err(GateError::RateLimited);
        }
        Ok(())
    }

    /// Reject when an email change was already requested for this row inside
    /// the trailing window.
    pub fn check_email_change(&self, request: &ClaimRequest) -> Result<(), GateError> {
        if let Some(at) = request.email_change_requested_at
            && Utc::now() - at < self.email_change_window
        {
            warn!(request_id = %request.request_id, "Email change rate limit hit");
            return Err(GateError::RateLimited);
        }
        Ok(())
    }
}
