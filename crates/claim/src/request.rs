use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a claim request.
///
/// `pending -> sent -> {claimed | expired | canceled}`, where `sent` may
/// loop back to `sent` on resend or after an email change. `claimed`,
/// `expired` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Sent,
    Claimed,
    Expired,
    Canceled,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Sent => "sent",
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::Expired => "expired",
            ClaimStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClaimStatus::Claimed | ClaimStatus::Expired | ClaimStatus::Canceled
        )
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(&self, to: ClaimStatus) -> bool {
        match (self, to) {
            (ClaimStatus::Pending, ClaimStatus::Sent) => true,
            // Resend and email change re-arm delivery without leaving `sent`.
            (ClaimStatus::Sent, ClaimStatus::Sent) => true,
            (ClaimStatus::Sent, ClaimStatus::Claimed) => true,
            (ClaimStatus::Sent, ClaimStatus::Expired) => true,
            (ClaimStatus::Sent, ClaimStatus::Canceled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission source that produced the claim request.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ClaimSource {
    #[serde(rename = "lp-form")]
    LpForm,
    #[serde(rename = "storefront")]
    Storefront,
    #[serde(rename = "stripe")]
    Stripe,
}

impl ClaimSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimSource::LpForm => "lp-form",
            ClaimSource::Storefront => "storefront",
            ClaimSource::Stripe => "stripe",
        }
    }
}

impl std::fmt::Display for ClaimSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The admission ticket tracking one customer's path from trust signal to
/// content ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub request_id: Uuid,
    pub email: String,
    pub tenant: String,
    pub lp_id: String,
    pub product_type: String,
    pub status: ClaimStatus,
    pub source: ClaimSource,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub claimed_by_uid: Option<String>,
    pub memory_id: Option<Uuid>,
    pub email_change_requested_at: Option<DateTime<Utc>>,
}

impl ClaimRequest {
    pub fn new(
        email: impl Into<String>,
        tenant: impl Into<String>,
        lp_id: impl Into<String>,
        product_type: impl Into<String>,
        source: ClaimSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: Uuid::new_v4(),
            email: email.into(),
            tenant: tenant.into(),
            lp_id: lp_id.into(),
            product_type: product_type.into(),
            status: ClaimStatus::Pending,
            source,
            created_at: now,
            sent_at: None,
            claimed_at: None,
            updated_at: now,
            claimed_by_uid: None,
            memory_id: None,
            email_change_requested_at: None,
        }
    }

    /// Whether the delivery validity window has elapsed, measured from
    /// `sent_at` (falling back to `created_at` for never-dispatched rows).
    pub fn is_delivery_expired(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let reference = self.sent_at.unwrap_or(self.created_at);
        now - reference > window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use ClaimStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Claimed));
        assert!(Sent.can_transition_to(Expired));
        assert!(Sent.can_transition_to(Canceled));

        // No shortcuts from pending and nothing leaves a terminal state.
        assert!(!Pending.can_transition_to(Claimed));
        assert!(!Pending.can_transition_to(Expired));
        assert!(!Claimed.can_transition_to(Sent));
        assert!(!Claimed.can_transition_to(Expired));
        assert!(!Expired.can_transition_to(Sent));
        assert!(!Expired.can_transition_to(Claimed));
        assert!(!Canceled.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ClaimStatus::Pending.is_terminal());
        assert!(!ClaimStatus::Sent.is_terminal());
        assert!(ClaimStatus::Claimed.is_terminal());
        assert!(ClaimStatus::Expired.is_terminal());
        assert!(ClaimStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&ClaimStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::from_str::<ClaimStatus>("\"claimed\"").unwrap(),
            ClaimStatus::Claimed
        );
        assert_eq!(
            serde_json::to_string(&ClaimSource::LpForm).unwrap(),
            "\"lp-form\""
        );
    }

    #[test]
    fn test_new_request_defaults() {
        let request = ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);

        assert_eq!(request.status, ClaimStatus::Pending);
        assert_eq!(request.email, "a@x.com");
        assert!(request.sent_at.is_none());
        assert!(request.claimed_at.is_none());
        assert!(request.claimed_by_uid.is_none());
        assert!(request.memory_id.is_none());
    }

    #[test]
    fn test_delivery_window() {
        let mut request =
            ClaimRequest::new("a@x.com", "t1", "lp1", "standard", ClaimSource::LpForm);
        let now = Utc::now();
        request.sent_at = Some(now - Duration::hours(73));

        assert!(request.is_delivery_expired(Duration::hours(72), now));

        request.sent_at = Some(now - Duration::hours(71));
        assert!(!request.is_delivery_expired(Duration::hours(72), now));

        // Falls back to created_at when never dispatched.
        request.sent_at = None;
        request.created_at = now - Duration::hours(73);
        assert!(request.is_delivery_expired(Duration::hours(72), now));
    }
}
