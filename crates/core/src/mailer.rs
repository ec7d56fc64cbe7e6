use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

/// Which template the downstream mail service should render.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MailKind {
    Claim,
    EmailConfirm,
}

impl MailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailKind::Claim => "claim",
            MailKind::EmailConfirm => "email_confirm",
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct MailError(pub String);

/// Hands a signed link off to the mail/notification service. Best effort:
/// the core never retries the email itself, a failed dispatch surfaces to
/// the caller and the claim row stays re-drivable.
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    async fn dispatch(&self, to: &str, link: &str, kind: MailKind) -> Result<(), MailError>;
}

/// POSTs `{ to, link, kind }` to the configured mail webhook.
pub struct WebhookMailer {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookMailer {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl MailDispatcher for WebhookMailer {
    async fn dispatch(&self, to: &str, link: &str, kind: MailKind) -> Result<(), MailError> {
        let payload = json!({
            "to": to,
            "link": link,
            "kind": kind.as_str(),
        });

        match self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
        {
            Ok(response) => {
                if response.status().is_success() {
                    info!(kind = kind.as_str(), "Mail webhook called successfully");
                    Ok(())
                } else {
                    warn!(
                        kind = kind.as_str(),
                        status = %response.status(),
                        "Mail webhook returned non-success status"
                    );
                    Err(MailError(format!(
                        "mail webhook returned {}",
                        response.status()
                    )))
                }
            }
            Err(error) => {
                error!(kind = kind.as_str(), ?error, "Failed to call mail webhook");
                Err(MailError(format!("mail webhook unreachable: {error}")))
            }
        }
    }
}

/// Fallback for local runs without a configured webhook: logs the link
/// instead of sending anything.
pub struct LogMailer;

#[async_trait]
impl MailDispatcher for LogMailer {
    async fn dispatch(&self, to: &str, link: &str, kind: MailKind) -> Result<(), MailError> {
        info!(to, link, kind = kind.as_str(), "Mail dispatch (log only)");
        Ok(())
    }
}
