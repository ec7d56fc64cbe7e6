use crate::Config;
use crate::admission::{
    AdmissionVerifier, CaptchaVerifier, StorefrontVerifier, StripeWebhookVerifier,
};
use crate::audit::AuditRecorder;
use crate::email_change::EmailChangeService;
use crate::exchange::ExchangeService;
use crate::gate::GateService;
use crate::identity::HmacIdentityProvider;
use crate::mailer::{LogMailer, MailDispatcher, WebhookMailer};
use crate::rate_limit::RateLimiter;
use crate::store::{Datastore, MemDatastore};
use memory_gate_claim::TokenCodec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<GateService>,
    pub exchange: Arc<ExchangeService>,
    pub email_change: Arc<EmailChangeService>,
    tenants: Arc<HashMap<String, String>>,
    default_tenant: String,
}

impl AppState {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Datastore> = Arc::new(MemDatastore::new());

        let codec = if config.token_keys.is_empty() {
            warn!("No token keys configured, generating an ephemeral key");
            TokenCodec::new()
        } else {
            TokenCodec::from_keys(config.token_keys.clone())
        };

        let client = reqwest::Client::new();

        let mailer: Arc<dyn MailDispatcher> = match &config.mail_webhook_url {
            Some(url) => Arc::new(WebhookMailer::new(client.clone(), url.clone())),
            None => {
                info!("No mail webhook configured, claim links will only be logged");
                Arc::new(LogMailer)
            }
        };

        let audit = AuditRecorder::new(store.clone());
        let rate_limiter = RateLimiter::new(
            store.clone(),
            config.rate_limit_window_secs,
            config.email_change_window_secs,
        );
        let identity = Arc::new(HmacIdentityProvider::new(
            config.identity_secret.as_bytes().to_vec(),
        ));

        let captcha: Arc<dyn AdmissionVerifier> = Arc::new(CaptchaVerifier::new(
            client.clone(),
            config.captcha_verify_url.clone(),
            config.captcha_secret.clone(),
            config.captcha_min_score,
        ));
        let storefront: Arc<dyn AdmissionVerifier> = Arc::new(StorefrontVerifier::new(
            config.storefront_secret.as_bytes().to_vec(),
            config.storefront_max_age_secs,
        ));
        let stripe = StripeWebhookVerifier::new(
            config.stripe_webhook_secret.as_bytes().to_vec(),
            config.stripe_tolerance_secs,
        );

        let gate = Arc::new(GateService::new(
            store.clone(),
            codec.clone(),
            audit.clone(),
            rate_limiter.clone(),
            mailer.clone(),
            captcha,
            storefront,
            stripe,
            config.claim_base_url.clone(),
            config.claim_token_ttl_secs,
        ));

        let exchange = Arc::new(ExchangeService::new(
            store.clone(),
            codec.clone(),
            identity.clone(),
            audit.clone(),
            config.delivery_window_secs,
            config.redirect_base_url.clone(),
        ));

        let email_change = Arc::new(EmailChangeService::new(
            store,
            codec,
            identity,
            audit,
            rate_limiter,
            mailer,
            config.confirm_base_url.clone(),
            config.claim_base_url.clone(),
            config.email_confirm_ttl_secs,
            config.claim_token_ttl_secs,
        ));

        Ok(Self {
            gate,
            exchange,
            email_change,
            tenants: Arc::new(config.tenants.clone()),
            default_tenant: config.default_tenant.clone(),
        })
    }

    /// Tenant routing: an explicit tenant on the request wins, then the
    /// Origin map, then the configured default.
    pub fn resolve_tenant(&self, explicit: Option<&str>, origin: Option<&str>) -> String {
        if let Some(tenant) = explicit
            && !tenant.is_empty()
        {
            return tenant.to_string();
        }
        if let Some(origin) = origin
            && let Some(tenant) = self.tenants.get(origin)
        {
            return tenant.clone();
        }
        self.default_tenant.clone()
    }
}
