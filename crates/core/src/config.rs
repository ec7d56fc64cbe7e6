use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::ArgAction::Append;
use clap::Parser;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure that can be loaded from CLI or config file
///
/// Example configuration file content
/// # Memory Gate Configuration
///
/// # Server configuration
/// listen_on_port = 32150
///
/// # Link targets
/// claim_base_url = "https://app.example.com/claim"
/// confirm_base_url = "https://app.example.com/claim/email-change/confirm"
/// redirect_base_url = "https://app.example.com/memories"
///
/// # Mail webhook (optional, logs links when unset)
/// mail_webhook_url = "https://mail.example.com/send"
///
/// # Trust signal secrets
/// captcha_secret = "..."
/// storefront_secret = "..."
/// stripe_webhook_secret = "whsec_..."
/// identity_secret = "..."
///
/// # Origin -> tenant routing
/// [tenants]
/// "https://shopA.example.com" = "shop-a"
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 32150)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// Tenant used when neither the request nor the origin map names one
    #[arg(long, default_value = "default")]
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    /// Origin -> tenant routing table (config file only)
    #[arg(skip)]
    #[serde(default)]
    pub tenants: HashMap<String, String>,

    /// Base URL the claim link points at
    #[arg(long, default_value = "http://localhost:32150/claim")]
    #[serde(default = "default_claim_base_url")]
    pub claim_base_url: String,

    /// Base URL the email-change confirmation link points at
    #[arg(
        long,
        default_value = "http://localhost:32150/claim/email-change/confirm"
    )]
    #[serde(default = "default_confirm_base_url")]
    pub confirm_base_url: String,

    /// Base URL a successful exchange redirects to, memory id appended
    #[arg(long, default_value = "http://localhost:32150/memories")]
    #[serde(default = "default_redirect_base_url")]
    pub redirect_base_url: String,

    /// Mail webhook URL, links are logged instead of sent when unset
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail_webhook_url: Option<String>,

    /// CAPTCHA verification endpoint
    #[arg(long, default_value = "https://www.google.com/recaptcha/api/siteverify")]
    #[serde(default = "default_captcha_verify_url")]
    pub captcha_verify_url: String,

    /// CAPTCHA shared secret
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub captcha_secret: String,

    /// Minimum CAPTCHA score to accept
    #[arg(long, default_value_t = 0.5)]
    #[serde(default = "default_captcha_min_score")]
    pub captcha_min_score: f64,

    /// Storefront token shared secret
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub storefront_secret: String,

    /// Maximum storefront token age in seconds
    #[arg(long, default_value_t = 600)]
    #[serde(default = "default_storefront_max_age_secs")]
    pub storefront_max_age_secs: i64,

    /// Stripe webhook signing secret
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub stripe_webhook_secret: String,

    /// Allowed Stripe signature timestamp skew in seconds
    #[arg(long, default_value_t = 300)]
    #[serde(default = "default_stripe_tolerance_secs")]
    pub stripe_tolerance_secs: i64,

    /// Identity assertion shared secret
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub identity_secret: String,

    /// Claim token lifetime in seconds
    #[arg(long, default_value_t = memory_gate_claim::CLAIM_TOKEN_TTL_SECS)]
    #[serde(default = "default_claim_token_ttl_secs")]
    pub claim_token_ttl_secs: u32,

    /// Email-confirm token lifetime in seconds
    #[arg(long, default_value_t = memory_gate_claim::EMAIL_CONFIRM_TTL_SECS)]
    #[serde(default = "default_email_confirm_ttl_secs")]
    pub email_confirm_ttl_secs: u32,

    /// How long a sent claim stays redeemable, in seconds
    #[arg(long, default_value_t = 259_200)]
    #[serde(default = "default_delivery_window_secs")]
    pub delivery_window_secs: i64,

    /// Trailing admission rate-limit window in seconds
    #[arg(long, default_value_t = 3600)]
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: i64,

    /// Trailing email-change rate-limit window in seconds
    #[arg(long, default_value_t = 3600)]
    #[serde(default = "default_email_change_window_secs")]
    pub email_change_window_secs: i64,

    /// Token signing keys configuration (kid -> base64 encoded 32-byte key).
    /// Can be specified multiple times as --token-key 1:base64key.
    /// You can generate a key with: openssl rand -base64 32
    #[arg(long = "token-key", value_parser = parse_token_key, action = Append)]
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "de_token_keys"
    )]
    pub token_keys: Vec<(u8, [u8; 32])>,
}

/// Parse token key from command line format "kid:base64_key"
fn parse_token_key(s: &str) -> Result<(u8, [u8; 32]), String> {
    let parts: Vec<&str> = s.splitn(2, ':').collect();
    if parts.len() != 2 {
        return Err("Invalid format. Use kid:base64_key".to_string());
    }

    let kid = parts[0];
    let kid = kid
        .parse::<u8>()
        .map_err(|_| format!("Invalid kid '{kid}'. Must be a number between 0-255"))?;

    let key_bytes = STANDARD
        .decode(parts[1])
        .map_err(|error| format!("Failed to decode base64 key for {kid}: {error}"))?;

    if key_bytes.len() != 32 {
        return Err(format!(
            "Invalid key length for kid {kid}: expected 32 bytes, got {}",
            key_bytes.len()
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&key_bytes);

    Ok((kid, key))
}

fn de_token_keys<'de, D>(de: D) -> Result<Vec<(u8, [u8; 32])>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut out: Vec<(u8, [u8; 32])> = Vec::new();

    let repr = Option::<HashMap<String, String>>::deserialize(de)?;
    let Some(repr) = repr else {
        return Ok(out);
    };

    for (kstr, v) in repr {
        let kid: u8 = kstr.parse().map_err(serde::de::Error::custom)?;
        let bytes = STANDARD.decode(v).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom(format!(
                "token_keys[{kid}] length {}, expect 32",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        out.push((kid, arr));
    }

    out.sort_unstable_by_key(|(k, _)| *k);
    out.dedup_by_key(|(k, _)| *k);

    Ok(out)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            config: None,
            default_tenant: default_tenant(),
            tenants: HashMap::new(),
            claim_base_url: default_claim_base_url(),
            confirm_base_url: default_confirm_base_url(),
            redirect_base_url: default_redirect_base_url(),
            mail_webhook_url: None,
            captcha_verify_url: default_captcha_verify_url(),
            captcha_secret: String::new(),
            captcha_min_score: default_captcha_min_score(),
            storefront_secret: String::new(),
            storefront_max_age_secs: default_storefront_max_age_secs(),
            stripe_webhook_secret: String::new(),
            stripe_tolerance_secs: default_stripe_tolerance_secs(),
            identity_secret: String::new(),
            claim_token_ttl_secs: default_claim_token_ttl_secs(),
            email_confirm_ttl_secs: default_email_confirm_ttl_secs(),
            delivery_window_secs: default_delivery_window_secs(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            email_change_window_secs: default_email_change_window_secs(),
            token_keys: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> anyhow::Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.default_tenant == default_tenant() {
            self.default_tenant = file_config.default_tenant;
        }
        if self.claim_base_url == default_claim_base_url() {
            self.claim_base_url = file_config.claim_base_url;
        }
        if self.confirm_base_url == default_confirm_base_url() {
            self.confirm_base_url = file_config.confirm_base_url;
        }
        if self.redirect_base_url == default_redirect_base_url() {
            self.redirect_base_url = file_config.redirect_base_url;
        }
        if self.captcha_verify_url == default_captcha_verify_url() {
            self.captcha_verify_url = file_config.captcha_verify_url;
        }
        if self.captcha_secret.is_empty() {
            self.captcha_secret = file_config.captcha_secret;
        }
        if self.captcha_min_score == default_captcha_min_score() {
            self.captcha_min_score = file_config.captcha_min_score;
        }
        if self.storefront_secret.is_empty() {
            self.storefront_secret = file_config.storefront_secret;
        }
        if self.storefront_max_age_secs == default_storefront_max_age_secs() {
            self.storefront_max_age_secs = file_config.storefront_max_age_secs;
        }
        if self.stripe_webhook_secret.is_empty() {
            self.stripe_webhook_secret = file_config.stripe_webhook_secret;
        }
        if self.stripe_tolerance_secs == default_stripe_tolerance_secs() {
            self.stripe_tolerance_secs = file_config.stripe_tolerance_secs;
        }
        if self.identity_secret.is_empty() {
            self.identity_secret = file_config.identity_secret;
        }
        if self.claim_token_ttl_secs == default_claim_token_ttl_secs() {
            self.claim_token_ttl_secs = file_config.claim_token_ttl_secs;
        }
        if self.email_confirm_ttl_secs == default_email_confirm_ttl_secs() {
            self.email_confirm_ttl_secs = file_config.email_confirm_ttl_secs;
        }
        if self.delivery_window_secs == default_delivery_window_secs() {
            self.delivery_window_secs = file_config.delivery_window_secs;
        }
        if self.rate_limit_window_secs == default_rate_limit_window_secs() {
            self.rate_limit_window_secs = file_config.rate_limit_window_secs;
        }
        if self.email_change_window_secs == default_email_change_window_secs() {
            self.email_change_window_secs = file_config.email_change_window_secs;
        }

        // For Option/collection fields, CLI takes precedence if set
        if self.mail_webhook_url.is_none() {
            self.mail_webhook_url = file_config.mail_webhook_url;
        }
        if self.tenants.is_empty() {
            self.tenants = file_config.tenants;
        }
        if self.token_keys.is_empty() {
            self.token_keys = file_config.token_keys;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [
            ("claim_base_url", &self.claim_base_url),
            ("confirm_base_url", &self.confirm_base_url),
            ("redirect_base_url", &self.redirect_base_url),
            ("captcha_verify_url", &self.captcha_verify_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "{name} must start with http:// or https://"
                ));
            }
        }

        if let Some(webhook_url) = &self.mail_webhook_url {
            if webhook_url.is_empty() {
                return Err(anyhow::anyhow!("Mail webhook URL cannot be empty"));
            }
            if !webhook_url.starts_with("http://") && !webhook_url.starts_with("https://") {
                return Err(anyhow::anyhow!(
                    "Mail webhook URL must start with http:// or https://"
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.captcha_min_score) {
            return Err(anyhow::anyhow!(
                "captcha_min_score must be between 0.0 and 1.0"
            ));
        }

        if self.claim_token_ttl_secs == 0 || self.email_confirm_ttl_secs == 0 {
            return Err(anyhow::anyhow!("Token lifetimes must be positive"));
        }

        if self.delivery_window_secs <= 0 {
            return Err(anyhow::anyhow!("delivery_window_secs must be positive"));
        }

        Ok(())
    }

    pub fn get_token_key(&self, kid: u8) -> Option<[u8; 32]> {
        self.token_keys
            .iter()
            .find(|(k, _)| *k == kid)
            .map(|(_, key)| *key)
    }
}

// Default value functions
fn default_port() -> u16 {
    32150
}

fn default_tenant() -> String {
    "default".to_string()
}

fn default_claim_base_url() -> String {
    "http://localhost:32150/claim".to_string()
}

fn default_confirm_base_url() -> String {
    "http://localhost:32150/claim/email-change/confirm".to_string()
}

fn default_redirect_base_url() -> String {
    "http://localhost:32150/memories".to_string()
}

fn default_captcha_verify_url() -> String {
    "https://www.google.com/recaptcha/api/siteverify".to_string()
}

fn default_captcha_min_score() -> f64 {
    0.5
}

fn default_storefront_max_age_secs() -> i64 {
    600
}

fn default_stripe_tolerance_secs() -> i64 {
    300
}

fn default_claim_token_ttl_secs() -> u32 {
    memory_gate_claim::CLAIM_TOKEN_TTL_SECS
}

fn default_email_confirm_ttl_secs() -> u32 {
    memory_gate_claim::EMAIL_CONFIRM_TTL_SECS
}

fn default_delivery_window_secs() -> i64 {
    259_200
}

fn default_rate_limit_window_secs() -> i64 {
    3600
}

fn default_email_change_window_secs() -> i64 {
    3600
}
