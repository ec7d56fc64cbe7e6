use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use memory_gate_core::Config;
use sha2::Sha256;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::OnceCell;
use tokio::time::sleep;

pub static SHARED_SERVER: OnceCell<TestServer> = OnceCell::const_new();

/// Fixed token signing key so tests can mint their own tokens.
pub const TEST_TOKEN_KEY: [u8; 32] = [7u8; 32];
pub const IDENTITY_SECRET: &[u8] = b"test-identity-secret";
pub const STOREFRONT_SECRET: &[u8] = b"test-storefront-secret";
pub const STRIPE_SECRET: &[u8] = b"whsec_test";

/// Test harness that manages the server process
pub struct TestServer {
    _handle: JoinHandle<()>,
    port: u16,
    pub mail: MailSink,
    pub captcha: MockCaptcha,
}

impl TestServer {
    /// Get or create shared test server instance
    pub async fn shared() -> &'static TestServer {
        SHARED_SERVER
            .get_or_init(|| async { Self::start(|_| {}).await })
            .await
    }

    /// Get or create shared test server with a config tweak. Each test
    /// binary gets its own shared instance, so the tweak applies to every
    /// test in the file.
    pub async fn shared_with(tweak: fn(&mut Config)) -> &'static TestServer {
        SHARED_SERVER
            .get_or_init(|| async { Self::start(tweak).await })
            .await
    }

    async fn start(tweak: fn(&mut Config)) -> Self {
        // Only open when debugging
        let _ = tracing_subscriber::fmt().try_init();

        let port = portpicker::pick_unused_port().expect("No available port");
        let mail = MailSink::start().await;
        let captcha = MockCaptcha::start().await;

        let mut config = Config {
            listen_on_port: port,
            mail_webhook_url: Some(mail.url()),
            captcha_verify_url: captcha.url(),
            captcha_secret: "captcha-secret".to_string(),
            storefront_secret: String::from_utf8_lossy(STOREFRONT_SECRET).into_owned(),
            stripe_webhook_secret: String::from_utf8_lossy(STRIPE_SECRET).into_owned(),
            identity_secret: String::from_utf8_lossy(IDENTITY_SECRET).into_owned(),
            token_keys: vec![(1, TEST_TOKEN_KEY)],
            ..Default::default()
        };
        tweak(&mut config);

        // Spawn the server in a separate thread with its own runtime
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                memory_gate_core::run(config).await;
            });
        });

        let server = TestServer {
            _handle: handle,
            port,
            mail,
            captcha,
        };

        // Poll until server is ready
        let client = server.client();
        sleep(Duration::from_millis(1)).await;
        for _ in 0..200 {
            if let Ok(response) = client
                .get(format!("{}/healthz", server.url()))
                .send()
                .await
                && response.status().is_success()
            {
                break;
            }

            sleep(Duration::from_millis(10)).await;
        }

        server
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    /// Mint an identity assertion the server's provider accepts.
    pub fn identity_assertion(&self, uid: &str, email: &str) -> String {
        let exp = now_unix() + 300;
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({ "uid": uid, "email": email, "exp": exp }))
                .unwrap(),
        );
        format!("{payload}.{}", hmac_hex(IDENTITY_SECRET, payload.as_bytes()))
    }

    /// Mint a storefront token the server's verifier accepts.
    pub fn storefront_token(&self, store_id: &str) -> String {
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&serde_json::json!({
                "store_id": store_id,
                "issued_at": now_unix(),
            }))
            .unwrap(),
        );
        format!(
            "{payload}.{}",
            hmac_hex(STOREFRONT_SECRET, payload.as_bytes())
        )
    }

    /// Build a Stripe-style signature header over `body`.
    pub fn stripe_signature(&self, body: &[u8]) -> String {
        let t = now_unix();
        let mut mac = <Hmac<Sha256>>::new_from_slice(STRIPE_SECRET).unwrap();
        mac.update(t.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        format!("t={t},v1={}", hex::encode(mac.finalize().into_bytes()))
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn hmac_hex(secret: &[u8], data: &[u8]) -> String {
    let mut mac = <Hmac<Sha256>>::new_from_slice(secret).unwrap();
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Captures the `{ to, link, kind }` payloads the server would hand to the
/// mail service.
pub struct MailSink {
    _handle: JoinHandle<()>,
    pub port: u16,
    pub received_calls: std::sync::Arc<tokio::sync::Mutex<Vec<serde_json::Value>>>,
}

impl MailSink {
    pub async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("No available port for mail sink");
        let received_calls = std::sync::Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let received_calls_clone = received_calls.clone();

        // Run on a dedicated runtime so the sink outlives any single
        // `#[tokio::test]` runtime that happens to initialize the shared
        // server.
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                use warp::Filter;

                let mail = warp::path("mail")
                    .and(warp::post())
                    .and(warp::body::json())
                    .map(move |body: serde_json::Value| {
                        let received_calls = received_calls_clone.clone();
                        tokio::spawn(async move {
                            received_calls.lock().await.push(body);
                        });
                        warp::reply::with_status("OK", warp::http::StatusCode::OK)
                    });

                warp::serve(mail).run(([127, 0, 0, 1], port)).await;
            });
        });

        // Wait a bit for server to start
        sleep(Duration::from_millis(100)).await;

        MailSink {
            _handle: handle,
            port,
            received_calls,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/mail", self.port)
    }

    pub async fn get_calls(&self) -> Vec<serde_json::Value> {
        self.received_calls.lock().await.clone()
    }

    /// Wait for a mail of `kind` addressed to `to` and return its link.
    pub async fn wait_for_link(&self, to: &str, kind: &str, timeout_secs: u64) -> Option<String> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_secs(timeout_secs) {
            let calls = self.received_calls.lock().await;
            if let Some(call) = calls
                .iter()
                .rev()
                .find(|call| call["to"] == to && call["kind"] == kind)
            {
                return call["link"].as_str().map(str::to_string);
            }
            drop(calls);
            sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

/// Extract the token query parameter from a claim or confirmation link.
pub fn token_from_link(link: &str) -> String {
    link.split_once("token=")
        .map(|(_, token)| token.to_string())
        .expect("link carries no token")
}

/// CAPTCHA verification endpoint that accepts everything except the
/// literal response "invalid".
pub struct MockCaptcha {
    _handle: JoinHandle<()>,
    pub port: u16,
}

impl MockCaptcha {
    pub async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("No available port for captcha");

        // Run on a dedicated runtime so the mock outlives any single
        // `#[tokio::test]` runtime that happens to initialize the shared
        // server.
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                use std::collections::HashMap;
                use warp::Filter;

                let verify = warp::path("siteverify")
                    .and(warp::post())
                    .and(warp::body::form())
                    .map(|form: HashMap<String, String>| {
                        let success = form.get("response").map(String::as_str) != Some("invalid");
                        warp::reply::json(&serde_json::json!({
                            "success": success,
                            "score": 0.9,
                        }))
                    });

                warp::serve(verify).run(([127, 0, 0, 1], port)).await;
            });
        });

        sleep(Duration::from_millis(100)).await;

        MockCaptcha {
            _handle: handle,
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/siteverify", self.port)
    }
}
