use crate::error::TokenError;
use crate::header::{ALG_AES_256_GCM, HEADER_SIZE, TAG_SIZE, TokenHeader};
use crate::token::{TokenKind, TokenPayloadV1, now_unix};
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Key, Nonce};
use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
struct TokenCodecInner {
    keys: HashMap<u8, [u8; 32]>,
    current_kid: u8,
}

impl TokenCodecInner {
    fn new() -> Self {
        let mut keys = HashMap::new();

        // Generate initial key for kid=1
        let mut key = [0u8; 32];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut key);
        keys.insert(1, key);

        Self {
            keys,
            current_kid: 1,
        }
    }

    fn from_keys(keys: Vec<(u8, [u8; 32])>) -> Self {
        if keys.is_empty() {
            return Self::new();
        };

        let keys = keys.into_iter().collect::<HashMap<_, _>>();
        let current_kid = keys.keys().min().copied().expect("Must has key");

        Self { keys, current_kid }
    }

    fn add_key(&mut self, kid: u8, key: [u8; 32]) -> Result<()> {
        if self.keys.contains_key(&kid) {
            return Err(anyhow!("Key ID {} already exists", kid));
        }
        self.keys.insert(kid, key);
        Ok(())
    }

    fn set_current_kid(&mut self, kid: u8) -> Result<()> {
        if !self.keys.contains_key(&kid) {
            return Err(anyhow!("Key ID {} not found", kid));
        }
        self.current_kid = kid;
        Ok(())
    }

    /// Sign a payload and return the base64url-encoded token
    fn sign(&self, payload: &TokenPayloadV1) -> Result<String> {
        let key = self
            .keys
            .get(&self.current_kid)
            .ok_or_else(|| anyhow!("Key ID {} not found", self.current_kid))?;

        // Create header
        let header = TokenHeader::new(self.current_kid, ALG_AES_256_GCM);
        let header_bytes = header.to_bytes();

        // Serialize payload
        let payload_bytes = payload.serialize_to_bytes()?;

        // Encrypt using AES-256-GCM
        let cipher_key = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(cipher_key);
        let nonce = Nonce::from_slice(&header.nonce);

        // Use header as AAD (Additional Authenticated Data)
        let ciphertext = cipher
            .encrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: &payload_bytes,
                    aad: &header_bytes,
                },
            )
            .map_err(|error| anyhow!("Encryption failed: {error}"))?;

        // Combine: header || ciphertext (includes tag)
        let mut token_bytes = header_bytes;
        token_bytes.extend_from_slice(&ciphertext);

        // Encode as base64url without padding
        Ok(URL_SAFE_NO_PAD.encode(token_bytes))
    }

    /// Verify and decode a token, enforcing kind and expiry
    fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<TokenPayloadV1, TokenError> {
        // Decode from base64url
        let token_bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| TokenError::InvalidToken)?;

        if token_bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(TokenError::InvalidToken);
        }

        // Parse header
        let header = TokenHeader::from_bytes(&token_bytes[..HEADER_SIZE])?;

        // Get the key
        let key = self
            .keys
            .get(&header.kid)
            .ok_or(TokenError::KeyNotFound(header.kid))?;

        // Extract ciphertext (includes tag)
        let ciphertext = &token_bytes[HEADER_SIZE..];

        if header.alg != ALG_AES_256_GCM {
            return Err(TokenError::InvalidHeader(format!(
                "Unsupported algorithm: {}",
                header.alg
            )));
        }

        let cipher_key = Key::<Aes256Gcm>::from_slice(key);
        let cipher = Aes256Gcm::new(cipher_key);
        let nonce = Nonce::from_slice(&header.nonce);

        // Use header as AAD
        let header_bytes = header.to_bytes();
        let payload_bytes = cipher
            .decrypt(
                nonce,
                aes_gcm::aead::Payload {
                    msg: ciphertext,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| TokenError::AeadFail)?;

        // Deserialize payload
        let payload = TokenPayloadV1::deserialize_from_bytes(&payload_bytes)?;

        if payload.kind != expected_kind {
            return Err(TokenError::UnexpectedKind(payload.kind as u8));
        }

        let now = now_unix().map_err(|_| TokenError::InvalidToken)?;
        if payload.is_expired(now) {
            return Err(TokenError::TokenExpired);
        }

        Ok(payload)
    }
}

/// Codec for minting and verifying admission tokens, with kid-based key rotation.
#[derive(Clone, Debug)]
pub struct TokenCodec {
    inner: Arc<RwLock<TokenCodecInner>>,
}

impl TokenCodec {
    /// Create a new TokenCodec with a randomly generated key
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(TokenCodecInner::new())),
        }
    }

    /// Create a TokenCodec from configuration
    /// If keys is empty, fall back to random generation
    pub fn from_keys(keys: Vec<(u8, [u8; 32])>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TokenCodecInner::from_keys(keys))),
        }
    }

    /// Add a new key for rotation
    #[allow(dead_code)]
    pub fn add_key(&self, kid: u8, key: [u8; 32]) -> Result<()> {
        self.inner.write().add_key(kid, key)
    }

    /// Set the current key ID for signing new tokens
    #[allow(dead_code)]
    pub fn set_current_kid(&self, kid: u8) -> Result<()> {
        self.inner.write().set_current_kid(kid)
    }

    /// Sign a payload and return the base64url-encoded token
    pub fn sign(&self, payload: &TokenPayloadV1) -> Result<String> {
        self.inner.read().sign(payload)
    }

    /// Verify and decode a token, enforcing kind and expiry.
    ///
    /// Any failure (bad encoding, unknown key, AEAD mismatch, wrong kind,
    /// expired) yields a typed error and never a partial payload.
    pub fn verify(&self, token: &str, expected_kind: TokenKind) -> Result<TokenPayloadV1, TokenError> {
        self.inner.read().verify(token, expected_kind)
    }
}

impl Default for TokenCodec {
    fn default() -> Self {
        Self::new()
    }
}
