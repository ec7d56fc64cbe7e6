use crate::error::TokenError;
use anyhow::{Result, anyhow};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Fixed portion of the payload: kind(1) + iat(4) + exp(4) + request_id(16) + email_len(2)
const FIXED_SIZE: usize = 27;

/// What a token authorizes once verified.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum TokenKind {
    /// Grants one exchange of a claim request for memory ownership.
    Claim = 1,
    /// Confirms a pending email change on a claim request.
    EmailConfirm = 2,
}

impl TokenKind {
    pub fn from_u8(value: u8) -> Result<Self, TokenError> {
        match value {
            1 => Ok(TokenKind::Claim),
            2 => Ok(TokenKind::EmailConfirm),
            other => Err(TokenError::UnexpectedKind(other)),
        }
    }
}

/// Token payload (to be encrypted)
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPayloadV1 {
    pub kind: TokenKind,
    /// Issued-at time in Unix timestamp
    pub iat_unix: u32,
    /// Expiration time in Unix timestamp
    pub exp_unix: u32,
    /// Claim request this token refers to
    pub request_id: Uuid,
    /// New address carried by email-confirm tokens, empty for claim tokens
    pub email: Option<String>,
}

impl TokenPayloadV1 {
    /// Build a claim token payload valid for `ttl_secs` from now.
    pub fn claim(request_id: Uuid, ttl_secs: u32) -> Result<Self> {
        let now = now_unix()?;
        Ok(Self {
            kind: TokenKind::Claim,
            iat_unix: now,
            exp_unix: now.saturating_add(ttl_secs),
            request_id,
            email: None,
        })
    }

    /// Build an email-confirm token payload carrying the proposed address.
    pub fn email_confirm(request_id: Uuid, email: impl Into<String>, ttl_secs: u32) -> Result<Self> {
        let now = now_unix()?;
        Ok(Self {
            kind: TokenKind::EmailConfirm,
            iat_unix: now,
            exp_unix: now.saturating_add(ttl_secs),
            request_id,
            email: Some(email.into()),
        })
    }

    /// A token stops being valid at exactly `exp_unix`.
    pub fn is_expired(&self, now_unix: u32) -> bool {
        now_unix >= self.exp_unix
    }

    /// Serialize payload to binary format
    pub fn serialize_to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(FIXED_SIZE);

        // kind (1 byte)
        bytes.push(self.kind as u8);

        // iat_unix (4 bytes)
        bytes.extend_from_slice(&self.iat_unix.to_le_bytes());

        // exp_unix (4 bytes)
        bytes.extend_from_slice(&self.exp_unix.to_le_bytes());

        // request_id (16 bytes)
        bytes.extend_from_slice(self.request_id.as_bytes());

        // email_len (2 bytes) + email (variable)
        let email_bytes = self.email.as_deref().unwrap_or_default().as_bytes();
        if email_bytes.len() > u16::MAX as usize {
            return Err(anyhow!("Email too long"));
        }
        bytes.extend_from_slice(&(email_bytes.len() as u16).to_le_bytes());
        bytes.extend_from_slice(email_bytes);

        Ok(bytes)
    }

    /// Deserialize payload from binary format
    pub fn deserialize_from_bytes(bytes: &[u8]) -> Result<TokenPayloadV1, TokenError> {
        if bytes.len() < FIXED_SIZE {
            return Err(TokenError::InvalidPayload("Payload too short".to_string()));
        }

        let mut offset = 0;

        // kind (1 byte)
        let kind = TokenKind::from_u8(bytes[offset])?;
        offset += 1;

        // iat_unix (4 bytes)
        let iat_unix = u32::from_le_bytes(
            bytes[offset..offset + 4]
                .try_into()
                .map_err(|_| TokenError::InvalidPayload("Failed to read iat_unix".to_string()))?,
        );
        offset += 4;

        // exp_unix (4 bytes)
        let exp_unix = u32::from_le_bytes(
            bytes[offset..offset + 4]
                .try_into()
                .map_err(|_| TokenError::InvalidPayload("Failed to read exp_unix".to_string()))?,
        );
        offset += 4;

        // request_id (16 bytes)
        let request_id = Uuid::from_bytes(
            bytes[offset..offset + 16]
                .try_into()
                .map_err(|_| TokenError::InvalidPayload("Failed to read request_id".to_string()))?,
        );
        offset += 16;

        // email_len (2 bytes)
        let email_len = u16::from_le_bytes(
            bytes[offset..offset + 2]
                .try_into()
                .map_err(|_| TokenError::InvalidPayload("Failed to read email_len".to_string()))?,
        ) as usize;
        offset += 2;

        if bytes.len() != offset + email_len {
            return Err(TokenError::InvalidPayload(
                "Invalid payload size".to_string(),
            ));
        }

        // email (variable)
        let email = if email_len == 0 {
            None
        } else {
            Some(
                String::from_utf8(bytes[offset..offset + email_len].to_vec())
                    .map_err(|_| TokenError::InvalidPayload("Invalid UTF-8 in email".to_string()))?,
            )
        };

        Ok(TokenPayloadV1 {
            kind,
            iat_unix,
            exp_unix,
            request_id,
            email,
        })
    }
}

pub(crate) fn now_unix() -> Result<u32> {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("System clock before Unix epoch: {error}"))?
        .as_secs();
    u32::try_from(secs).map_err(|_| anyhow!("System clock beyond u32 range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serialization_deserialization() {
        let test_cases = vec![
            TokenPayloadV1 {
                kind: TokenKind::Claim,
                iat_unix: 1700000000,
                exp_unix: 1700259200,
                request_id: Uuid::new_v4(),
                email: None,
            },
            TokenPayloadV1 {
                kind: TokenKind::EmailConfirm,
                iat_unix: 0,
                exp_unix: u32::MAX,
                request_id: Uuid::nil(),
                email: Some("someone@example.com".to_string()),
            },
            TokenPayloadV1 {
                kind: TokenKind::EmailConfirm,
                iat_unix: 1234567890,
                exp_unix: 1234654290,
                request_id: Uuid::new_v4(),
                email: Some("a.rather.long+tagged.address@subdomain.example.org".to_string()),
            },
        ];

        for payload in test_cases {
            let serialized = payload.serialize_to_bytes().unwrap();
            let deserialized = TokenPayloadV1::deserialize_from_bytes(&serialized).unwrap();
            assert_eq!(deserialized, payload);
        }
    }

    #[test]
    fn test_payload_binary_format() {
        let request_id = Uuid::new_v4();
        let payload = TokenPayloadV1 {
            kind: TokenKind::Claim,
            iat_unix: 0x12345678,
            exp_unix: 0x87654321,
            request_id,
            email: None,
        };

        let bytes = payload.serialize_to_bytes().unwrap();
        assert_eq!(bytes.len(), FIXED_SIZE);
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &0x12345678u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &0x87654321u32.to_le_bytes());
        assert_eq!(&bytes[9..25], request_id.as_bytes());
        assert_eq!(&bytes[25..27], &0u16.to_le_bytes());
    }

    #[test]
    fn test_payload_rejects_unknown_kind() {
        let mut bytes = TokenPayloadV1 {
            kind: TokenKind::Claim,
            iat_unix: 1,
            exp_unix: 2,
            request_id: Uuid::nil(),
            email: None,
        }
        .serialize_to_bytes()
        .unwrap();
        bytes[0] = 99;

        assert_eq!(
            TokenPayloadV1::deserialize_from_bytes(&bytes),
            Err(TokenError::UnexpectedKind(99))
        );
    }

    #[test]
    fn test_payload_rejects_length_mismatch() {
        let payload = TokenPayloadV1 {
            kind: TokenKind::EmailConfirm,
            iat_unix: 1,
            exp_unix: 2,
            request_id: Uuid::nil(),
            email: Some("x@y.z".to_string()),
        };
        let bytes = payload.serialize_to_bytes().unwrap();

        // Truncated email and trailing garbage both fail the exact-size check.
        assert!(TokenPayloadV1::deserialize_from_bytes(&bytes[..bytes.len() - 1]).is_err());
        let mut extended = bytes.clone();
        extended.push(0);
        assert!(TokenPayloadV1::deserialize_from_bytes(&extended).is_err());
    }

    #[test]
    fn test_expiry_boundary() {
        let payload = TokenPayloadV1 {
            kind: TokenKind::Claim,
            iat_unix: 1700000000,
            exp_unix: 1700000100,
            request_id: Uuid::nil(),
            email: None,
        };

        assert!(!payload.is_expired(1700000099));
        assert!(payload.is_expired(1700000100));
        assert!(payload.is_expired(1700000101));
    }

    #[test]
    fn test_claim_constructor_sets_window() {
        let payload = TokenPayloadV1::claim(Uuid::new_v4(), 259200).unwrap();
        assert_eq!(payload.kind, TokenKind::Claim);
        assert_eq!(payload.exp_unix - payload.iat_unix, 259200);
        assert!(payload.email.is_none());
    }

    #[test]
    fn test_email_confirm_constructor_carries_address() {
        let payload = TokenPayloadV1::email_confirm(Uuid::new_v4(), "new@example.com", 86400).unwrap();
        assert_eq!(payload.kind, TokenKind::EmailConfirm);
        assert_eq!(payload.exp_unix - payload.iat_unix, 86400);
        assert_eq!(payload.email.as_deref(), Some("new@example.com"));
    }
}
