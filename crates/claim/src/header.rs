use crate::error::TokenError;

// Constants for token format
pub(crate) const MAGIC: &[u8; 4] = b"MGC1";
pub(crate) const VERSION: u8 = 1;
pub(crate) const ALG_AES_256_GCM: u8 = 1;

// Header size: magic(4) + ver(1) + kid(1) + alg(1) + rsv(1) + nonce(12) = 20 bytes
pub(crate) const HEADER_SIZE: usize = 20;
pub(crate) const TAG_SIZE: usize = 16;

/// Binary header structure (plaintext, authenticated as AAD)
#[derive(Debug, Clone)]
pub struct TokenHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub kid: u8,
    pub alg: u8,
    pub rsv: u8,
    pub nonce: [u8; 12],
}

impl TokenHeader {
    pub fn new(kid: u8, alg: u8) -> Self {
        let mut nonce = [0u8; 12];
        use rand::RngCore;
        rand::thread_rng().fill_bytes(&mut nonce);

        Self {
            magic: *MAGIC,
            version: VERSION,
            kid,
            alg,
            rsv: 0,
            nonce,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(&self.magic);
        bytes.push(self.version);
        bytes.push(self.kid);
        bytes.push(self.alg);
        bytes.push(self.rsv);
        bytes.extend_from_slice(&self.nonce);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() < HEADER_SIZE {
            return Err(TokenError::InvalidHeader("Invalid header size".to_string()));
        }

        let magic: [u8; 4] = bytes[0..4]
            .try_into()
            .map_err(|_| TokenError::InvalidHeader("Failed to read magic bytes".to_string()))?;
        if magic != *MAGIC {
            return Err(TokenError::InvalidHeader("Invalid magic bytes".to_string()));
        }

        let version = bytes[4];
        if version != VERSION {
            return Err(TokenError::InvalidHeader(format!(
                "Unsupported version: {version}",
            )));
        }

        let kid = bytes[5];
        let alg = bytes[6];
        let rsv = bytes[7];
        let nonce: [u8; 12] = bytes[8..20]
            .try_into()
            .map_err(|_| TokenError::InvalidHeader("Failed to read nonce".to_string()))?;

        Ok(Self {
            magic,
            version,
            kid,
            alg,
            rsv,
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = TokenHeader::new(3, ALG_AES_256_GCM);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);

        let parsed = TokenHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.magic, *MAGIC);
        assert_eq!(parsed.version, VERSION);
        assert_eq!(parsed.kid, 3);
        assert_eq!(parsed.alg, ALG_AES_256_GCM);
        assert_eq!(parsed.nonce, header.nonce);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = TokenHeader::new(1, ALG_AES_256_GCM).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            TokenHeader::from_bytes(&bytes),
            Err(TokenError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_header_rejects_bad_version() {
        let mut bytes = TokenHeader::new(1, ALG_AES_256_GCM).to_bytes();
        bytes[4] = 99;
        assert!(matches!(
            TokenHeader::from_bytes(&bytes),
            Err(TokenError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_header_rejects_truncated_input() {
        let bytes = TokenHeader::new(1, ALG_AES_256_GCM).to_bytes();
        assert!(TokenHeader::from_bytes(&bytes[..HEADER_SIZE - 1]).is_err());
    }
}
