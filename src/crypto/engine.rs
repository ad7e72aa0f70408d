use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use rand::RngCore;

use crate::error::BrokerError;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for access and refresh tokens at rest.
///
/// Sealed values are `base64(nonce || ciphertext)`, so each row carries its
/// own nonce and the same token never encrypts to the same column value twice.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn new(key_b64: &str) -> Result<Self, BrokerError> {
        let key = B64
            .decode(key_b64.trim())
            .map_err(|e| BrokerError::Crypto(format!("Invalid TOKEN_ENCRYPTION_KEY base64: {e}")))?;

        if key.len() != 32 {
            return Err(BrokerError::Crypto(format!(
                "TOKEN_ENCRYPTION_KEY must be 32 bytes, got {}",
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| BrokerError::Crypto(format!("Failed to init AES cipher: {e}")))?;

        Ok(Self { cipher })
    }

    pub fn seal(&self, token: &str) -> Result<String, BrokerError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), token.as_bytes())
            .map_err(|e| BrokerError::Crypto(format!("Encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(B64.encode(out))
    }

    pub fn open(&self, sealed_b64: &str) -> Result<String, BrokerError> {
        let raw = B64
            .decode(sealed_b64)
            .map_err(|e| BrokerError::Crypto(format!("Invalid sealed token: {e}")))?;

        if raw.len() <= NONCE_LEN {
            return Err(BrokerError::Crypto("Sealed token too short".into()));
        }

        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|e| BrokerError::Crypto(format!("Decryption failed: {e}")))?;

        String::from_utf8(plain)
            .map_err(|e| BrokerError::Crypto(format!("Sealed token is not UTF-8: {e}")))
    }
}
