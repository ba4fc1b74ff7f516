//! Secret cipher for instance credentials.
//!
//! Directory documents carry passwords as URL-safe base64 blobs encrypted
//! with AES-256-GCM (`nonce || ciphertext`). The key comes from the
//! `FLEETMON_SECRET_KEY` environment variable (base64, 32 bytes). Plaintext
//! exists only transiently, immediately before a connection is opened.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};

const NONCE_LEN: usize = 12;

/// Error type for credential encryption/decryption.
#[derive(Debug)]
pub enum CryptoError {
    /// `FLEETMON_SECRET_KEY` is not set.
    KeyNotSet,
    /// The key is not valid base64 or not 32 bytes.
    InvalidKey(String),
    /// The blob is not valid base64 or is too short to hold a nonce.
    InvalidBlob(String),
    /// Authenticated decryption failed (wrong key or corrupted blob).
    DecryptFailed,
    /// Encryption failed.
    EncryptFailed,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::KeyNotSet => write!(f, "FLEETMON_SECRET_KEY not set"),
            CryptoError::InvalidKey(msg) => write!(f, "invalid secret key: {}", msg),
            CryptoError::InvalidBlob(msg) => write!(f, "invalid credential blob: {}", msg),
            CryptoError::DecryptFailed => write!(f, "credential decryption failed"),
            CryptoError::EncryptFailed => write!(f, "credential encryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Two-way cipher over credential blobs.
///
/// The engine only ever calls `decrypt`; `encrypt` exists for the tooling
/// that provisions directory entries.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, blob: &str) -> Result<String, CryptoError>;
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
}

/// AES-256-GCM cipher keyed from the environment.
pub struct AesGcmCipher {
    key: Key<Aes256Gcm>,
}

impl AesGcmCipher {
    pub fn new(key_bytes: [u8; 32]) -> Self {
        Self {
            key: Key::<Aes256Gcm>::from(key_bytes),
        }
    }

    /// Reads the key from `FLEETMON_SECRET_KEY` (base64, 32 bytes).
    pub fn from_env() -> Result<Self, CryptoError> {
        let raw = std::env::var("FLEETMON_SECRET_KEY").map_err(|_| CryptoError::KeyNotSet)?;
        let decoded = STANDARD
            .decode(raw.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key_bytes: [u8; 32] = decoded
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("key must be 32 bytes".to_string()))?;
        Ok(Self::new(key_bytes))
    }
}

impl SecretCipher for AesGcmCipher {
    fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let data = URL_SAFE
            .decode(blob.trim())
            .map_err(|e| CryptoError::InvalidBlob(e.to_string()))?;
        if data.len() < NONCE_LEN {
            return Err(CryptoError::InvalidBlob("blob shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptFailed)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptFailed)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(blob))
    }
}

/// Identity cipher for tests and unencrypted development directories.
pub struct PlainCipher;

impl SecretCipher for PlainCipher {
    fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        Ok(blob.to_string())
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(plaintext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new([7u8; 32])
    }

    #[test]
    fn roundtrip() {
        let c = cipher();
        let blob = c.encrypt("s3cret-p@ss").unwrap();
        assert_ne!(blob, "s3cret-p@ss");
        assert_eq!(c.decrypt(&blob).unwrap(), "s3cret-p@ss");
    }

    #[test]
    fn wrong_key_fails() {
        let blob = cipher().encrypt("pw").unwrap();
        let other = AesGcmCipher::new([8u8; 32]);
        assert!(matches!(other.decrypt(&blob), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn garbage_blob_fails() {
        assert!(matches!(
            cipher().decrypt("not base64 at all!!!"),
            Err(CryptoError::InvalidBlob(_))
        ));
        // Valid base64 but shorter than a nonce.
        assert!(matches!(
            cipher().decrypt("YWJj"),
            Err(CryptoError::InvalidBlob(_))
        ));
    }
}
