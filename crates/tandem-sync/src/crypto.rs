//! # Record Encryption
//!
//! Entity payloads are sealed before they leave the device. The engine only
//! relies on `decrypt(encrypt(x)) == x`; the primitive is swappable.
//!
//! ## Sealed Payload Layout (AES-256-GCM)
//! ```text
//! ┌──────────────┬─────────────────────────────────────────────┐
//! │ nonce (12 B) │ ciphertext + tag                            │
//! └──────────────┴─────────────────────────────────────────────┘
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::{SyncError, SyncResult};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Opaque encrypt/decrypt service.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>>;

    fn decrypt(&self, sealed: &[u8]) -> SyncResult<Vec<u8>>;
}

/// Stores payloads as-is. For accounts without a key and for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCipher;

impl Cipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, sealed: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

/// AES-256-GCM with a random nonce per payload.
#[derive(Clone)]
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> SyncResult<Self> {
        if key.len() != KEY_LEN {
            return Err(SyncError::Crypto(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| SyncError::Crypto(e.to_string()))?;
        Ok(AesGcmCipher { cipher })
    }

    /// Builds a cipher from the base64 key stored in config.
    pub fn from_base64_key(encoded: &str) -> SyncResult<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SyncError::InvalidConfig(format!("encryption key: {}", e)))?;
        Self::new(&key)
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmCipher(..)")
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, sealed: &[u8]) -> SyncResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(SyncError::Crypto("payload shorter than nonce".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| SyncError::Crypto(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap();
        let plaintext = br#"{"kind":"Project","data":{}}"#;

        let sealed = cipher.encrypt(plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());
        assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);

        let passed = PassthroughCipher.encrypt(plaintext).unwrap();
        assert_eq!(PassthroughCipher.decrypt(&passed).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_is_fresh() {
        let cipher = AesGcmCipher::new(&[7u8; KEY_LEN]).unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_fails() {
        let cipher = AesGcmCipher::new(&[7u8; KEY_LEN]).unwrap();
        let mut sealed = cipher.encrypt(b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(cipher.decrypt(&sealed), Err(SyncError::Crypto(_))));
        assert!(cipher.decrypt(&sealed[..4]).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = AesGcmCipher::new(&[1u8; KEY_LEN]).unwrap().encrypt(b"secret").unwrap();
        let other = AesGcmCipher::new(&[2u8; KEY_LEN]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
        assert!(AesGcmCipher::new(&[0u8; 16]).is_err());
    }
}
