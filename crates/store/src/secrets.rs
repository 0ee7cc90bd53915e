//! Credential encryption at rest.
//!
//! Credential payloads are sealed with AES-256-GCM before they reach the
//! database and opened only when a worker resolves the credential for an
//! action invocation. The key never leaves process memory and decrypted
//! payloads are never logged.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use crate::error::StoreError;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// AES-256-GCM cipher for credential payloads. Cheap to clone.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn new(base64_key: &str) -> Result<Self, StoreError> {
        let key_bytes = BASE64
            .decode(base64_key.trim())
            .map_err(|e| StoreError::Encryption(format!("key is not valid base64: {e}")))?;
        if key_bytes.len() != KEY_SIZE {
            return Err(StoreError::Encryption(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Build from `SECRETS_ENCRYPTION_KEY`, if set.
    pub fn from_env() -> Result<Option<Self>, StoreError> {
        match std::env::var("SECRETS_ENCRYPTION_KEY") {
            Ok(key) if !key.is_empty() => Self::new(&key).map(Some),
            _ => Ok(None),
        }
    }

    /// Generate a fresh base64 key (operator convenience).
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    /// Seal a payload; output is base64 of `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| StoreError::Encryption(format!("encrypt failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    /// Open a payload sealed with [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, StoreError> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| StoreError::Encryption(format!("payload is not valid base64: {e}")))?;
        if bytes.len() < NONCE_SIZE {
            return Err(StoreError::Encryption("payload too short".into()));
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::Encryption("decrypt failed (wrong key?)".into()))
    }
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = SecretCipher::new(&SecretCipher::generate_key()).unwrap();
        let sealed = cipher.seal(b"{\"password\":\"hunter2\"}").unwrap();
        assert!(!sealed.contains("hunter2"));
        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, b"{\"password\":\"hunter2\"}");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let cipher = SecretCipher::new(&SecretCipher::generate_key()).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let sealed = SecretCipher::new(&SecretCipher::generate_key())
            .unwrap()
            .seal(b"secret")
            .unwrap();
        let other = SecretCipher::new(&SecretCipher::generate_key()).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        let short = BASE64.encode([0u8; 16]);
        assert!(SecretCipher::new(&short).is_err());
    }

    #[test]
    fn debug_never_prints_material() {
        let cipher = SecretCipher::new(&SecretCipher::generate_key()).unwrap();
        assert_eq!(format!("{cipher:?}"), "SecretCipher(..)");
    }
}
