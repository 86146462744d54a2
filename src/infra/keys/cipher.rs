//! At-rest encryption of ephemeral wallet keys.
//!
//! ChaCha20-Poly1305 under a single master key. The stored form is
//! `base64(nonce || ciphertext || tag)` with a fresh 12-byte nonce per key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::domain::{AppError, ConfigError, SigningError};

/// Nonce length for ChaCha20-Poly1305
pub const NONCE_LEN: usize = 12;

/// Master key length
pub const MASTER_KEY_LEN: usize = 32;

/// Encrypts and decrypts hop wallet secrets
pub struct KeyCipher {
    cipher: ChaCha20Poly1305,
    fingerprint: String,
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyCipher {
    #[must_use]
    pub fn from_bytes(master_key: &[u8; MASTER_KEY_LEN]) -> Self {
        let digest = Sha256::digest(master_key);
        let fingerprint = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(master_key)),
            fingerprint,
        }
    }

    /// Parse a base64-encoded 32-byte master key (`HOP_WALLET_ENCRYPTION_KEY`)
    pub fn from_base64(master_key: &SecretString) -> Result<Self, AppError> {
        let bytes = BASE64_STANDARD
            .decode(master_key.expose_secret().trim())
            .map_err(|e| invalid_master_key(format!("not base64: {}", e)))?;
        let key: [u8; MASTER_KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            invalid_master_key(format!("expected {} bytes, got {}", MASTER_KEY_LEN, v.len()))
        })?;
        Ok(Self::from_bytes(&key))
    }

    /// Random master key, for tests and local development
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_bytes(&key)
    }

    /// Identifies the master key without revealing it
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt(&self, secret: &SecretString) -> Result<String, AppError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), secret.expose_secret().as_bytes())
            .map_err(|e| SigningError::KeyGeneration(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<SecretString, AppError> {
        let bytes = BASE64_STANDARD
            .decode(sealed)
            .map_err(|e| SigningError::Decryption(format!("not base64: {}", e)))?;
        if bytes.len() <= NONCE_LEN {
            return Err(SigningError::Decryption("ciphertext too short".to_string()).into());
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SigningError::Decryption("authentication failed".to_string()))?;
        let secret = String::from_utf8(plaintext)
            .map_err(|_| SigningError::Decryption("plaintext is not utf-8".to_string()))?;
        Ok(SecretString::from(secret))
    }
}

fn invalid_master_key(message: String) -> AppError {
    AppError::Config(ConfigError::InvalidValue {
        key: "HOP_WALLET_ENCRYPTION_KEY".to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = KeyCipher::generate();
        let secret = SecretString::from("5KQwrPbwdL6PhXujxW37FSSQZ1JiwsST4cqQzDeyXtP".to_string());
        let sealed = cipher.encrypt(&secret).unwrap();
        assert_ne!(sealed, secret.expose_secret());
        let opened = cipher.decrypt(&sealed).unwrap();
        assert_eq!(opened.expose_secret(), secret.expose_secret());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let cipher = KeyCipher::generate();
        let secret = SecretString::from("same".to_string());
        assert_ne!(
            cipher.encrypt(&secret).unwrap(),
            cipher.encrypt(&secret).unwrap()
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = KeyCipher::generate()
            .encrypt(&SecretString::from("secret".to_string()))
            .unwrap();
        let result = KeyCipher::generate().decrypt(&sealed);
        assert!(matches!(
            result,
            Err(AppError::Signing(SigningError::Decryption(_)))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = KeyCipher::generate();
        let sealed = cipher
            .encrypt(&SecretString::from("secret".to_string()))
            .unwrap();
        let mut bytes = BASE64_STANDARD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(cipher.decrypt(&BASE64_STANDARD.encode(bytes)).is_err());
    }

    #[test]
    fn test_from_base64() {
        let encoded = SecretString::from(BASE64_STANDARD.encode([7u8; 32]));
        let a = KeyCipher::from_base64(&encoded).unwrap();
        let b = KeyCipher::from_bytes(&[7u8; 32]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);

        let short = SecretString::from(BASE64_STANDARD.encode([7u8; 16]));
        assert!(matches!(
            KeyCipher::from_base64(&short),
            Err(AppError::Config(ConfigError::InvalidValue { .. }))
        ));
    }
}
