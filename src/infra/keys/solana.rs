//! Solana ed25519 keypairs.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use super::{GeneratedKey, KeyGenerationStrategy};
use crate::domain::{AppError, SigningError};

/// Generates ed25519 keypairs whose address is the base58 public key
#[derive(Debug, Clone, Copy, Default)]
pub struct SolanaKeyStrategy;

impl KeyGenerationStrategy for SolanaKeyStrategy {
    fn chain(&self) -> &str {
        "solana"
    }

    fn generate(&self) -> Result<GeneratedKey, AppError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        Ok(GeneratedKey {
            address,
            secret: SecretString::from(bs58::encode(signing_key.to_bytes()).into_string()),
        })
    }

    fn address_of(&self, secret: &SecretString) -> Result<String, AppError> {
        let signing_key = signing_key_from_base58(secret)?;
        Ok(bs58::encode(signing_key.verifying_key().as_bytes()).into_string())
    }

    fn sign(&self, secret: &SecretString, message: &[u8]) -> Result<String, AppError> {
        let signing_key = signing_key_from_base58(secret)?;
        Ok(bs58::encode(signing_key.sign(message).to_bytes()).into_string())
    }
}

/// Parse a base58 secret key (32-byte seed or 64-byte keypair)
pub fn signing_key_from_base58(secret: &SecretString) -> Result<SigningKey, AppError> {
    let key_bytes = bs58::decode(secret.expose_secret())
        .into_vec()
        .map_err(|e| AppError::Signing(SigningError::InvalidKey(e.to_string())))?;

    // Solana keypair format: first 32 bytes are the secret key
    let seed = match key_bytes.len() {
        64 | 32 => &key_bytes[..32],
        other => {
            return Err(AppError::Signing(SigningError::InvalidKey(format!(
                "Key must be 32 or 64 bytes, got {}",
                other
            ))));
        }
    };
    let key_array: [u8; 32] = seed
        .try_into()
        .map_err(|_| AppError::Signing(SigningError::InvalidKey("Invalid key length".into())))?;

    Ok(SigningKey::from_bytes(&key_array))
}
