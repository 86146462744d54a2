//! Custodial signer for source wallets loaded from configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use secrecy::SecretString;
use tracing::{info, instrument};

use crate::domain::{
    AppError, SignedTransaction, SigningError, TransactionSigner, UnsignedTransaction,
};
use crate::infra::keys::signing_key_from_base58;

/// Signs for a fixed set of source wallets with ed25519 keys held in memory
#[derive(Default)]
pub struct StaticKeySigner {
    keys: HashMap<String, SigningKey>,
}

impl StaticKeySigner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key behind a wallet id
    pub fn with_key(
        mut self,
        wallet_id: impl Into<String>,
        secret: &SecretString,
    ) -> Result<Self, AppError> {
        let key = signing_key_from_base58(secret)?;
        self.keys.insert(wallet_id.into(), key);
        Ok(self)
    }

    /// Load `SOURCE_WALLET_ID` / `SOURCE_WALLET_PRIVATE_KEY`; `None` when unset
    pub fn from_env() -> Result<Option<Self>, AppError> {
        use std::env;

        let (Ok(wallet_id), Ok(key)) = (
            env::var("SOURCE_WALLET_ID"),
            env::var("SOURCE_WALLET_PRIVATE_KEY"),
        ) else {
            return Ok(None);
        };
        let signer = Self::new().with_key(wallet_id.clone(), &SecretString::from(key))?;
        info!(
            wallet_id = %wallet_id,
            address = %signer.address_of(&wallet_id).unwrap_or_default(),
            "Loaded custodial source signer"
        );
        Ok(Some(signer))
    }

    /// Public address of a registered wallet
    #[must_use]
    pub fn address_of(&self, wallet_id: &str) -> Option<String> {
        self.keys
            .get(wallet_id)
            .map(|k| bs58::encode(k.verifying_key().as_bytes()).into_string())
    }
}

#[async_trait]
impl TransactionSigner for StaticKeySigner {
    #[instrument(skip(self, unsigned))]
    async fn sign(
        &self,
        wallet_ref: &str,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, AppError> {
        let key = self
            .keys
            .get(wallet_ref)
            .ok_or_else(|| SigningError::SigningUnavailable(wallet_ref.to_string()))?;
        let address = bs58::encode(key.verifying_key().as_bytes()).into_string();
        if unsigned.intent.from_address != address {
            return Err(SigningError::SignatureRejected(format!(
                "wallet {} controls {} but the transaction spends from {}",
                wallet_ref, address, unsigned.intent.from_address
            ))
            .into());
        }
        let signature = key.sign(&unsigned.payload);
        Ok(SignedTransaction {
            chain: unsigned.intent.chain.clone(),
            signer_address: address,
            payload: unsigned.payload.clone(),
            signature: bs58::encode(signature.to_bytes()).into_string(),
        })
    }
}
