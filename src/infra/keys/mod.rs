//! Key generation strategies and at-rest key encryption for hop wallets.

pub mod cipher;
pub mod solana;

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretString;

use crate::domain::AppError;

pub use cipher::KeyCipher;
pub use solana::{SolanaKeyStrategy, signing_key_from_base58};

/// Freshly generated keypair
pub struct GeneratedKey {
    pub address: String,
    /// Chain-native secret encoding
    pub secret: SecretString,
}

/// Chain-specific keypair generation and signing
pub trait KeyGenerationStrategy: Send + Sync {
    /// Chain identifier this strategy serves
    fn chain(&self) -> &str;

    fn generate(&self) -> Result<GeneratedKey, AppError>;

    /// Address controlled by `secret`
    fn address_of(&self, secret: &SecretString) -> Result<String, AppError>;

    /// Sign `message`, returning the chain-native signature encoding
    fn sign(&self, secret: &SecretString, message: &[u8]) -> Result<String, AppError>;
}

/// Strategies keyed by chain identifier
#[derive(Clone, Default)]
pub struct KeyStrategyRegistry {
    strategies: HashMap<String, Arc<dyn KeyGenerationStrategy>>,
}

impl KeyStrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in strategy
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().register(Arc::new(SolanaKeyStrategy))
    }

    #[must_use]
    pub fn register(mut self, strategy: Arc<dyn KeyGenerationStrategy>) -> Self {
        self.strategies
            .insert(strategy.chain().to_ascii_lowercase(), strategy);
        self
    }

    #[must_use]
    pub fn get(&self, chain: &str) -> Option<Arc<dyn KeyGenerationStrategy>> {
        self.strategies.get(&chain.to_ascii_lowercase()).cloned()
    }

    #[must_use]
    pub fn supports(&self, chain: &str) -> bool {
        self.strategies.contains_key(&chain.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = KeyStrategyRegistry::with_defaults();
        assert!(registry.supports("solana"));
        assert!(registry.supports("Solana"));
        assert!(registry.get("ethereum").is_none());
    }
}
