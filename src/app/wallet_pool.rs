//! Hop Wallet Pool
//!
//! Owns the lifecycle of ephemeral intermediary wallets: generation through
//! the chain's key strategy, encryption and persistence before the address is
//! handed out, and retirement once the wallet has forwarded its funds.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AppError, DatabaseError, EphemeralWallet, HopWalletRecord, HopWalletStore, PlanningError,
    SignedTransaction, SigningError, TransactionSigner, UnsignedTransaction,
};
use crate::infra::keys::{KeyCipher, KeyGenerationStrategy, KeyStrategyRegistry};

/// Address collisions tolerated before allocation gives up
pub const DEFAULT_COLLISION_RETRIES: u32 = 3;

/// Lifetime of a hop wallet before the sweep may retire it
pub const DEFAULT_WALLET_TTL_HOURS: i64 = 24;

const MAX_WALLET_TTL_HOURS: i64 = 24 * 365;

/// What happens to key material when a wallet is retired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetirementPolicy {
    /// Erase the ciphertext
    #[default]
    Discard,
    /// Keep the ciphertext, flagged retired
    Archive,
}

impl FromStr for RetirementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "archive" => Ok(Self::Archive),
            _ => Err(format!("Invalid retirement policy: {}", s)),
        }
    }
}

/// Configuration for the hop wallet pool
#[derive(Debug, Clone)]
pub struct WalletPoolConfig {
    /// Upper bound on simultaneously active wallets (unbounded when `None`)
    pub max_active_wallets: Option<i64>,
    pub retirement_policy: RetirementPolicy,
    pub collision_retries: u32,
    pub wallet_ttl: Duration,
}

impl Default for WalletPoolConfig {
    fn default() -> Self {
        Self {
            max_active_wallets: None,
            retirement_policy: RetirementPolicy::Discard,
            collision_retries: DEFAULT_COLLISION_RETRIES,
            wallet_ttl: Duration::hours(DEFAULT_WALLET_TTL_HOURS),
        }
    }
}

impl WalletPoolConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        use std::env;

        let max_active_wallets = env::var("HOP_WALLET_POOL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &i64| *v > 0);

        let retirement_policy = env::var("HOP_WALLET_RETIREMENT_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        let wallet_ttl = env::var("HOP_WALLET_TTL_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v: &i64| (1..=MAX_WALLET_TTL_HOURS).contains(v))
            .map_or(Duration::hours(DEFAULT_WALLET_TTL_HOURS), Duration::hours);

        Self {
            max_active_wallets,
            retirement_policy,
            wallet_ttl,
            ..Default::default()
        }
    }
}

/// Manages ephemeral intermediary wallets
pub struct HopWalletPool {
    store: Arc<dyn HopWalletStore>,
    strategies: KeyStrategyRegistry,
    cipher: Arc<KeyCipher>,
    config: WalletPoolConfig,
}

impl HopWalletPool {
    pub fn new(
        store: Arc<dyn HopWalletStore>,
        strategies: KeyStrategyRegistry,
        cipher: Arc<KeyCipher>,
        config: WalletPoolConfig,
    ) -> Self {
        Self {
            store,
            strategies,
            cipher,
            config,
        }
    }

    #[must_use]
    pub fn supports_chain(&self, chain: &str) -> bool {
        self.strategies.supports(chain)
    }

    /// Generate, encrypt and persist a fresh wallet bound to `plan_id`
    #[instrument(skip(self), fields(chain = %chain, plan_id = %plan_id))]
    pub async fn allocate(&self, chain: &str, plan_id: &str) -> Result<EphemeralWallet, AppError> {
        let strategy = self
            .strategies
            .get(chain)
            .ok_or_else(|| PlanningError::UnsupportedChain(chain.to_string()))?;

        if let Some(capacity) = self.config.max_active_wallets {
            let active = self.store.count_active_hop_wallets().await?;
            if active >= capacity {
                warn!(active, capacity, "Hop wallet pool at capacity");
                return Err(PlanningError::NoViableWalletAllocation(format!(
                    "pool capacity of {} active wallets reached",
                    capacity
                ))
                .into());
            }
        }

        for attempt in 0..=self.config.collision_retries {
            let generated = strategy.generate().map_err(|e| {
                PlanningError::NoViableWalletAllocation(format!("key generation failed: {}", e))
            })?;
            let encrypted = self.cipher.encrypt(&generated.secret).map_err(|e| {
                PlanningError::NoViableWalletAllocation(format!("key encryption failed: {}", e))
            })?;

            let created_at = Utc::now();
            let wallet = EphemeralWallet {
                address: generated.address,
                chain: strategy.chain().to_string(),
                plan_id: plan_id.to_string(),
                created_at,
                expires_at: created_at + self.config.wallet_ttl,
                retired_at: None,
            };
            let record = HopWalletRecord {
                wallet: wallet.clone(),
                encrypted_key: Some(encrypted),
                key_fingerprint: self.cipher.fingerprint().to_string(),
            };

            match self.store.insert_hop_wallet(&record).await {
                Ok(()) => {
                    debug!(address = %wallet.address, "Allocated hop wallet");
                    return Ok(wallet);
                }
                Err(AppError::Database(DatabaseError::Duplicate(_))) => {
                    warn!(attempt, "Hop wallet address collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(PlanningError::NoViableWalletAllocation(format!(
            "address collided {} times",
            self.config.collision_retries + 1
        ))
        .into())
    }

    /// Retire a wallet; retiring twice is a no-op
    #[instrument(skip(self))]
    pub async fn retire(&self, address: &str) -> Result<(), AppError> {
        let discard = self.config.retirement_policy == RetirementPolicy::Discard;
        if self
            .store
            .retire_hop_wallet(address, discard, Utc::now())
            .await?
        {
            info!(address = %address, discard, "Retired hop wallet");
        }
        Ok(())
    }

    /// Retire every wallet bound to a plan
    #[instrument(skip(self))]
    pub async fn retire_plan(&self, plan_id: &str) -> Result<(), AppError> {
        for record in self.store.list_hop_wallets_for_plan(plan_id).await? {
            if record.wallet.retired_at.is_none() {
                self.retire(&record.wallet.address).await?;
            }
        }
        Ok(())
    }

    /// Plans holding unretired wallets past their expiry
    pub async fn expired_plans(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, AppError> {
        self.store.list_expired_hop_wallet_plans(now, limit).await
    }

    /// Whether `address` is a wallet this pool created
    pub async fn owns(&self, address: &str) -> Result<bool, AppError> {
        Ok(self.store.get_hop_wallet(address).await?.is_some())
    }

    /// Decrypt the key of a hop wallet for signing
    pub async fn decrypt_signing_key(
        &self,
        address: &str,
    ) -> Result<(SecretString, Arc<dyn KeyGenerationStrategy>), AppError> {
        let record = self
            .store
            .get_hop_wallet(address)
            .await?
            .ok_or_else(|| SigningError::SigningUnavailable(address.to_string()))?;
        let sealed = record
            .encrypted_key
            .as_deref()
            .ok_or_else(|| SigningError::SigningUnavailable(address.to_string()))?;
        if record.key_fingerprint != self.cipher.fingerprint() {
            return Err(SigningError::Decryption(format!(
                "wallet {} was sealed under key {}",
                address, record.key_fingerprint
            ))
            .into());
        }
        let strategy = self
            .strategies
            .get(&record.wallet.chain)
            .ok_or_else(|| SigningError::SigningUnavailable(address.to_string()))?;
        Ok((self.cipher.decrypt(sealed)?, strategy))
    }
}

#[async_trait]
impl TransactionSigner for HopWalletPool {
    #[instrument(skip(self, unsigned), fields(reference = %unsigned.intent.reference))]
    async fn sign(
        &self,
        wallet_ref: &str,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, AppError> {
        if unsigned.intent.from_address != wallet_ref {
            return Err(SigningError::SignatureRejected(format!(
                "transaction spends from {} but signer is {}",
                unsigned.intent.from_address, wallet_ref
            ))
            .into());
        }
        let (secret, strategy) = self.decrypt_signing_key(wallet_ref).await?;
        let signature = strategy.sign(&secret, &unsigned.payload)?;
        Ok(SignedTransaction {
            chain: unsigned.intent.chain.clone(),
            signer_address: wallet_ref.to_string(),
            payload: unsigned.payload.clone(),
            signature,
        })
    }
}
