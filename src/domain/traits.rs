//! Domain traits defining contracts for external systems.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::AppError;
use super::types::{
    ConfirmationStatus, HistoricalTransaction, HopFailure, HopOutcome, HopStep, HopWalletRecord,
    KnownEntity, PrivacyPreferences, SignedTransaction, TransferHistoryFilter, TransferIntent,
    TransferRecord, TransferStatus, UnsignedTransaction, WalletInfo,
};

/// Signing capability for source and ephemeral wallets
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sign an unsigned transaction with the key behind `wallet_ref`.
    ///
    /// Fails with `SigningError::SigningUnavailable` when the key is missing or locked.
    async fn sign(
        &self,
        wallet_ref: &str,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, AppError>;
}

/// Chain broadcast capability
#[async_trait]
pub trait ChainBroadcaster: Send + Sync {
    /// Check RPC connectivity
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    /// Build the chain-specific transaction for one transfer leg
    async fn prepare_transfer(
        &self,
        intent: &TransferIntent,
    ) -> Result<UnsignedTransaction, AppError>;

    /// Submit a signed transaction; resending the same payload is idempotent on-chain
    async fn broadcast(&self, chain: &str, signed: &SignedTransaction) -> Result<String, AppError>;

    /// Query the confirmation status of a broadcast transaction
    async fn get_confirmation_status(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<ConfirmationStatus, AppError>;
}

/// Read access to indexed transaction history
#[async_trait]
pub trait TransactionHistoryStore: Send + Sync {
    async fn get_transactions_for_address(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<HistoricalTransaction>, AppError>;

    /// Labelled entity addresses used for proximity scoring
    async fn get_known_entities(&self) -> Result<Vec<KnownEntity>, AppError> {
        Ok(Vec::new())
    }
}

/// Read access to the dashboard's wallet registry
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Resolve a wallet reference to its on-chain identity
    async fn resolve_wallet(&self, wallet_id: &str) -> Result<Option<WalletInfo>, AppError>;

    /// Stored planner preferences for a wallet
    async fn get_privacy_preferences(
        &self,
        wallet_id: &str,
    ) -> Result<Option<PrivacyPreferences>, AppError> {
        let _ = wallet_id;
        Ok(None)
    }
}

/// Result of the atomic transition of a hop into `Broadcasting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastGate {
    /// The hop moved from `Pending` to `Broadcasting`
    Open,
    /// The hop was no longer `Pending`; nothing changed
    Superseded,
    /// A cancellation was accepted first
    Cancelled,
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A `Planned` record was moved straight to `Failed`
    CancelledBeforeStart,
    /// The engine will halt before its next broadcast
    Requested,
    /// The given hop is already being broadcast
    TooLate { hop: usize },
    AlreadyTerminal(TransferStatus),
    NotFound,
}

/// Durable transfer record persistence
///
/// Every method is atomic per record and observes its own prior writes.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Persist a freshly planned record with all its steps
    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), AppError>;

    /// Load a record with steps, outcomes, transitions and lease
    async fn get_transfer(&self, id: &str) -> Result<Option<TransferRecord>, AppError>;

    /// Records of a source wallet, newest first
    async fn list_transfers(
        &self,
        wallet_id: &str,
        filter: &TransferHistoryFilter,
    ) -> Result<Vec<TransferRecord>, AppError>;

    /// Approve a `Planned` record for execution; returns false if it is no longer `Planned`
    async fn mark_execution_requested(&self, id: &str) -> Result<bool, AppError>;

    /// Ids of approved, non-terminal records whose lease is absent or expired
    async fn list_resumable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, AppError>;

    /// Claim the record if unleased, expired, or already held by `owner`
    async fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration)
    -> Result<bool, AppError>;

    /// Extend a lease held by `owner`; false if it was lost
    async fn renew_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, AppError>;

    async fn release_lease(&self, id: &str, owner: &str) -> Result<(), AppError>;

    /// Compare-and-set the overall status, appending to the transition history.
    ///
    /// Entering `InProgress` stamps `started_at`; entering a terminal status stamps
    /// `completed_at` and stores `failure`.
    async fn transition_status(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        failure: Option<&HopFailure>,
    ) -> Result<bool, AppError>;

    /// Atomically move a `Pending` hop to `Broadcasting` unless a cancellation was accepted
    async fn begin_hop_broadcast(
        &self,
        id: &str,
        hop_index: usize,
    ) -> Result<BroadcastGate, AppError>;

    /// Persist the mutable execution fields of one step
    async fn update_hop(&self, id: &str, step: &HopStep) -> Result<(), AppError>;

    /// Append to the ordered hop outcome log
    async fn append_outcome(&self, id: &str, outcome: &HopOutcome) -> Result<(), AppError>;

    /// Accept or reject a cancellation, exclusive with `begin_hop_broadcast`
    async fn request_cancellation(&self, id: &str) -> Result<CancelOutcome, AppError>;
}

/// Durable ephemeral wallet persistence
#[async_trait]
pub trait HopWalletStore: Send + Sync {
    /// Insert a new wallet; a duplicate address yields `DatabaseError::Duplicate`
    async fn insert_hop_wallet(&self, wallet: &HopWalletRecord) -> Result<(), AppError>;

    async fn get_hop_wallet(&self, address: &str) -> Result<Option<HopWalletRecord>, AppError>;

    /// Wallets bound to one plan, in creation order
    async fn list_hop_wallets_for_plan(
        &self,
        plan_id: &str,
    ) -> Result<Vec<HopWalletRecord>, AppError>;

    async fn count_active_hop_wallets(&self) -> Result<i64, AppError>;

    /// Plan ids owning unretired wallets whose `expires_at` is at or before `now`, oldest first
    async fn list_expired_hop_wallet_plans(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, AppError>;

    /// Mark retired, erasing key material when `discard_key`; false if already retired
    async fn retire_hop_wallet(
        &self,
        address: &str,
        discard_key: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MinimalWalletStore;

    #[async_trait]
    impl WalletStore for MinimalWalletStore {
        async fn resolve_wallet(&self, _wallet_id: &str) -> Result<Option<WalletInfo>, AppError> {
            Ok(None)
        }
    }

    struct MinimalBroadcaster;

    #[async_trait]
    impl ChainBroadcaster for MinimalBroadcaster {
        async fn prepare_transfer(
            &self,
            _intent: &TransferIntent,
        ) -> Result<UnsignedTransaction, AppError> {
            Err(AppError::NotSupported("prepare".to_string()))
        }

        async fn broadcast(
            &self,
            _chain: &str,
            _signed: &SignedTransaction,
        ) -> Result<String, AppError> {
            Ok("tx".to_string())
        }

        async fn get_confirmation_status(
            &self,
            _chain: &str,
            _tx_id: &str,
        ) -> Result<ConfirmationStatus, AppError> {
            Ok(ConfirmationStatus::Pending)
        }
    }

    #[tokio::test]
    async fn test_wallet_store_has_no_default_preferences() {
        let store = MinimalWalletStore;
        assert!(store.get_privacy_preferences("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_broadcaster_default_health_check() {
        assert!(MinimalBroadcaster.health_check().await.is_ok());
    }
}
