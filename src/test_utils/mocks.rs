//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    AppError, BlockchainError, BroadcastGate, CANCELLED_REASON, CancelOutcome, ChainBroadcaster,
    ConfirmationStatus, DatabaseError, HistoricalTransaction, HopFailure, HopOutcome, HopStatus,
    HopStep, HopWalletRecord, HopWalletStore, KnownEntity, Lease, PrivacyPreferences,
    SignedTransaction, SigningError, StatusTransition, TransactionHistoryStore, TransactionSigner,
    TransferHistoryFilter, TransferIntent, TransferRecord, TransferStatus, TransferStore,
    UnsignedTransaction, WalletInfo, WalletStore,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

// ============================================================================
// TRANSFER + HOP WALLET STORE
// ============================================================================

/// In-memory transfer and hop wallet store
pub struct MockTransferStore {
    records: Arc<Mutex<HashMap<String, TransferRecord>>>,
    wallets: Arc<Mutex<Vec<HopWalletRecord>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    duplicate_failures: AtomicU32,
}

impl MockTransferStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            wallets: Arc::new(Mutex::new(Vec::new())),
            config,
            is_healthy: AtomicBool::new(true),
            duplicate_failures: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Reject the next `count` wallet inserts as address collisions
    pub fn fail_next_wallet_inserts_with_duplicate(&self, count: u32) {
        self.duplicate_failures.store(count, Ordering::SeqCst);
    }

    /// Number of hop wallets ever stored
    pub fn hop_wallet_count(&self) -> usize {
        self.wallets.lock().unwrap().len()
    }

    /// Snapshot of a stored record (for assertions)
    pub fn record(&self, id: &str) -> Option<TransferRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    /// Overwrite a stored record, e.g. to simulate a crash mid-execution
    pub fn put_record(&self, record: TransferRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.message(),
            )));
        }
        Ok(())
    }

    fn with_record<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut TransferRecord) -> T,
    ) -> Result<T, AppError> {
        self.check_should_fail()?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| DatabaseError::NotFound(format!("transfer {}", id)))?;
        Ok(f(record))
    }
}

impl Default for MockTransferStore {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl TransferStore for MockTransferStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.id) {
            return Err(DatabaseError::Duplicate(record.id.clone()).into());
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_transfer(&self, id: &str) -> Result<Option<TransferRecord>, AppError> {
        self.check_should_fail()?;
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn list_transfers(
        &self,
        wallet_id: &str,
        filter: &TransferHistoryFilter,
    ) -> Result<Vec<TransferRecord>, AppError> {
        self.check_should_fail()?;
        let records = self.records.lock().unwrap();
        let mut matching: Vec<TransferRecord> = records
            .values()
            .filter(|r| r.request.source_wallet_id == wallet_id)
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(usize::try_from(filter.limit.clamp(1, 100)).unwrap_or(100));
        Ok(matching)
    }

    async fn mark_execution_requested(&self, id: &str) -> Result<bool, AppError> {
        self.with_record(id, |r| {
            if r.status != TransferStatus::Planned || r.cancel_requested {
                return false;
            }
            r.execution_requested = true;
            r.updated_at = Utc::now();
            true
        })
    }

    async fn list_resumable(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>, AppError> {
        self.check_should_fail()?;
        let records = self.records.lock().unwrap();
        let mut resumable: Vec<&TransferRecord> = records
            .values()
            .filter(|r| r.execution_requested && !r.status.is_terminal())
            .filter(|r| r.lease.as_ref().is_none_or(|l| l.expires_at < now))
            .collect();
        resumable.sort_by_key(|r| r.created_at);
        Ok(resumable
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, AppError> {
        self.with_record(id, |r| {
            let free = match &r.lease {
                None => true,
                Some(lease) => lease.owner == owner || lease.expires_at < Utc::now(),
            };
            if free {
                r.lease = Some(Lease {
                    owner: owner.to_string(),
                    expires_at: expiry(ttl),
                });
            }
            free
        })
    }

    async fn renew_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, AppError> {
        self.with_record(id, |r| match &mut r.lease {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = expiry(ttl);
                true
            }
            _ => false,
        })
    }

    async fn release_lease(&self, id: &str, owner: &str) -> Result<(), AppError> {
        self.with_record(id, |r| {
            if r.lease.as_ref().is_some_and(|l| l.owner == owner) {
                r.lease = None;
            }
        })
    }

    async fn transition_status(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        failure: Option<&HopFailure>,
    ) -> Result<bool, AppError> {
        self.with_record(id, |r| {
            if r.status != from {
                return false;
            }
            let now = Utc::now();
            r.status = to;
            r.updated_at = now;
            if to == TransferStatus::InProgress && r.started_at.is_none() {
                r.started_at = Some(now);
            }
            if to.is_terminal() {
                r.completed_at = Some(now);
            }
            if let Some(failure) = failure {
                r.failure = Some(failure.clone());
            }
            r.transitions.push(StatusTransition {
                from: Some(from),
                to,
                at: now,
            });
            true
        })
    }

    async fn begin_hop_broadcast(&self, id: &str, hop_index: usize) -> Result<BroadcastGate, AppError> {
        self.with_record(id, |r| {
            if r.cancel_requested {
                return BroadcastGate::Cancelled;
            }
            match r.plan.steps.get_mut(hop_index) {
                Some(step) if step.status == HopStatus::Pending => {
                    step.status = HopStatus::Broadcasting;
                    step.updated_at = Utc::now();
                    BroadcastGate::Open
                }
                _ => BroadcastGate::Superseded,
            }
        })
    }

    async fn update_hop(&self, id: &str, step: &HopStep) -> Result<(), AppError> {
        self.with_record(id, |r| -> Result<(), AppError> {
            let Some(stored) = r.plan.steps.get_mut(step.index) else {
                return Err(
                    DatabaseError::NotFound(format!("hop {} of {}", step.index, id)).into(),
                );
            };
            stored.status = step.status;
            stored.signed_tx = step.signed_tx.clone();
            stored.tx_id = step.tx_id.clone();
            stored.attempts = step.attempts;
            stored.last_error = step.last_error.clone();
            stored.updated_at = step.updated_at;
            r.updated_at = Utc::now();
            Ok(())
        })?
    }

    async fn append_outcome(&self, id: &str, outcome: &HopOutcome) -> Result<(), AppError> {
        self.with_record(id, |r| r.outcomes.push(outcome.clone()))
    }

    async fn request_cancellation(&self, id: &str) -> Result<CancelOutcome, AppError> {
        self.check_should_fail()?;
        let mut records = self.records.lock().unwrap();
        let Some(r) = records.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };

        if r.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(r.status));
        }

        let now = Utc::now();
        if r.status == TransferStatus::Planned {
            r.cancel_requested = true;
            r.failure = Some(HopFailure {
                hop_index: 0,
                reason: CANCELLED_REASON.to_string(),
                holding_address: r.source_address.clone(),
            });
            r.transitions.push(StatusTransition {
                from: Some(r.status),
                to: TransferStatus::Failed,
                at: now,
            });
            r.status = TransferStatus::Failed;
            r.completed_at = Some(now);
            r.updated_at = now;
            return Ok(CancelOutcome::CancelledBeforeStart);
        }

        if let Some(step) = r
            .plan
            .steps
            .iter()
            .find(|s| s.status != HopStatus::Confirmed)
            && step.status == HopStatus::Broadcasting
        {
            return Ok(CancelOutcome::TooLate { hop: step.index });
        }

        r.cancel_requested = true;
        r.updated_at = now;
        Ok(CancelOutcome::Requested)
    }
}

#[async_trait]
impl HopWalletStore for MockTransferStore {
    async fn insert_hop_wallet(&self, wallet: &HopWalletRecord) -> Result<(), AppError> {
        self.check_should_fail()?;
        if self
            .duplicate_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DatabaseError::Duplicate(wallet.wallet.address.clone()).into());
        }

        let mut wallets = self.wallets.lock().unwrap();
        if wallets
            .iter()
            .any(|w| w.wallet.address == wallet.wallet.address)
        {
            return Err(DatabaseError::Duplicate(wallet.wallet.address.clone()).into());
        }
        wallets.push(wallet.clone());
        Ok(())
    }

    async fn get_hop_wallet(&self, address: &str) -> Result<Option<HopWalletRecord>, AppError> {
        self.check_should_fail()?;
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.wallet.address == address)
            .cloned())
    }

    async fn list_hop_wallets_for_plan(&self, plan_id: &str) -> Result<Vec<HopWalletRecord>, AppError> {
        self.check_should_fail()?;
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.wallet.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn count_active_hop_wallets(&self) -> Result<i64, AppError> {
        self.check_should_fail()?;
        let active = self
            .wallets
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.wallet.retired_at.is_none())
            .count();
        Ok(i64::try_from(active).unwrap_or(i64::MAX))
    }

    async fn list_expired_hop_wallet_plans(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, AppError> {
        self.check_should_fail()?;
        let wallets = self.wallets.lock().unwrap();
        let mut expired: Vec<(DateTime<Utc>, String)> = Vec::new();
        for w in wallets
            .iter()
            .filter(|w| w.wallet.retired_at.is_none() && w.wallet.expires_at <= now)
        {
            match expired.iter_mut().find(|(_, plan)| *plan == w.wallet.plan_id) {
                Some(entry) => entry.0 = entry.0.min(w.wallet.expires_at),
                None => expired.push((w.wallet.expires_at, w.wallet.plan_id.clone())),
            }
        }
        expired.sort();
        Ok(expired
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(_, plan)| plan)
            .collect())
    }

    async fn retire_hop_wallet(
        &self,
        address: &str,
        discard_key: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_should_fail()?;
        let mut wallets = self.wallets.lock().unwrap();
        match wallets
            .iter_mut()
            .find(|w| w.wallet.address == address && w.wallet.retired_at.is_none())
        {
            Some(wallet) => {
                wallet.wallet.retired_at = Some(at);
                if discard_key {
                    wallet.encrypted_key = None;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ============================================================================
// CHAIN BROADCASTER
// ============================================================================

/// Scriptable chain broadcaster.
///
/// Transaction ids equal the signature, so resending a payload yields the same id.
pub struct MockBroadcaster {
    config: MockConfig,
    broadcast_errors: Mutex<VecDeque<BlockchainError>>,
    failing_signers: Mutex<HashMap<String, BlockchainError>>,
    confirmations: Mutex<VecDeque<Result<ConfirmationStatus, BlockchainError>>>,
    default_confirmation: Mutex<ConfirmationStatus>,
    broadcasts: Mutex<Vec<SignedTransaction>>,
    prepared: AtomicUsize,
}

impl MockBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            broadcast_errors: Mutex::new(VecDeque::new()),
            failing_signers: Mutex::new(HashMap::new()),
            confirmations: Mutex::new(VecDeque::new()),
            default_confirmation: Mutex::new(ConfirmationStatus::Confirmed),
            broadcasts: Mutex::new(Vec::new()),
            prepared: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Fail the next broadcast (any signer) with `error`
    pub fn push_broadcast_error(&self, error: BlockchainError) {
        self.broadcast_errors.lock().unwrap().push_back(error);
    }

    /// Fail every broadcast signed by `address`
    pub fn fail_broadcasts_from(&self, address: impl Into<String>, error: BlockchainError) {
        self.failing_signers
            .lock()
            .unwrap()
            .insert(address.into(), error);
    }

    /// Queue the result of the next confirmation query
    pub fn push_confirmation(&self, status: Result<ConfirmationStatus, BlockchainError>) {
        self.confirmations.lock().unwrap().push_back(status);
    }

    /// Status reported once the queue is drained
    pub fn set_default_confirmation(&self, status: ConfirmationStatus) {
        *self.default_confirmation.lock().unwrap() = status;
    }

    /// Successful and failed broadcast attempts
    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    /// Broadcast attempts signed by `address`
    pub fn broadcasts_from(&self, address: &str) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.signer_address == address)
            .count()
    }

    /// Distinct payloads ever broadcast by `address`
    pub fn distinct_payloads_from(&self, address: &str) -> usize {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.signer_address == address)
            .map(|s| s.payload.clone())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Blockchain(BlockchainError::RpcError(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainBroadcaster for MockBroadcaster {
    async fn health_check(&self) -> Result<(), AppError> {
        self.check_should_fail()
    }

    async fn prepare_transfer(
        &self,
        intent: &TransferIntent,
    ) -> Result<UnsignedTransaction, AppError> {
        self.check_should_fail()?;
        self.prepared.fetch_add(1, Ordering::SeqCst);
        let payload = format!(
            "{}|{}|{}|{}|{}",
            intent.reference, intent.from_address, intent.to_address, intent.amount, intent.token
        );
        Ok(UnsignedTransaction {
            intent: intent.clone(),
            payload: payload.into_bytes(),
        })
    }

    async fn broadcast(&self, _chain: &str, signed: &SignedTransaction) -> Result<String, AppError> {
        self.check_should_fail()?;
        self.broadcasts.lock().unwrap().push(signed.clone());

        if let Some(error) = self.failing_signers.lock().unwrap().get(&signed.signer_address) {
            return Err(AppError::Blockchain(error.clone()));
        }
        if let Some(error) = self.broadcast_errors.lock().unwrap().pop_front() {
            return Err(AppError::Blockchain(error));
        }
        Ok(signed.signature.clone())
    }

    async fn get_confirmation_status(
        &self,
        _chain: &str,
        _tx_id: &str,
    ) -> Result<ConfirmationStatus, AppError> {
        self.check_should_fail()?;
        match self.confirmations.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(e)) => Err(AppError::Blockchain(e)),
            None => Ok(self.default_confirmation.lock().unwrap().clone()),
        }
    }
}

// ============================================================================
// SIGNER
// ============================================================================

/// Signer producing deterministic digests instead of real signatures
pub struct MockSigner {
    config: MockConfig,
    signed: AtomicUsize,
}

impl MockSigner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MockConfig::success(),
            signed: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            config: MockConfig::failure(message),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn sign_count(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionSigner for MockSigner {
    async fn sign(
        &self,
        wallet_ref: &str,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, AppError> {
        if self.config.should_fail {
            return Err(SigningError::SigningUnavailable(self.config.message()).into());
        }
        self.signed.fetch_add(1, Ordering::SeqCst);

        let mut hasher = Sha256::new();
        hasher.update(wallet_ref.as_bytes());
        hasher.update(&unsigned.payload);
        let digest = hasher.finalize();
        let mut signature = [0u8; 64];
        signature[..32].copy_from_slice(&digest);
        signature[32..].copy_from_slice(&digest);

        Ok(SignedTransaction {
            chain: unsigned.intent.chain.clone(),
            signer_address: unsigned.intent.from_address.clone(),
            payload: unsigned.payload.clone(),
            signature: bs58::encode(signature).into_string(),
        })
    }
}

// ============================================================================
// READ CONTRACTS
// ============================================================================

/// In-memory transaction history index
pub struct MockHistoryStore {
    history: Mutex<HashMap<(String, String), Vec<HistoricalTransaction>>>,
    entities: Mutex<Vec<KnownEntity>>,
    queries: AtomicUsize,
    config: MockConfig,
}

impl MockHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            entities: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            config,
        }
    }

    pub fn set_history(&self, address: &str, chain: &str, history: Vec<HistoricalTransaction>) {
        self.history
            .lock()
            .unwrap()
            .insert((address.to_string(), chain.to_string()), history);
    }

    pub fn add_entity(&self, address: &str, label: &str) {
        self.entities.lock().unwrap().push(KnownEntity {
            address: address.to_string(),
            label: label.to_string(),
        });
    }

    /// Number of `get_transactions_for_address` calls served
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Default for MockHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionHistoryStore for MockHistoryStore {
    async fn get_transactions_for_address(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<HistoricalTransaction>, AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(self.config.message())));
        }
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(&(address.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_known_entities(&self) -> Result<Vec<KnownEntity>, AppError> {
        Ok(self.entities.lock().unwrap().clone())
    }
}

/// In-memory wallet registry
pub struct MockWalletStore {
    wallets: Mutex<HashMap<String, WalletInfo>>,
    preferences: Mutex<HashMap<String, PrivacyPreferences>>,
}

impl MockWalletStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wallets: Mutex::new(HashMap::new()),
            preferences: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_wallet(&self, wallet_id: &str, address: &str, chain: &str) {
        self.wallets.lock().unwrap().insert(
            wallet_id.to_string(),
            WalletInfo {
                wallet_id: wallet_id.to_string(),
                address: address.to_string(),
                chain: chain.to_string(),
            },
        );
    }

    pub fn set_preferences(&self, preferences: PrivacyPreferences) {
        self.preferences
            .lock()
            .unwrap()
            .insert(preferences.wallet_id.clone(), preferences);
    }
}

impl Default for MockWalletStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletStore for MockWalletStore {
    async fn resolve_wallet(&self, wallet_id: &str) -> Result<Option<WalletInfo>, AppError> {
        Ok(self.wallets.lock().unwrap().get(wallet_id).cloned())
    }

    async fn get_privacy_preferences(
        &self,
        wallet_id: &str,
    ) -> Result<Option<PrivacyPreferences>, AppError> {
        Ok(self.preferences.lock().unwrap().get(wallet_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_injection_is_consumed() {
        let store = MockTransferStore::new();
        store.fail_next_wallet_inserts_with_duplicate(1);
        let record = HopWalletRecord {
            wallet: crate::domain::EphemeralWallet {
                address: "A".to_string(),
                chain: "solana".to_string(),
                plan_id: "p".to_string(),
                created_at: Utc::now(),
                expires_at: Utc::now(),
                retired_at: None,
            },
            encrypted_key: Some("k".to_string()),
            key_fingerprint: "f".to_string(),
        };
        tokio_test::assert_err!(store.insert_hop_wallet(&record).await);
        tokio_test::assert_ok!(store.insert_hop_wallet(&record).await);
        tokio_test::assert_err!(store.insert_hop_wallet(&record).await);
        assert_eq!(store.hop_wallet_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcaster_resend_is_idempotent() {
        let broadcaster = MockBroadcaster::new();
        let signed = SignedTransaction {
            chain: "solana".to_string(),
            signer_address: "A".to_string(),
            payload: vec![1],
            signature: "sig".to_string(),
        };
        let first = broadcaster.broadcast("solana", &signed).await.unwrap();
        let second = broadcaster.broadcast("solana", &signed).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broadcaster.distinct_payloads_from("A"), 1);
    }
}
