//! Transfer Execution Engine
//!
//! Drives a persisted hop plan through `Planned -> InProgress -> terminal`.
//! The store is the only source of truth: every step is reloaded before it is
//! acted on, the signature is persisted before the first broadcast, and a step
//! that already carries a transaction id is polled rather than re-sent.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::wallet_pool::HopWalletPool;
use crate::domain::{
    AppError, BlockchainError, BroadcastGate, CANCELLED_REASON, ChainBroadcaster,
    ConfirmationStatus, ExecutionError, HopFailure, HopOutcome, HopStatus, HopStep,
    SignedTransaction, TransactionSigner, TransferIntent, TransferRecord, TransferStatus,
    TransferStore,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Execution engine policy
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broadcast/confirm attempts per hop before it is marked failed
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Lease duration; renewed to cover jitter and polling
    pub lease_ttl: Duration,
    /// How long one attempt waits for confirmation
    pub confirmation_timeout: Duration,
    pub confirmation_poll_interval: Duration,
    /// Pause before a losing resumer re-reads the record
    pub contention_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(30),
            confirmation_timeout: Duration::from_secs(60),
            confirmation_poll_interval: Duration::from_secs(2),
            contention_backoff: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `ENGINE_*` environment variables
    pub fn from_env() -> Self {
        use std::env;

        fn parsed<T: FromStr>(key: &str, default: T) -> T {
            env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            max_attempts: parsed("ENGINE_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_backoff: Duration::from_millis(parsed(
                "ENGINE_BASE_BACKOFF_MS",
                defaults.base_backoff.as_millis() as u64,
            )),
            max_backoff: Duration::from_secs(parsed(
                "ENGINE_MAX_BACKOFF_SECS",
                defaults.max_backoff.as_secs(),
            )),
            lease_ttl: Duration::from_secs(parsed(
                "ENGINE_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )),
            confirmation_timeout: Duration::from_secs(parsed(
                "ENGINE_CONFIRMATION_TIMEOUT_SECS",
                defaults.confirmation_timeout.as_secs(),
            )),
            confirmation_poll_interval: Duration::from_millis(parsed(
                "ENGINE_CONFIRMATION_POLL_MS",
                defaults.confirmation_poll_interval.as_millis() as u64,
            )),
            contention_backoff: defaults.contention_backoff,
        }
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
#[must_use]
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(max)
}

// ============================================================================
// ENGINE
// ============================================================================

/// How a single step ended
enum StepResult {
    Confirmed,
    Failed(String),
    Cancelled,
    /// The lease was lost; another resumer owns the record now
    Yielded,
}

/// How transaction preparation ended
enum Prepared {
    Signed(SignedTransaction),
    Failed(String),
    Yielded,
}

/// How one confirmation wait ended
enum ConfirmWait {
    Confirmed,
    Rejected(String),
    TimedOut,
    LeaseLost,
}

/// Durable, resumable executor of hop plans
pub struct ExecutionEngine {
    store: Arc<dyn TransferStore>,
    signer: Arc<dyn TransactionSigner>,
    broadcaster: Arc<dyn ChainBroadcaster>,
    pool: Arc<HopWalletPool>,
    config: EngineConfig,
    /// Prefix of every lease owner this instance takes
    owner_id: String,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn TransferStore>,
        signer: Arc<dyn TransactionSigner>,
        broadcaster: Arc<dyn ChainBroadcaster>,
        pool: Arc<HopWalletPool>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            signer,
            broadcaster,
            pool,
            config,
            owner_id: format!("engine-{}", Uuid::new_v4()),
        }
    }

    /// Execute (or resume) a record and return its latest snapshot.
    ///
    /// Losing the lease race is not an error: the current snapshot is returned.
    #[instrument(skip(self), fields(transfer_id = %record_id))]
    pub async fn execute(&self, record_id: &str) -> Result<TransferRecord, AppError> {
        let record = self.load(record_id).await?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "Record already terminal");
            return Ok(record);
        }
        if !record.execution_requested {
            return Err(ExecutionError::InvalidTransition {
                transfer_id: record_id.to_string(),
                from: record.status.to_string(),
                to: TransferStatus::InProgress.to_string(),
            }
            .into());
        }

        // Lease owner is unique per call
        let lease = format!("{}:{}", self.owner_id, Uuid::new_v4());
        if !self
            .store
            .acquire_lease(record_id, &lease, self.config.lease_ttl)
            .await?
        {
            debug!("Lease held by another resumer, backing off");
            tokio::time::sleep(self.config.contention_backoff).await;
            return self.load(record_id).await;
        }

        let outcome = self.drive(record_id, &lease).await;
        if let Err(e) = self.store.release_lease(record_id, &lease).await {
            warn!(error = %e, "Failed to release lease");
        }
        if let Err(e) = outcome {
            error!(error = %e, "Execution interrupted, record left for resume");
            return Err(e);
        }
        self.load(record_id).await
    }

    async fn load(&self, id: &str) -> Result<TransferRecord, AppError> {
        self.store
            .get_transfer(id)
            .await?
            .ok_or_else(|| ExecutionError::TransferNotFound(id.to_string()).into())
    }

    async fn drive(&self, id: &str, lease: &str) -> Result<(), AppError> {
        let mut record = self.load(id).await?;

        if record.status == TransferStatus::Planned {
            let started = self
                .store
                .transition_status(id, TransferStatus::Planned, TransferStatus::InProgress, None)
                .await?;
            record = self.load(id).await?;
            if !started && record.status != TransferStatus::InProgress {
                info!(status = %record.status, "Record left Planned before execution began");
                return Ok(());
            }
            info!(steps = record.plan.steps.len(), "Transfer execution started");
        }
        if record.status != TransferStatus::InProgress {
            return Ok(());
        }

        for index in 0..record.plan.steps.len() {
            let record = self.load(id).await?;
            if record.status.is_terminal() {
                return Ok(());
            }
            let step = record.plan.steps[index].clone();

            let result = match step.status {
                HopStatus::Confirmed => continue,
                HopStatus::Failed => StepResult::Failed(
                    step.last_error
                        .clone()
                        .unwrap_or_else(|| "hop failed".to_string()),
                ),
                HopStatus::Pending | HopStatus::Broadcasting => {
                    self.run_step(&record, step, lease).await?
                }
            };

            match result {
                StepResult::Confirmed => {
                    if index > 0 {
                        let source = &record.plan.steps[index].source_address;
                        if let Err(e) = self.pool.retire(source).await {
                            warn!(hop = index, error = %e, "Failed to retire forwarded hop wallet");
                        }
                    }
                }
                StepResult::Failed(reason) => return self.halt(id, index, reason).await,
                StepResult::Cancelled => {
                    return self.halt(id, index, CANCELLED_REASON.to_string()).await;
                }
                StepResult::Yielded => {
                    warn!(hop = index, "Execution yielded before the hop finished");
                    return Ok(());
                }
            }
        }

        if self
            .store
            .transition_status(id, TransferStatus::InProgress, TransferStatus::Completed, None)
            .await?
        {
            info!("Transfer completed");
        }
        Ok(())
    }

    /// Finish a record stopped at `index`; unfunded intermediaries are retired
    async fn halt(&self, id: &str, index: usize, reason: String) -> Result<(), AppError> {
        let record = self.load(id).await?;
        let status = record.halted_status();
        let holding_address = record.plan.steps[index].source_address.clone();
        let failure = HopFailure {
            hop_index: index,
            reason: reason.clone(),
            holding_address: holding_address.clone(),
        };

        if !self
            .store
            .transition_status(id, TransferStatus::InProgress, status, Some(&failure))
            .await?
        {
            warn!(hop = index, "Record changed before it could be halted");
            return Ok(());
        }
        warn!(
            hop = index,
            status = %status,
            holding_address = %holding_address,
            reason = %reason,
            "Transfer halted"
        );

        for step in record.plan.steps.iter().skip(index + 1) {
            if let Err(e) = self.pool.retire(&step.source_address).await {
                warn!(address = %step.source_address, error = %e, "Failed to retire unused hop wallet");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, record, step), fields(hop = step.index))]
    async fn run_step(
        &self,
        record: &TransferRecord,
        mut step: HopStep,
        lease: &str,
    ) -> Result<StepResult, AppError> {
        let id = record.id.as_str();

        if step.status == HopStatus::Pending {
            if step.delay_secs > 0 {
                let delay = Duration::from_secs(step.delay_secs);
                if !self.keep_lease(id, lease, delay).await? {
                    return Ok(StepResult::Yielded);
                }
                debug!(delay_secs = step.delay_secs, "Applying hop jitter");
                tokio::time::sleep(delay).await;
            }
            if !self.keep_lease(id, lease, Duration::ZERO).await? {
                return Ok(StepResult::Yielded);
            }
            match self.store.begin_hop_broadcast(id, step.index).await? {
                BroadcastGate::Open => step.status = HopStatus::Broadcasting,
                BroadcastGate::Cancelled => {
                    info!("Cancellation accepted before broadcast");
                    return Ok(StepResult::Cancelled);
                }
                BroadcastGate::Superseded => {
                    warn!("Hop advanced by another executor");
                    return Ok(StepResult::Yielded);
                }
            }
        }

        let signed = match step.signed_tx.clone() {
            Some(signed) => signed,
            None => match self.prepare_and_sign(record, &mut step, lease).await? {
                Prepared::Signed(signed) => signed,
                Prepared::Failed(reason) => return self.fail_step(id, &mut step, reason).await,
                Prepared::Yielded => return Ok(StepResult::Yielded),
            },
        };

        let chain = record.plan.chain.as_str();
        let mut resend = step.tx_id.is_none();

        loop {
            if step.attempts >= self.config.max_attempts {
                let reason = format!(
                    "retry budget exhausted after {} attempts: {}",
                    step.attempts,
                    step.last_error.clone().unwrap_or_default()
                );
                return self.fail_step(id, &mut step, reason).await;
            }
            if !self.keep_lease(id, lease, Duration::ZERO).await? {
                return Ok(StepResult::Yielded);
            }

            step.attempts += 1;
            let attempt = step.attempts;

            let transient: AppError = 'attempt: {
                if resend {
                    match self.broadcaster.broadcast(chain, &signed).await {
                        Ok(tx_id) => {
                            debug!(tx_id = %tx_id, attempt, "Hop broadcast");
                            step.tx_id = Some(tx_id);
                            step.updated_at = Utc::now();
                            self.store.update_hop(id, &step).await?;
                        }
                        Err(e) if e.is_transient() => break 'attempt e,
                        Err(e) => return self.fail_step(id, &mut step, e.to_string()).await,
                    }
                }

                let Some(tx_id) = step.tx_id.clone() else {
                    break 'attempt AppError::Internal("broadcast returned no tx id".to_string());
                };
                match self.wait_for_confirmation(id, chain, &tx_id, lease).await {
                    Ok(ConfirmWait::Confirmed) => return self.confirm_step(id, &mut step).await,
                    Ok(ConfirmWait::Rejected(reason)) => {
                        return self
                            .fail_step(id, &mut step, format!("rejected: {}", reason))
                            .await;
                    }
                    Ok(ConfirmWait::LeaseLost) => return Ok(StepResult::Yielded),
                    Ok(ConfirmWait::TimedOut) => {
                        break 'attempt AppError::Blockchain(BlockchainError::Timeout(format!(
                            "{} not confirmed within {:?}",
                            tx_id, self.config.confirmation_timeout
                        )));
                    }
                    Err(e) if e.is_transient() => break 'attempt e,
                    Err(e) => return self.fail_step(id, &mut step, e.to_string()).await,
                }
            };

            warn!(attempt, error = %transient, "Transient hop failure, retrying");
            step.last_error = Some(transient.to_string());
            step.updated_at = Utc::now();
            self.store.update_hop(id, &step).await?;
            self.store
                .append_outcome(
                    id,
                    &HopOutcome {
                        hop_index: step.index,
                        status: HopStatus::Broadcasting,
                        tx_id: step.tx_id.clone(),
                        error: step.last_error.clone(),
                        attempt,
                        recorded_at: Utc::now(),
                    },
                )
                .await?;

            if step.attempts < self.config.max_attempts {
                let backoff = calculate_backoff(
                    attempt - 1,
                    self.config.base_backoff,
                    self.config.max_backoff,
                );
                if !self.keep_lease(id, lease, backoff).await? {
                    return Ok(StepResult::Yielded);
                }
                tokio::time::sleep(backoff).await;
            }
            resend = true;
        }
    }

    /// Build and sign the hop transaction, persisting the signature
    async fn prepare_and_sign(
        &self,
        record: &TransferRecord,
        step: &mut HopStep,
        lease: &str,
    ) -> Result<Prepared, AppError> {
        let intent = TransferIntent {
            chain: record.plan.chain.clone(),
            token: record.plan.token.clone(),
            from_address: step.source_address.clone(),
            to_address: step.destination_address.clone(),
            amount: step.amount,
            reference: format!("{}:{}", record.id, step.index),
        };

        let mut attempt = 0u32;
        loop {
            let result = match self.broadcaster.prepare_transfer(&intent).await {
                Ok(unsigned) => self.signer.sign(&step.signer_ref, &unsigned).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(signed) => {
                    step.signed_tx = Some(signed.clone());
                    step.updated_at = Utc::now();
                    self.store.update_hop(&record.id, step).await?;
                    debug!(signer = %signed.signer_address, "Hop signed");
                    return Ok(Prepared::Signed(signed));
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.max_attempts => {
                    warn!(attempt, error = %e, "Transient failure preparing hop");
                    let backoff =
                        calculate_backoff(attempt, self.config.base_backoff, self.config.max_backoff);
                    if !self.keep_lease(&record.id, lease, backoff).await? {
                        return Ok(Prepared::Yielded);
                    }
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Ok(Prepared::Failed(e.to_string())),
            }
        }
    }

    async fn wait_for_confirmation(
        &self,
        id: &str,
        chain: &str,
        tx_id: &str,
        lease: &str,
    ) -> Result<ConfirmWait, AppError> {
        let deadline = tokio::time::Instant::now() + self.config.confirmation_timeout;
        loop {
            match self.broadcaster.get_confirmation_status(chain, tx_id).await? {
                ConfirmationStatus::Confirmed => return Ok(ConfirmWait::Confirmed),
                ConfirmationStatus::Rejected(reason) => return Ok(ConfirmWait::Rejected(reason)),
                ConfirmationStatus::Pending => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(ConfirmWait::TimedOut);
            }
            let poll = self.config.confirmation_poll_interval;
            if !self.keep_lease(id, lease, poll).await? {
                return Ok(ConfirmWait::LeaseLost);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn confirm_step(&self, id: &str, step: &mut HopStep) -> Result<StepResult, AppError> {
        step.status = HopStatus::Confirmed;
        step.last_error = None;
        step.updated_at = Utc::now();
        self.store.update_hop(id, step).await?;
        self.store
            .append_outcome(
                id,
                &HopOutcome {
                    hop_index: step.index,
                    status: HopStatus::Confirmed,
                    tx_id: step.tx_id.clone(),
                    error: None,
                    attempt: step.attempts,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        info!(tx_id = ?step.tx_id, attempts = step.attempts, "Hop confirmed");
        Ok(StepResult::Confirmed)
    }

    async fn fail_step(
        &self,
        id: &str,
        step: &mut HopStep,
        reason: String,
    ) -> Result<StepResult, AppError> {
        step.status = HopStatus::Failed;
        step.last_error = Some(reason.clone());
        step.updated_at = Utc::now();
        self.store.update_hop(id, step).await?;
        self.store
            .append_outcome(
                id,
                &HopOutcome {
                    hop_index: step.index,
                    status: HopStatus::Failed,
                    tx_id: step.tx_id.clone(),
                    error: Some(reason.clone()),
                    attempt: step.attempts,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
        error!(reason = %reason, "Hop failed");
        Ok(StepResult::Failed(reason))
    }

    /// Renew the lease so it covers `upcoming` plus one TTL
    async fn keep_lease(&self, id: &str, lease: &str, upcoming: Duration) -> Result<bool, AppError> {
        self.store
            .renew_lease(id, lease, upcoming + self.config.lease_ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_backoff() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(60);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_secs(1));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_secs(2));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_secs(4));
        assert_eq!(calculate_backoff(5, base, max), Duration::from_secs(32));
        assert_eq!(calculate_backoff(6, base, max), Duration::from_secs(60));
        assert_eq!(calculate_backoff(100, base, max), Duration::from_secs(60));
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_backoff, Duration::from_secs(60));
    }
}
