//! Application service layer: the public surface of the privacy engine.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use super::analyzer::TrackingAnalyzer;
use super::engine::ExecutionEngine;
use super::planner::PathPlanner;
use super::wallet_pool::HopWalletPool;
use crate::domain::{
    AppError, CancelOutcome, DatabaseError, ExecutionError, HopPlan, PrivacyPreferences,
    TrackingAnalysis, TrackingRiskReport, TransferHistoryFilter, TransferRecord, TransferRequest,
    TransferStatus, TransferStore, ValidationError, WalletStore,
};

/// Default bound on concurrently executing records
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 16;

/// Application service containing the transfer and analysis workflows
pub struct PrivacyTransferService {
    transfers: Arc<dyn TransferStore>,
    wallets: Arc<dyn WalletStore>,
    pool: Arc<HopWalletPool>,
    planner: Arc<PathPlanner>,
    engine: Arc<ExecutionEngine>,
    analyzer: Arc<TrackingAnalyzer>,
    /// Records with a live execution task in this process
    in_flight: Arc<DashMap<String, ()>>,
    permits: Arc<Semaphore>,
}

impl PrivacyTransferService {
    #[must_use]
    pub fn new(
        transfers: Arc<dyn TransferStore>,
        wallets: Arc<dyn WalletStore>,
        pool: Arc<HopWalletPool>,
        planner: Arc<PathPlanner>,
        engine: Arc<ExecutionEngine>,
        analyzer: Arc<TrackingAnalyzer>,
    ) -> Self {
        Self {
            transfers,
            wallets,
            pool,
            planner,
            engine,
            analyzer,
            in_flight: Arc::new(DashMap::new()),
            permits: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_TRANSFERS)),
        }
    }

    /// Bound the number of records executing at once
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrent: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
        self
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> Result<(), AppError> {
        self.transfers.health_check().await
    }

    /// Plan a transfer and persist it as `Planned` without queuing it.
    #[instrument(skip(self, request), fields(
        wallet_id = %request.source_wallet_id,
        chain = %request.chain,
        transfer_id = tracing::field::Empty,
    ))]
    pub async fn plan_transfer(&self, request: &TransferRequest) -> Result<HopPlan, AppError> {
        request.validate().map_err(|e| {
            warn!(error = %e, "Validation failed");
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;
        let amount = request.parse_amount()?;

        let wallet = self
            .wallets
            .resolve_wallet(&request.source_wallet_id)
            .await?
            .ok_or_else(|| ValidationError::InvalidField {
                field: "source_wallet_id".to_string(),
                message: format!("unknown wallet {}", request.source_wallet_id),
            })?;
        if !wallet.chain.eq_ignore_ascii_case(&request.chain_key()) {
            return Err(ValidationError::InvalidField {
                field: "chain".to_string(),
                message: format!(
                    "wallet {} lives on {}, not {}",
                    wallet.wallet_id, wallet.chain, request.chain
                ),
            }
            .into());
        }

        let effective = self.apply_preferences(request).await?;
        let transfer_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("transfer_id", transfer_id.as_str());

        let plan = self
            .planner
            .plan(&transfer_id, &effective, &wallet.address)
            .await?;

        let record = TransferRecord::new(effective, wallet.address, amount, plan.clone());
        if let Err(e) = self.transfers.insert_transfer(&record).await {
            error!(error = %e, "Failed to persist planned transfer");
            if let Err(retire_err) = self.pool.retire_plan(&transfer_id).await {
                warn!(error = %retire_err, "Failed to retire wallets of unpersisted plan");
            }
            return Err(e);
        }

        info!(
            hops = plan.hop_count(),
            total_fee = %plan.total_fee,
            risk = plan.simulated_risk_score,
            "Transfer planned"
        );
        Ok(plan)
    }

    /// Approve a planned record for execution and start it in the background.
    #[instrument(skip(self))]
    pub async fn commit_transfer(&self, transfer_id: &str) -> Result<TransferRecord, AppError> {
        let record = self.load(transfer_id).await?;
        if record.status.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                transfer_id: transfer_id.to_string(),
                status: record.status.to_string(),
            }
            .into());
        }

        if !record.execution_requested
            && !self.transfers.mark_execution_requested(transfer_id).await?
        {
            // Lost to a concurrent cancellation
            let current = self.load(transfer_id).await?;
            if !current.execution_requested {
                return Err(ExecutionError::AlreadyTerminal {
                    transfer_id: transfer_id.to_string(),
                    status: current.status.to_string(),
                }
                .into());
            }
        }

        self.dispatch(transfer_id);
        info!("Transfer committed for execution");
        self.load(transfer_id).await
    }

    /// Plan, commit and start a transfer; returns the current snapshot
    #[instrument(skip(self, request), fields(wallet_id = %request.source_wallet_id))]
    pub async fn execute_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferRecord, AppError> {
        let plan = self.plan_transfer(request).await?;
        self.commit_transfer(&plan.transfer_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_transfer(&self, transfer_id: &str) -> Result<TransferRecord, AppError> {
        self.load(transfer_id).await
    }

    /// Cancel a transfer that has not started broadcasting its current hop.
    #[instrument(skip(self))]
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<TransferRecord, AppError> {
        match self.transfers.request_cancellation(transfer_id).await? {
            CancelOutcome::CancelledBeforeStart => {
                self.pool.retire_plan(transfer_id).await?;
                info!("Planned transfer cancelled");
            }
            CancelOutcome::Requested => {
                info!("Cancellation requested, engine halts before its next broadcast");
            }
            CancelOutcome::TooLate { hop } => {
                warn!(hop, "Cancellation rejected");
                return Err(ExecutionError::CancellationTooLate {
                    transfer_id: transfer_id.to_string(),
                    hop,
                }
                .into());
            }
            CancelOutcome::AlreadyTerminal(status) => {
                return Err(ExecutionError::AlreadyTerminal {
                    transfer_id: transfer_id.to_string(),
                    status: status.to_string(),
                }
                .into());
            }
            CancelOutcome::NotFound => {
                return Err(ExecutionError::TransferNotFound(transfer_id.to_string()).into());
            }
        }
        self.load(transfer_id).await
    }

    /// Records of a source wallet, newest first
    #[instrument(skip(self, filter))]
    pub async fn get_transfer_history(
        &self,
        wallet_id: &str,
        filter: &TransferHistoryFilter,
    ) -> Result<Vec<TransferRecord>, AppError> {
        filter.validate().map_err(|e| {
            AppError::Validation(ValidationError::Multiple(e.to_string()))
        })?;
        self.transfers.list_transfers(wallet_id, filter).await
    }

    pub async fn analyze_tracking(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<TrackingAnalysis, AppError> {
        if address.trim().is_empty() {
            return Err(ValidationError::MissingField("address".to_string()).into());
        }
        self.analyzer.analyze_wallet_tracking(address, chain).await
    }

    pub async fn generate_privacy_report(
        &self,
        wallet_id: &str,
    ) -> Result<TrackingRiskReport, AppError> {
        self.analyzer.generate_wallet_privacy_report(wallet_id).await
    }

    /// Start a background execution task unless one is already live for the record.
    ///
    /// Returns false when the record was already in flight.
    pub fn dispatch(&self, transfer_id: &str) -> bool {
        if self.in_flight.insert(transfer_id.to_string(), ()).is_some() {
            return false;
        }

        let id = transfer_id.to_string();
        let engine = Arc::clone(&self.engine);
        let in_flight = Arc::clone(&self.in_flight);
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                in_flight.remove(&id);
                return;
            };
            match engine.execute(&id).await {
                Ok(record) => info!(transfer_id = %id, status = %record.status, "Execution task finished"),
                Err(e) => error!(transfer_id = %id, error = %e, "Execution task failed"),
            }
            in_flight.remove(&id);
        });
        true
    }

    /// Number of records with a live execution task
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Execution slots currently free
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Retire expired hop wallets of plans that will never run
    ///
    /// Wallets of terminal or orphaned plans are retired directly. A plan still
    /// awaiting approval is cancelled first. Approved and running records keep
    /// their wallets until the engine halts them.
    #[instrument(skip(self))]
    pub async fn sweep_expired_wallets(&self, limit: i64) -> Result<usize, AppError> {
        let mut swept = 0;
        for plan_id in self.pool.expired_plans(Utc::now(), limit).await? {
            let record = match self.transfers.get_transfer(&plan_id).await {
                Ok(record) => record,
                Err(AppError::Database(DatabaseError::NotFound(_))) => None,
                Err(e) => return Err(e),
            };
            match record {
                Some(r) if r.status == TransferStatus::Planned && !r.execution_requested => {
                    if !matches!(
                        self.transfers.request_cancellation(&plan_id).await?,
                        CancelOutcome::CancelledBeforeStart
                    ) {
                        continue;
                    }
                    info!(transfer_id = %plan_id, "Unapproved plan expired");
                }
                Some(r) if !r.status.is_terminal() => {
                    debug!(transfer_id = %plan_id, status = %r.status, "Expired wallets still in use");
                    continue;
                }
                _ => {}
            }
            self.pool.retire_plan(&plan_id).await?;
            swept += 1;
        }
        if swept > 0 {
            info!(count = swept, "Swept expired hop wallets");
        }
        Ok(swept)
    }

    /// Fill unset request fields from the wallet's stored preferences
    ///
    /// The stored custom configuration only applies when the effective level
    /// is the stored level.
    async fn apply_preferences(&self, request: &TransferRequest) -> Result<TransferRequest, AppError> {
        let mut effective = request.clone();
        if effective.privacy_level.is_some() && effective.custom_config.is_some() {
            return Ok(effective);
        }
        let prefs = self
            .wallets
            .get_privacy_preferences(&request.source_wallet_id)
            .await?
            .unwrap_or_else(|| PrivacyPreferences::defaults_for(&request.source_wallet_id));

        let level = *effective.privacy_level.get_or_insert(prefs.privacy_level);
        if level == prefs.privacy_level {
            effective.custom_config.get_or_insert(prefs.custom);
        }
        Ok(effective)
    }

    async fn load(&self, id: &str) -> Result<TransferRecord, AppError> {
        match self.transfers.get_transfer(id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) | Err(AppError::Database(DatabaseError::NotFound(_))) => {
                Err(ExecutionError::TransferNotFound(id.to_string()).into())
            }
            Err(e) => Err(e),
        }
    }
}
