//! Background worker resuming approved transfers after restarts or lease expiry,
//! and sweeping expired hop wallets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use super::service::{DEFAULT_MAX_CONCURRENT_TRANSFERS, PrivacyTransferService};
use crate::domain::{AppError, TransferStore};

/// Configuration for the resume worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// Records fetched per poll
    pub batch_size: i64,
    pub max_concurrent_transfers: usize,
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from `WORKER_*` environment variables
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        Self {
            poll_interval: env::var("WORKER_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: env::var("WORKER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_concurrent_transfers: env::var("WORKER_MAX_CONCURRENT_TRANSFERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_transfers),
            enabled: env::var("ENABLE_RESUME_WORKER")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.enabled),
        }
    }
}

/// Polls the store for resumable records and hands them to the service
pub struct ResumeWorker {
    service: Arc<PrivacyTransferService>,
    store: Arc<dyn TransferStore>,
    config: WorkerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ResumeWorker {
    pub fn new(
        service: Arc<PrivacyTransferService>,
        store: Arc<dyn TransferStore>,
        config: WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            store,
            config,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal flips to `true`
    pub async fn run(mut self) {
        if !self.config.enabled {
            info!("Resume worker is disabled");
            return;
        }
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Resume worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Resume poll failed");
                    }
                    if let Err(e) = self.service.sweep_expired_wallets(self.config.batch_size).await {
                        error!(error = %e, "Hop wallet sweep failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Resume worker received shutdown signal");
                        break;
                    }
                }
            }
        }
        info!("Resume worker stopped");
    }

    /// Dispatch one batch of resumable records; returns how many were started
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<usize, AppError> {
        let free = self.service.available_permits();
        if free == 0 {
            debug!("No free execution slots");
            return Ok(0);
        }
        let limit = self.config.batch_size.min(free as i64).max(1);
        let ids = self.store.list_resumable(Utc::now(), limit).await?;

        let started = ids
            .iter()
            .filter(|id| self.service.dispatch(id))
            .count();
        if started > 0 {
            info!(count = started, "Resumed transfers");
        }
        Ok(started)
    }
}

/// Spawn the worker; send `true` on the returned channel to stop it
pub fn spawn_worker(
    service: Arc<PrivacyTransferService>,
    store: Arc<dyn TransferStore>,
    config: WorkerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ResumeWorker::new(service, store, config, shutdown_rx);
    let handle = tokio::spawn(worker.run());
    (handle, shutdown_tx)
}
