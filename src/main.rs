//! Worker daemon: resumes approved privacy transfers until shut down.

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use privacy_transfer_engine::app::{
    AnalyzerConfig, EngineConfig, ExecutionEngine, HopWalletPool, PathPlanner, PlannerConfig,
    PrivacyTransferService, RiskModel, RiskWeights, RoutingSigner, TrackingAnalyzer,
    WalletPoolConfig, WorkerConfig, spawn_worker,
};
use privacy_transfer_engine::domain::{ChainBroadcaster, TransactionSigner, TransferStore};
use privacy_transfer_engine::infra::{
    KeyCipher, KeyStrategyRegistry, PostgresClient, PostgresConfig, RpcClientConfig,
    SolanaRpcClient, StaticKeySigner,
};

const DEFAULT_SOLANA_RPC_URL: &str = "https://api.devnet.solana.com";

/// Process configuration
struct Config {
    database_url: String,
    solana_rpc_url: String,
    hop_wallet_key: SecretString,
    worker_config: WorkerConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let solana_rpc_url =
            env::var("SOLANA_RPC_URL").unwrap_or_else(|_| DEFAULT_SOLANA_RPC_URL.to_string());

        let hop_wallet_key = env::var("HOP_WALLET_ENCRYPTION_KEY").map_err(|_| {
            anyhow::anyhow!(
                "HOP_WALLET_ENCRYPTION_KEY environment variable is not set.\n\
                 Provide a base64-encoded 32-byte key; it encrypts every hop wallet key at rest."
            )
        })?;
        if hop_wallet_key.trim().is_empty() {
            anyhow::bail!("HOP_WALLET_ENCRYPTION_KEY environment variable is empty");
        }

        Ok(Self {
            database_url,
            solana_rpc_url,
            hop_wallet_key: SecretString::from(hop_wallet_key),
            worker_config: WorkerConfig::from_env(),
        })
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let json = env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("Privacy Transfer Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    // Database
    let postgres = PostgresClient::new(&config.database_url, PostgresConfig::from_env()).await?;
    postgres.run_migrations().await?;
    let postgres = Arc::new(postgres);
    info!("Database connected and migrations applied");

    // Hop wallets
    let cipher = Arc::new(
        KeyCipher::from_base64(&config.hop_wallet_key)
            .context("HOP_WALLET_ENCRYPTION_KEY is not a valid key")?,
    );
    info!(fingerprint = %cipher.fingerprint(), "Hop wallet cipher ready");
    let pool = Arc::new(HopWalletPool::new(
        postgres.clone(),
        KeyStrategyRegistry::with_defaults(),
        cipher,
        WalletPoolConfig::from_env(),
    ));

    let risk_model = RiskModel::new(RiskWeights::from_env());
    let planner = Arc::new(PathPlanner::new(
        pool.clone(),
        risk_model.clone(),
        PlannerConfig::from_env(),
    ));

    // Signing and broadcast
    let source_signer: Option<Arc<dyn TransactionSigner>> = match StaticKeySigner::from_env()? {
        Some(signer) => Some(Arc::new(signer)),
        None => {
            warn!("SOURCE_WALLET_ID not configured; source legs cannot be signed");
            None
        }
    };
    let signer = Arc::new(RoutingSigner::new(pool.clone(), source_signer));
    let broadcaster: Arc<dyn ChainBroadcaster> = Arc::new(SolanaRpcClient::new(
        &config.solana_rpc_url,
        RpcClientConfig::from_env(),
    )?);
    info!(rpc_url = %config.solana_rpc_url, "Solana RPC client created");

    let engine = Arc::new(ExecutionEngine::new(
        postgres.clone(),
        signer,
        broadcaster,
        pool.clone(),
        EngineConfig::from_env(),
    ));
    let analyzer = Arc::new(TrackingAnalyzer::new(
        postgres.clone(),
        postgres.clone(),
        risk_model,
        AnalyzerConfig::from_env(),
    ));

    let service = Arc::new(
        PrivacyTransferService::new(
            postgres.clone(),
            postgres.clone(),
            pool,
            planner,
            engine,
            analyzer,
        )
        .with_max_concurrency(config.worker_config.max_concurrent_transfers),
    );

    service
        .health_check()
        .await
        .context("Database health check failed")?;

    let store: Arc<dyn TransferStore> = postgres;
    let (worker_handle, shutdown_tx) = spawn_worker(service, store, config.worker_config);

    shutdown_signal().await;
    info!("Shutting down resume worker...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Resume worker task ended abnormally");
    }

    info!("Shutdown complete");
    Ok(())
}
