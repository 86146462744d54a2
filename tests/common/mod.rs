//! Shared wiring for integration tests: the full engine stack over in-memory mocks.

#![allow(dead_code)]

use std::sync::Arc;

use privacy_transfer_engine::app::{
    AnalyzerConfig, EngineConfig, ExecutionEngine, HopWalletPool, PathPlanner, PlannerConfig,
    PrivacyTransferService, RiskModel, RoutingSigner, TrackingAnalyzer, WalletPoolConfig,
};
use privacy_transfer_engine::domain::{
    PrivacyLevel, TransactionSigner, TransferRecord, TransferRequest, TransferStore,
};
use privacy_transfer_engine::infra::{KeyCipher, KeyStrategyRegistry};
use privacy_transfer_engine::test_utils::{
    MockBroadcaster, MockHistoryStore, MockSigner, MockTransferStore, MockWalletStore,
};

pub const WALLET_ID: &str = "wallet_1";
pub const SOURCE_ADDRESS: &str = "SrcWa11et1111111111111111111111111111111111";
pub const DESTINATION: &str = "DestWa11et111111111111111111111111111111111";

pub struct Harness {
    pub store: Arc<MockTransferStore>,
    pub wallets: Arc<MockWalletStore>,
    pub history: Arc<MockHistoryStore>,
    pub broadcaster: Arc<MockBroadcaster>,
    pub source_signer: Arc<MockSigner>,
    pub pool: Arc<HopWalletPool>,
    pub engine: Arc<ExecutionEngine>,
    pub service: Arc<PrivacyTransferService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_engine_config(EngineConfig::default())
    }

    pub fn with_engine_config(engine_config: EngineConfig) -> Self {
        Self::with_configs(engine_config, WalletPoolConfig::default())
    }

    pub fn with_pool_config(pool_config: WalletPoolConfig) -> Self {
        Self::with_configs(EngineConfig::default(), pool_config)
    }

    fn with_configs(engine_config: EngineConfig, pool_config: WalletPoolConfig) -> Self {
        let store = Arc::new(MockTransferStore::new());
        let wallets = Arc::new(MockWalletStore::new());
        wallets.add_wallet(WALLET_ID, SOURCE_ADDRESS, "solana");
        let history = Arc::new(MockHistoryStore::new());
        let broadcaster = Arc::new(MockBroadcaster::new());
        let source_signer = Arc::new(MockSigner::new());

        let pool = Arc::new(HopWalletPool::new(
            store.clone(),
            KeyStrategyRegistry::with_defaults(),
            Arc::new(KeyCipher::generate()),
            pool_config,
        ));
        let planner = Arc::new(PathPlanner::new(
            pool.clone(),
            RiskModel::default(),
            PlannerConfig {
                rng_seed: Some(42),
                ..Default::default()
            },
        ));
        let source: Arc<dyn TransactionSigner> = source_signer.clone();
        let signer = Arc::new(RoutingSigner::new(pool.clone(), Some(source)));
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            signer,
            broadcaster.clone(),
            pool.clone(),
            engine_config,
        ));
        let analyzer = Arc::new(TrackingAnalyzer::new(
            history.clone(),
            wallets.clone(),
            RiskModel::default(),
            AnalyzerConfig::default(),
        ));
        let service = Arc::new(PrivacyTransferService::new(
            store.clone(),
            wallets.clone(),
            pool.clone(),
            planner,
            engine.clone(),
            analyzer,
        ));

        Self {
            store,
            wallets,
            history,
            broadcaster,
            source_signer,
            pool,
            engine,
            service,
        }
    }

    /// Plan a transfer and approve it without dispatching
    pub async fn plan_approved(&self, request: &TransferRequest) -> String {
        let plan = self.service.plan_transfer(request).await.unwrap();
        assert!(
            self.store
                .mark_execution_requested(&plan.transfer_id)
                .await
                .unwrap()
        );
        plan.transfer_id
    }

    pub fn record(&self, id: &str) -> TransferRecord {
        self.store.record(id).expect("record exists")
    }

    /// Yield to spawned tasks until `cond` holds; paused time does not advance meanwhile
    pub async fn spin_until(&self, id: &str, cond: impl Fn(&TransferRecord) -> bool) {
        for _ in 0..100_000 {
            if cond(&self.record(id)) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("record {} never reached the expected state", id);
    }
}

pub fn request(amount: &str, level: PrivacyLevel) -> TransferRequest {
    TransferRequest::new(WALLET_ID, DESTINATION, "SOL", "solana", amount, level)
}
