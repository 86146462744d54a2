//! Application layer: planning, execution and analysis workflows.

pub mod analyzer;
pub mod engine;
pub mod planner;
pub mod risk_model;
pub mod service;
pub mod signer;
pub mod wallet_pool;
pub mod worker;

pub use analyzer::{AnalyzerConfig, TrackingAnalyzer};
pub use engine::{EngineConfig, ExecutionEngine};
pub use planner::{PathPlanner, PlannerConfig};
pub use risk_model::{KnownEntities, RiskModel, RiskWeights, TransactionGraph};
pub use service::PrivacyTransferService;
pub use signer::RoutingSigner;
pub use wallet_pool::{HopWalletPool, RetirementPolicy, WalletPoolConfig};
pub use worker::{ResumeWorker, WorkerConfig, spawn_worker};
