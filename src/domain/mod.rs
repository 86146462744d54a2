//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{
    AppError, BlockchainError, ConfigError, DatabaseError, ExecutionError, PlanningError,
    SigningError, ValidationError,
};
pub use traits::{
    BroadcastGate, CancelOutcome, ChainBroadcaster, HopWalletStore, TransactionHistoryStore,
    TransactionSigner, TransferStore, WalletStore,
};
pub use types::{
    CANCELLED_REASON, ConfirmationStatus, CustomConfig, Direction, EphemeralWallet,
    HistoricalTransaction, HopFailure, HopOutcome, HopPlan, HopStatus, HopStep, HopWalletRecord,
    KnownEntity, Lease, PrivacyLevel, PrivacyPreferences, RiskFactor, RiskFactorKind, RiskLevel,
    SignedTransaction, StatusTransition, TrackingAnalysis, TrackingRiskReport,
    TransferHistoryFilter, TransferIntent, TransferRecord, TransferRequest, TransferStatus,
    UnsignedTransaction, WalletInfo,
};
