//! Error types for the privacy transfer engine.

use thiserror::Error;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Network and timeout conditions are transient. Anything the chain or the
    /// signer rejected on its merits is not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Blockchain(e) => e.is_transient(),
            Self::Database(DatabaseError::Connection(_)) => true,
            _ => false,
        }
    }
}

/// Input validation errors (rejected before any allocation)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("{0}")]
    Multiple(String),
}

/// Path planning errors (plan is not persisted)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("Insufficient amount: {amount} cannot cover {hops} hop fee(s) of {fee_per_hop}")]
    InsufficientAmount {
        amount: String,
        hops: usize,
        fee_per_hop: String,
    },

    #[error("No viable wallet allocation: {0}")]
    NoViableWalletAllocation(String),

    #[error("Fee budget exceeded: {required} required, {budget} allowed")]
    FeeBudgetExceeded { required: String, budget: String },

    #[error("Latency budget exceeded: {hops} delayed hop(s) cannot fit in {budget_secs}s")]
    LatencyBudgetExceeded { hops: usize, budget_secs: u64 },
}

/// Persistence errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Duplicate(db_err.message().to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DatabaseError::from(err))
    }
}

/// Chain interaction errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockchainError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported token '{token}' on chain {chain}")]
    UnsupportedToken { chain: String, token: String },

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("Insufficient funds")]
    InsufficientFunds,
}

impl BlockchainError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::RpcError(_) | Self::Timeout(_)
        )
    }
}

/// Signing capability errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("Signing unavailable for {0}: key material missing or locked")]
    SigningUnavailable(String),

    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Key material could not be decrypted: {0}")]
    Decryption(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),
}

/// Execution state machine errors surfaced to callers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Transfer {0} not found")]
    TransferNotFound(String),

    #[error("Cancellation too late: hop {hop} of transfer {transfer_id} is already being broadcast")]
    CancellationTooLate { transfer_id: String, hop: usize },

    #[error("Transfer {transfer_id} is already terminal ({status})")]
    AlreadyTerminal { transfer_id: String, status: String },

    #[error("Hop {hop} failed: {reason}")]
    HopFailed { hop: usize, reason: String },

    #[error("Invalid state transition for {transfer_id}: {from} -> {to}")]
    InvalidTransition {
        transfer_id: String,
        from: String,
        to: String,
    },
}

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
