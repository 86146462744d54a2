//! Domain types with validation support.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::error::ValidationError;

/// Failure reason recorded when a transfer stops on a cancellation
pub const CANCELLED_REASON: &str = "cancelled";

/// Caller-selected privacy policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    /// Direct transfer, no intermediaries
    Standard,
    /// Two legs through one ephemeral wallet
    #[default]
    Enhanced,
    /// Three to five legs, chosen against the simulated risk ceiling
    Maximum,
}

impl PrivacyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Enhanced => "enhanced",
            Self::Maximum => "maximum",
        }
    }
}

impl FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "enhanced" => Ok(Self::Enhanced),
            "maximum" => Ok(Self::Maximum),
            _ => Err(format!("Invalid privacy level: {}", s)),
        }
    }
}

impl std::fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Optional per-request overrides of the planner policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Validate)]
pub struct CustomConfig {
    /// Ceiling on the number of legs
    #[validate(range(min = 1, max = 10, message = "max_hops must be between 1 and 10"))]
    pub max_hops: Option<usize>,
    /// Ceiling on the sum of reserved fees
    pub max_fee_budget: Option<Decimal>,
    /// Ceiling on the sum of jitter delays, in seconds
    pub max_total_latency_secs: Option<u64>,
    /// Floor on every jitter delay, in seconds
    pub min_hop_delay_secs: Option<u64>,
}

/// Privacy transfer request (input, immutable)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct TransferRequest {
    /// Source wallet reference, resolved through the wallet store
    #[validate(length(min = 1, message = "Source wallet id is required"))]
    pub source_wallet_id: String,
    /// Final destination address
    #[validate(length(min = 1, message = "Destination address is required"))]
    pub destination_address: String,
    /// Token identifier (e.g. "SOL")
    #[validate(length(min = 1, max = 64, message = "Token is required"))]
    pub token: String,
    /// Chain identifier (e.g. "solana")
    #[validate(length(min = 1, max = 32, message = "Chain is required"))]
    pub chain: String,
    /// Fixed-point decimal string
    #[validate(length(min = 1, max = 64, message = "Amount is required"))]
    pub amount: String,
    /// Falls back to the wallet's stored preference when absent
    pub privacy_level: Option<PrivacyLevel>,
    #[validate(nested)]
    pub custom_config: Option<CustomConfig>,
}

impl TransferRequest {
    #[must_use]
    pub fn new(
        source_wallet_id: impl Into<String>,
        destination_address: impl Into<String>,
        token: impl Into<String>,
        chain: impl Into<String>,
        amount: impl Into<String>,
        privacy_level: PrivacyLevel,
    ) -> Self {
        Self {
            source_wallet_id: source_wallet_id.into(),
            destination_address: destination_address.into(),
            token: token.into(),
            chain: chain.into(),
            amount: amount.into(),
            privacy_level: Some(privacy_level),
            custom_config: None,
        }
    }

    #[must_use]
    pub fn with_custom_config(mut self, custom: CustomConfig) -> Self {
        self.custom_config = Some(custom);
        self
    }

    /// Normalized chain identifier used for strategy and fee lookups
    #[must_use]
    pub fn chain_key(&self) -> String {
        self.chain.trim().to_ascii_lowercase()
    }

    /// Parse the amount string into a strictly positive decimal
    pub fn parse_amount(&self) -> Result<Decimal, ValidationError> {
        let amount = Decimal::from_str(self.amount.trim())
            .map_err(|e| ValidationError::InvalidAmount(format!("{}: {}", self.amount, e)))?;
        if amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidAmount(
                "Amount must be greater than 0".to_string(),
            ));
        }
        Ok(amount)
    }
}

/// Execution status of a single hop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HopStatus {
    #[default]
    Pending,
    /// Signing began; funds may be in flight
    Broadcasting,
    Confirmed,
    Failed,
}

impl HopStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Broadcasting => "broadcasting",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

impl FromStr for HopStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "broadcasting" => Ok(Self::Broadcasting),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid hop status: {}", s)),
        }
    }
}

impl std::fmt::Display for HopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signed transaction ready for broadcast
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedTransaction {
    pub chain: String,
    /// Address whose key produced the signature
    pub signer_address: String,
    /// Chain-specific message bytes that were signed
    pub payload: Vec<u8>,
    /// Base58 signature over `payload`
    pub signature: String,
}

/// One on-chain leg of a hop plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HopStep {
    /// Execution order, 0-based
    pub index: usize,
    pub source_address: String,
    pub destination_address: String,
    /// Wallet id for the first leg, ephemeral address for the rest
    pub signer_ref: String,
    /// Amount delivered by this leg, after its fee
    pub amount: Decimal,
    /// Fee reserved for this leg
    pub fee: Decimal,
    /// Jitter applied before this leg, in seconds
    pub delay_secs: u64,
    pub status: HopStatus,
    pub signed_tx: Option<SignedTransaction>,
    pub tx_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl HopStep {
    #[must_use]
    pub fn new(
        index: usize,
        source_address: impl Into<String>,
        destination_address: impl Into<String>,
        signer_ref: impl Into<String>,
        amount: Decimal,
        fee: Decimal,
        delay_secs: u64,
    ) -> Self {
        Self {
            index,
            source_address: source_address.into(),
            destination_address: destination_address.into(),
            signer_ref: signer_ref.into(),
            amount,
            fee,
            delay_secs,
            status: HopStatus::Pending,
            signed_tx: None,
            tx_id: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Ordered hop plan produced by the planner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HopPlan {
    pub transfer_id: String,
    pub chain: String,
    pub token: String,
    pub privacy_level: PrivacyLevel,
    pub steps: Vec<HopStep>,
    /// Sum of reserved fees
    pub total_fee: Decimal,
    /// Sum of scheduled jitter, in seconds
    pub estimated_latency_secs: u64,
    /// Risk Model score of the simulated path
    pub simulated_risk_score: u8,
    /// `100 - simulated_risk_score`
    pub privacy_score: u8,
    pub created_at: DateTime<Utc>,
}

impl HopPlan {
    /// Number of hops through intermediaries; a direct transfer has none.
    #[must_use]
    pub fn hop_count(&self) -> usize {
        if self.steps.len() <= 1 && self.ephemeral_addresses().is_empty() {
            0
        } else {
            self.steps.len()
        }
    }

    /// Amount the final destination receives
    #[must_use]
    pub fn delivered_amount(&self) -> Decimal {
        self.steps.last().map(|s| s.amount).unwrap_or(Decimal::ZERO)
    }

    /// Intermediary addresses in path order
    #[must_use]
    pub fn ephemeral_addresses(&self) -> Vec<String> {
        self.steps
            .iter()
            .skip(1)
            .map(|s| s.source_address.clone())
            .collect()
    }

    /// Check chaining and monotonicity invariants
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.index != i {
                return Err(format!("step {} has index {}", i, step.index));
            }
        }
        for pair in self.steps.windows(2) {
            if pair[0].destination_address != pair[1].source_address {
                return Err(format!(
                    "step {} destination does not feed step {}",
                    pair[0].index, pair[1].index
                ));
            }
            if pair[1].amount > pair[0].amount {
                return Err(format!("step {} amount increases", pair[1].index));
            }
        }
        if self.delivered_amount() <= Decimal::ZERO {
            return Err("delivered amount must be positive".to_string());
        }
        Ok(())
    }
}

/// Overall status of a transfer record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    #[default]
    Planned,
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::PartiallyCompleted => "partially_completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed
        )
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "partially_completed" => Ok(Self::PartiallyCompleted),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transfer status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry in the ordered hop outcome log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HopOutcome {
    pub hop_index: usize,
    pub status: HopStatus,
    pub tx_id: Option<String>,
    pub error: Option<String>,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Entry in the status transition history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusTransition {
    pub from: Option<TransferStatus>,
    pub to: TransferStatus,
    pub at: DateTime<Utc>,
}

/// Where a halted transfer stopped and who holds the funds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HopFailure {
    pub hop_index: usize,
    pub reason: String,
    /// Address still holding the residual funds
    pub holding_address: String,
}

/// Time-bounded exclusive claim on a record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Persisted transfer record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    pub id: String,
    pub request: TransferRequest,
    pub source_address: String,
    pub amount: Decimal,
    pub plan: HopPlan,
    pub status: TransferStatus,
    /// Plan approved for execution; unapproved plans are never picked up
    pub execution_requested: bool,
    pub cancel_requested: bool,
    pub failure: Option<HopFailure>,
    pub outcomes: Vec<HopOutcome>,
    pub transitions: Vec<StatusTransition>,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    #[must_use]
    pub fn new(
        request: TransferRequest,
        source_address: String,
        amount: Decimal,
        plan: HopPlan,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: plan.transfer_id.clone(),
            request,
            source_address,
            amount,
            plan,
            status: TransferStatus::Planned,
            execution_requested: false,
            cancel_requested: false,
            failure: None,
            outcomes: Vec::new(),
            transitions: vec![StatusTransition {
                from: None,
                to: TransferStatus::Planned,
                at: now,
            }],
            lease: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Index of the first step that is not yet confirmed
    #[must_use]
    pub fn next_step_index(&self) -> Option<usize> {
        self.plan
            .steps
            .iter()
            .position(|s| s.status != HopStatus::Confirmed)
    }

    #[must_use]
    pub fn confirmed_steps(&self) -> usize {
        self.plan
            .steps
            .iter()
            .filter(|s| s.status == HopStatus::Confirmed)
            .count()
    }

    /// Terminal status for a plan halted before its final hop confirmed
    #[must_use]
    pub fn halted_status(&self) -> TransferStatus {
        if self.confirmed_steps() > 0 {
            TransferStatus::PartiallyCompleted
        } else {
            TransferStatus::Failed
        }
    }
}

/// Filters for transfer history queries
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransferHistoryFilter {
    pub status: Option<TransferStatus>,
    /// Maximum number of records to return (1-100, default: 20)
    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

impl Default for TransferHistoryFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: default_limit(),
        }
    }
}

/// Ephemeral intermediary wallet (public view; key material stays in the store)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EphemeralWallet {
    pub address: String,
    pub chain: String,
    /// The single plan this wallet serves
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    /// After this instant an unused wallet is swept
    pub expires_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

/// Stored hop wallet including encrypted key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopWalletRecord {
    pub wallet: EphemeralWallet,
    /// Base64 nonce || ciphertext; `None` once discarded
    pub encrypted_key: Option<String>,
    /// Identifies the master key used for encryption
    pub key_fingerprint: String,
}

/// Chain-agnostic description of one transfer leg
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferIntent {
    pub chain: String,
    pub token: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: Decimal,
    /// `<transfer_id>:<hop_index>`
    pub reference: String,
}

/// Transaction built by the chain adapter, awaiting a signature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsignedTransaction {
    pub intent: TransferIntent,
    /// Exact bytes to sign
    pub payload: Vec<u8>,
}

/// Result of a confirmation status query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ConfirmationStatus {
    Pending,
    Confirmed,
    Rejected(String),
}

/// Direction of a historical transaction relative to the queried address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" | "in" => Ok(Self::Incoming),
            "outgoing" | "out" => Ok(Self::Outgoing),
            _ => Err(format!("Invalid direction: {}", s)),
        }
    }
}

/// Historical transaction as seen from one address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoricalTransaction {
    pub counterparty: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub chain: String,
}

impl HistoricalTransaction {
    #[must_use]
    pub fn new(
        counterparty: impl Into<String>,
        amount: Decimal,
        timestamp: DateTime<Utc>,
        direction: Direction,
        chain: impl Into<String>,
    ) -> Self {
        Self {
            counterparty: counterparty.into(),
            amount,
            timestamp,
            direction,
            chain: chain.into(),
        }
    }
}

/// Address of a labelled, publicly identifiable entity (exchange, bridge)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownEntity {
    pub address: String,
    pub label: String,
}

/// Resolved wallet identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletInfo {
    pub wallet_id: String,
    pub address: String,
    pub chain: String,
}

/// Stored per-wallet planner preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrivacyPreferences {
    pub wallet_id: String,
    pub privacy_level: PrivacyLevel,
    pub custom: CustomConfig,
}

impl PrivacyPreferences {
    /// Defaults applied when a wallet has no stored preferences
    #[must_use]
    pub fn defaults_for(wallet_id: impl Into<String>) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            privacy_level: PrivacyLevel::Enhanced,
            custom: CustomConfig {
                max_hops: Some(2),
                ..Default::default()
            },
        }
    }
}

/// Kind of contributing traceability factor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactorKind {
    KnownEntityProximity,
    AddressReuse,
    AmountCorrelation,
    TimingCorrelation,
    CrossChainLinkage,
}

impl RiskFactorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnownEntityProximity => "known_entity_proximity",
            Self::AddressReuse => "address_reuse",
            Self::AmountCorrelation => "amount_correlation",
            Self::TimingCorrelation => "timing_correlation",
            Self::CrossChainLinkage => "cross_chain_linkage",
        }
    }
}

impl std::fmt::Display for RiskFactorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One fired risk factor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactor {
    pub kind: RiskFactorKind,
    /// Sub-score contributed to the total
    pub weight: f64,
    pub evidence: String,
}

/// Coarse risk bucket
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => Self::Critical,
            60..=79 => Self::High,
            40..=59 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Traceability analysis of one address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingAnalysis {
    pub address: String,
    pub chain: String,
    pub risk_score: u8,
    pub factors: Vec<RiskFactor>,
    /// A known entity sits one hop away
    pub has_direct_link: bool,
    /// Amount or timing correlation fired
    pub suspicious_pattern: bool,
    /// Chains other than `chain` observed in the history
    pub detected_chains: Vec<String>,
    pub transactions_analyzed: usize,
    pub analyzed_at: DateTime<Utc>,
}

/// Wallet privacy report with mitigations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingRiskReport {
    pub wallet_id: String,
    pub address: String,
    pub chain: String,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub privacy_score: u8,
    pub factors: Vec<RiskFactor>,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(index: usize, from: &str, to: &str, amount: &str) -> HopStep {
        HopStep::new(
            index,
            from,
            to,
            from,
            Decimal::from_str(amount).unwrap(),
            Decimal::new(1, 1),
            0,
        )
    }

    fn sample_plan(steps: Vec<HopStep>) -> HopPlan {
        HopPlan {
            transfer_id: "tr_1".to_string(),
            chain: "solana".to_string(),
            token: "SOL".to_string(),
            privacy_level: PrivacyLevel::Enhanced,
            steps,
            total_fee: Decimal::new(2, 1),
            estimated_latency_secs: 10,
            simulated_risk_score: 20,
            privacy_score: 80,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_display_and_parsing() {
        for status in [
            TransferStatus::Planned,
            TransferStatus::InProgress,
            TransferStatus::Completed,
            TransferStatus::PartiallyCompleted,
            TransferStatus::Failed,
        ] {
            assert_eq!(TransferStatus::from_str(status.as_str()).unwrap(), status);
            assert_eq!(status.to_string(), status.as_str());
        }
        for status in [
            HopStatus::Pending,
            HopStatus::Broadcasting,
            HopStatus::Confirmed,
            HopStatus::Failed,
        ] {
            assert_eq!(HopStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(TransferStatus::from_str("cancelled").is_err());
        assert_eq!(
            PrivacyLevel::from_str("MAXIMUM").unwrap(),
            PrivacyLevel::Maximum
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::PartiallyCompleted.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Planned.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
        assert!(HopStatus::Confirmed.is_terminal());
        assert!(!HopStatus::Broadcasting.is_terminal());
    }

    #[test]
    fn test_request_validation() {
        let req = TransferRequest::new("w1", "Dest", "SOL", "solana", "1.5", PrivacyLevel::Standard);
        assert!(req.validate().is_ok());
        assert_eq!(req.parse_amount().unwrap(), Decimal::new(15, 1));

        let mut bad = req.clone();
        bad.destination_address = String::new();
        assert!(bad.validate().is_err());

        let mut bad = req.clone();
        bad.amount = "abc".to_string();
        assert!(matches!(
            bad.parse_amount(),
            Err(ValidationError::InvalidAmount(_))
        ));

        let mut bad = req.clone();
        bad.amount = "-1".to_string();
        assert!(bad.parse_amount().is_err());

        let bad = req.with_custom_config(CustomConfig {
            max_hops: Some(0),
            ..Default::default()
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_plan_invariants() {
        let plan = sample_plan(vec![
            sample_step(0, "Src", "Hop1", "99.9"),
            sample_step(1, "Hop1", "Dest", "99.8"),
        ]);
        assert!(plan.check_invariants().is_ok());
        assert_eq!(plan.hop_count(), 2);
        assert_eq!(plan.delivered_amount(), Decimal::from_str("99.8").unwrap());
        assert_eq!(plan.ephemeral_addresses(), vec!["Hop1".to_string()]);

        let broken = sample_plan(vec![
            sample_step(0, "Src", "Hop1", "99.9"),
            sample_step(1, "Other", "Dest", "99.8"),
        ]);
        assert!(broken.check_invariants().is_err());

        let increasing = sample_plan(vec![
            sample_step(0, "Src", "Hop1", "99.8"),
            sample_step(1, "Hop1", "Dest", "99.9"),
        ]);
        assert!(increasing.check_invariants().is_err());
    }

    #[test]
    fn test_direct_plan_has_no_hops() {
        let plan = sample_plan(vec![sample_step(0, "Src", "Dest", "100")]);
        assert_eq!(plan.hop_count(), 0);
        assert!(plan.ephemeral_addresses().is_empty());
    }

    #[test]
    fn test_halted_status() {
        let plan = sample_plan(vec![
            sample_step(0, "Src", "Hop1", "99.9"),
            sample_step(1, "Hop1", "Dest", "99.8"),
        ]);
        let req = TransferRequest::new("w1", "Dest", "SOL", "solana", "100", PrivacyLevel::Enhanced);
        let mut record = TransferRecord::new(req, "Src".into(), Decimal::from(100), plan);
        assert_eq!(record.halted_status(), TransferStatus::Failed);
        assert_eq!(record.next_step_index(), Some(0));

        record.plan.steps[0].status = HopStatus::Confirmed;
        assert_eq!(record.halted_status(), TransferStatus::PartiallyCompleted);
        assert_eq!(record.next_step_index(), Some(1));
    }

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(39), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(60), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::Critical);
    }

    #[test]
    fn test_amount_serializes_as_string() {
        let step = sample_step(0, "Src", "Dest", "99.9");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["amount"], serde_json::json!("99.9"));
    }
}
