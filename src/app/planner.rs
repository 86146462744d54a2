//! Path Planner
//!
//! Turns a transfer request into an ordered hop plan. Planning allocates the
//! intermediary wallets and simulates the resulting path against the Risk
//! Model, but never touches the chain.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use super::risk_model::{RiskModel, SimulatedPath};
use super::wallet_pool::HopWalletPool;
use crate::domain::{
    AppError, CustomConfig, HopPlan, HopStep, PlanningError, PrivacyLevel, TransferRequest,
    ValidationError,
};

/// Fee charged when a chain has no schedule entry
pub const FALLBACK_FEE: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Inclusive jitter range in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_secs: u64,
    pub max_secs: u64,
}

impl DelayRange {
    #[must_use]
    pub const fn new(min_secs: u64, max_secs: u64) -> Self {
        Self { min_secs, max_secs }
    }
}

/// Planner policy
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Per-leg fee by lowercase chain identifier
    pub fee_schedule: HashMap<String, Decimal>,
    pub fallback_fee: Decimal,
    pub enhanced_delay: DelayRange,
    pub maximum_delay: DelayRange,
    pub maximum_min_legs: usize,
    pub maximum_max_legs: usize,
    /// Maximum plans grow until the simulated risk falls below this
    pub target_risk_ceiling: u8,
    /// Fixed seed for reproducible jitter
    pub rng_seed: Option<u64>,
}

fn default_fee_schedule() -> HashMap<String, Decimal> {
    HashMap::from([
        ("solana".to_string(), Decimal::new(5, 6)),
        ("ethereum".to_string(), Decimal::new(1, 4)),
        ("bsc".to_string(), Decimal::new(1, 5)),
    ])
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            fee_schedule: default_fee_schedule(),
            fallback_fee: FALLBACK_FEE,
            enhanced_delay: DelayRange::new(5, 60),
            maximum_delay: DelayRange::new(30, 120),
            maximum_min_legs: 3,
            maximum_max_legs: 5,
            target_risk_ceiling: 30,
            rng_seed: None,
        }
    }
}

impl PlannerConfig {
    /// Load configuration from `PLANNER_*` environment variables
    pub fn from_env() -> Self {
        use std::env;

        fn parsed<T: FromStr>(key: &str, default: T) -> T {
            env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        let mut fee_schedule = defaults.fee_schedule.clone();
        for chain in ["solana", "ethereum", "bsc"] {
            let key = format!("PLANNER_FEE_{}", chain.to_ascii_uppercase());
            if let Some(fee) = env::var(&key).ok().and_then(|v| Decimal::from_str(&v).ok()) {
                fee_schedule.insert(chain.to_string(), fee);
            }
        }

        Self {
            fee_schedule,
            fallback_fee: parsed("PLANNER_FALLBACK_FEE", defaults.fallback_fee),
            enhanced_delay: DelayRange::new(
                parsed(
                    "PLANNER_ENHANCED_DELAY_MIN_SECS",
                    defaults.enhanced_delay.min_secs,
                ),
                parsed(
                    "PLANNER_ENHANCED_DELAY_MAX_SECS",
                    defaults.enhanced_delay.max_secs,
                ),
            ),
            maximum_delay: DelayRange::new(
                parsed(
                    "PLANNER_MAXIMUM_DELAY_MIN_SECS",
                    defaults.maximum_delay.min_secs,
                ),
                parsed(
                    "PLANNER_MAXIMUM_DELAY_MAX_SECS",
                    defaults.maximum_delay.max_secs,
                ),
            ),
            maximum_min_legs: defaults.maximum_min_legs,
            maximum_max_legs: defaults.maximum_max_legs,
            target_risk_ceiling: parsed("PLANNER_TARGET_RISK_CEILING", defaults.target_risk_ceiling),
            rng_seed: env::var("PLANNER_RNG_SEED").ok().and_then(|v| v.parse().ok()),
        }
    }

    #[must_use]
    pub fn with_fee(mut self, chain: &str, fee: Decimal) -> Self {
        self.fee_schedule.insert(chain.to_ascii_lowercase(), fee);
        self
    }

    #[must_use]
    pub fn fee_for(&self, chain: &str) -> Decimal {
        self.fee_schedule
            .get(&chain.to_ascii_lowercase())
            .copied()
            .unwrap_or(self.fallback_fee)
    }
}

// ============================================================================
// PLANNER
// ============================================================================

/// Leg count and jitter chosen for a plan, before wallets are allocated
struct Shape {
    legs: usize,
    delays: Vec<u64>,
}

/// Produces hop plans using the wallet pool and the risk model
pub struct PathPlanner {
    pool: Arc<HopWalletPool>,
    risk_model: RiskModel,
    config: PlannerConfig,
    rng: Mutex<StdRng>,
}

impl PathPlanner {
    pub fn new(pool: Arc<HopWalletPool>, risk_model: RiskModel, config: PlannerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            pool,
            risk_model,
            config,
            rng: Mutex::new(rng),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a transfer from `source_address` to the request's destination.
    ///
    /// The request's privacy level must already be resolved; a missing level
    /// plans as the default. Wallets allocated before a failure are retired.
    #[instrument(
        skip(self, request),
        fields(transfer_id = %transfer_id, chain = %request.chain, level = tracing::field::Empty)
    )]
    pub async fn plan(
        &self,
        transfer_id: &str,
        request: &TransferRequest,
        source_address: &str,
    ) -> Result<HopPlan, AppError> {
        let level = request.privacy_level.unwrap_or_default();
        tracing::Span::current().record("level", level.as_str());

        let chain = request.chain_key();
        let custom = request.custom_config.clone().unwrap_or_default();
        let amount = request.parse_amount()?;

        if request.destination_address == source_address {
            return Err(ValidationError::InvalidField {
                field: "destination_address".to_string(),
                message: "destination must differ from the source wallet".to_string(),
            }
            .into());
        }
        if !self.pool.supports_chain(&chain) {
            return Err(PlanningError::UnsupportedChain(request.chain.clone()).into());
        }

        let fee = self.config.fee_for(&chain);
        let shape = self.choose_shape(level, &custom, amount, fee)?;

        let mut intermediaries = Vec::with_capacity(shape.legs.saturating_sub(1));
        for _ in 1..shape.legs {
            match self.pool.allocate(&chain, transfer_id).await {
                Ok(wallet) => intermediaries.push(wallet.address),
                Err(e) => {
                    warn!(error = %e, "Wallet allocation failed, retiring partial plan");
                    if let Err(retire_err) = self.pool.retire_plan(transfer_id).await {
                        warn!(error = %retire_err, "Failed to retire wallets of abandoned plan");
                    }
                    return Err(e);
                }
            }
        }

        let plan = self.build_plan(
            transfer_id,
            request,
            source_address,
            &chain,
            level,
            amount,
            fee,
            &intermediaries,
            &shape.delays,
        );

        if let Err(reason) = plan.check_invariants() {
            if let Err(retire_err) = self.pool.retire_plan(transfer_id).await {
                warn!(error = %retire_err, "Failed to retire wallets of abandoned plan");
            }
            return Err(AppError::Internal(format!("planner produced invalid plan: {}", reason)));
        }

        info!(
            legs = plan.steps.len(),
            total_fee = %plan.total_fee,
            latency_secs = plan.estimated_latency_secs,
            simulated_risk = plan.simulated_risk_score,
            "Hop plan created"
        );
        Ok(plan)
    }

    fn choose_shape(
        &self,
        level: PrivacyLevel,
        custom: &CustomConfig,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<Shape, AppError> {
        if let Some(max_hops) = custom.max_hops
            && max_hops < 2
            && level != PrivacyLevel::Standard
        {
            return Err(ValidationError::InvalidField {
                field: "custom_config.max_hops".to_string(),
                message: format!("{} transfers need at least 2 hops", level),
            }
            .into());
        }

        match level {
            PrivacyLevel::Standard => {
                if let Some(budget) = custom.max_fee_budget
                    && fee > budget
                {
                    return Err(PlanningError::FeeBudgetExceeded {
                        required: fee.to_string(),
                        budget: budget.to_string(),
                    }
                    .into());
                }
                Ok(Shape {
                    legs: 1,
                    delays: vec![0],
                })
            }
            PrivacyLevel::Enhanced => {
                let legs = 2;
                self.check_fee_budget(custom, fee, legs)?;
                Self::check_amount(amount, fee, legs)?;
                let delays = self.draw_delays(legs, self.config.enhanced_delay, custom)?;
                Ok(Shape { legs, delays })
            }
            PrivacyLevel::Maximum => self.choose_maximum(custom, amount, fee),
        }
    }

    fn choose_maximum(
        &self,
        custom: &CustomConfig,
        amount: Decimal,
        fee: Decimal,
    ) -> Result<Shape, AppError> {
        let cap = custom.max_hops.unwrap_or(self.config.maximum_max_legs);
        let lower = self.config.maximum_min_legs.min(cap);
        let mut upper = self.config.maximum_max_legs.min(cap);

        if let Some(budget) = custom.max_fee_budget {
            while upper > lower && fee * Decimal::from(upper) > budget {
                upper -= 1;
            }
        }
        self.check_fee_budget(custom, fee, lower)?;
        Self::check_amount(amount, fee, lower)?;

        let mut chosen: Option<Shape> = None;
        for legs in lower..=upper {
            if Self::check_amount(amount, fee, legs).is_err() {
                break;
            }
            let delays = self.draw_delays(legs, self.config.maximum_delay, custom)?;
            let simulated = self.risk_model.score_path(&SimulatedPath {
                legs,
                original_amount: amount,
                delivered_amount: amount - fee * Decimal::from(legs),
                delays_secs: delays.clone(),
            });
            debug!(legs, score = simulated.score, "Simulated maximum-privacy path");
            let below_ceiling = simulated.score < self.config.target_risk_ceiling;
            chosen = Some(Shape { legs, delays });
            if below_ceiling {
                break;
            }
        }

        chosen.ok_or_else(|| {
            PlanningError::InsufficientAmount {
                amount: amount.to_string(),
                hops: lower,
                fee_per_hop: fee.to_string(),
            }
            .into()
        })
    }

    fn check_fee_budget(
        &self,
        custom: &CustomConfig,
        fee: Decimal,
        legs: usize,
    ) -> Result<(), AppError> {
        let required = fee * Decimal::from(legs);
        match custom.max_fee_budget {
            Some(budget) if required > budget => Err(PlanningError::FeeBudgetExceeded {
                required: required.to_string(),
                budget: budget.to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    fn check_amount(amount: Decimal, fee: Decimal, legs: usize) -> Result<(), AppError> {
        if amount - fee * Decimal::from(legs) > Decimal::ZERO {
            Ok(())
        } else {
            Err(PlanningError::InsufficientAmount {
                amount: amount.to_string(),
                hops: legs,
                fee_per_hop: fee.to_string(),
            }
            .into())
        }
    }

    /// Jitter for each leg; the first leg leaves immediately
    fn draw_delays(
        &self,
        legs: usize,
        range: DelayRange,
        custom: &CustomConfig,
    ) -> Result<Vec<u64>, AppError> {
        let delayed = legs.saturating_sub(1);
        let floor = custom.min_hop_delay_secs.unwrap_or(0).max(1);
        let mut lo = range.min_secs.max(floor);
        let mut hi = range.max_secs.max(lo);

        if let Some(budget) = custom.max_total_latency_secs
            && delayed > 0
        {
            let per_hop = budget / delayed as u64;
            if per_hop < floor {
                return Err(PlanningError::LatencyBudgetExceeded {
                    hops: delayed,
                    budget_secs: budget,
                }
                .into());
            }
            hi = hi.min(per_hop);
            lo = lo.min(hi);
        }

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut delays = Vec::with_capacity(legs);
        delays.push(0);
        for _ in 0..delayed {
            delays.push(rng.gen_range(lo..=hi));
        }
        Ok(delays)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_plan(
        &self,
        transfer_id: &str,
        request: &TransferRequest,
        source_address: &str,
        chain: &str,
        level: PrivacyLevel,
        amount: Decimal,
        fee: Decimal,
        intermediaries: &[String],
        delays: &[u64],
    ) -> HopPlan {
        let mut path = Vec::with_capacity(intermediaries.len() + 2);
        path.push(source_address.to_string());
        path.extend(intermediaries.iter().cloned());
        path.push(request.destination_address.clone());

        let legs = path.len() - 1;
        let steps: Vec<HopStep> = (0..legs)
            .map(|i| {
                let leg_amount = if level == PrivacyLevel::Standard {
                    amount
                } else {
                    amount - fee * Decimal::from(i + 1)
                };
                let signer_ref = if i == 0 {
                    request.source_wallet_id.clone()
                } else {
                    path[i].clone()
                };
                HopStep::new(
                    i,
                    path[i].clone(),
                    path[i + 1].clone(),
                    signer_ref,
                    leg_amount,
                    fee,
                    delays.get(i).copied().unwrap_or(0),
                )
            })
            .collect();

        let total_fee = fee * Decimal::from(legs);
        let estimated_latency_secs = delays.iter().sum();
        let delivered = steps.last().map(|s| s.amount).unwrap_or(amount);
        let simulated = self.risk_model.score_path(&SimulatedPath {
            legs,
            original_amount: amount,
            delivered_amount: delivered,
            delays_secs: delays.to_vec(),
        });

        HopPlan {
            transfer_id: transfer_id.to_string(),
            chain: chain.to_string(),
            token: request.token.clone(),
            privacy_level: level,
            steps,
            total_fee,
            estimated_latency_secs,
            simulated_risk_score: simulated.score,
            privacy_score: 100 - simulated.score.min(100),
            created_at: Utc::now(),
        }
    }
}
