//! Traceability Risk Model
//!
//! Pure scoring of an address's linkability from a bounded transaction graph.
//! Each factor is an independent weighted sub-score; the total is clamped to
//! `[0, 100]`. Given the same graph and weights the output is identical.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::domain::{Direction, HistoricalTransaction, RiskFactor, RiskFactorKind};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Weights and thresholds of the risk factors
#[derive(Debug, Clone, PartialEq)]
pub struct RiskWeights {
    /// Score added for a known entity at distance 1; divided by the distance
    pub entity_weight: f64,
    /// Maximum graph distance searched for known entities
    pub max_entity_depth: usize,
    /// Distinct counterparties tolerated before reuse is penalized
    pub reuse_threshold: usize,
    pub reuse_weight_per_excess: f64,
    pub reuse_cap: f64,
    /// Relative tolerance for matching an outgoing amount to an incoming one
    pub amount_epsilon: Decimal,
    pub amount_correlation_penalty: f64,
    /// Incoming-to-outgoing gaps below this many seconds are correlated
    pub min_separation_secs: i64,
    pub timing_weight: f64,
    pub timing_cap: f64,
    pub cross_chain_penalty: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            entity_weight: 40.0,
            max_entity_depth: 3,
            reuse_threshold: 10,
            reuse_weight_per_excess: 2.0,
            reuse_cap: 25.0,
            amount_epsilon: Decimal::new(5, 3), // 0.5%
            amount_correlation_penalty: 20.0,
            min_separation_secs: 60,
            timing_weight: 10.0,
            timing_cap: 20.0,
            cross_chain_penalty: 15.0,
        }
    }
}

impl RiskWeights {
    /// Load weights from `RISK_*` environment variables, falling back to defaults
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
            entity_weight: parsed("RISK_ENTITY_WEIGHT", defaults.entity_weight),
            max_entity_depth: parsed("RISK_MAX_ENTITY_DEPTH", defaults.max_entity_depth),
            reuse_threshold: parsed("RISK_REUSE_THRESHOLD", defaults.reuse_threshold),
            reuse_weight_per_excess: parsed(
                "RISK_REUSE_WEIGHT_PER_EXCESS",
                defaults.reuse_weight_per_excess,
            ),
            reuse_cap: parsed("RISK_REUSE_CAP", defaults.reuse_cap),
            amount_epsilon: parsed("RISK_AMOUNT_EPSILON", defaults.amount_epsilon),
            amount_correlation_penalty: parsed(
                "RISK_AMOUNT_CORRELATION_PENALTY",
                defaults.amount_correlation_penalty,
            ),
            min_separation_secs: parsed("RISK_MIN_SEPARATION_SECS", defaults.min_separation_secs),
            timing_weight: parsed("RISK_TIMING_WEIGHT", defaults.timing_weight),
            timing_cap: parsed("RISK_TIMING_CAP", defaults.timing_cap),
            cross_chain_penalty: parsed("RISK_CROSS_CHAIN_PENALTY", defaults.cross_chain_penalty),
        }
    }
}

// ============================================================================
// INPUTS
// ============================================================================

/// Bounded transaction graph rooted at one address
#[derive(Debug, Clone, Default)]
pub struct TransactionGraph {
    root: String,
    chain: String,
    adjacency: BTreeMap<String, Vec<HistoricalTransaction>>,
    /// Root activity on other chains
    linked: Vec<HistoricalTransaction>,
}

impl TransactionGraph {
    #[must_use]
    pub fn new(root: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            chain: chain.into(),
            adjacency: BTreeMap::new(),
            linked: Vec::new(),
        }
    }

    /// Record the (possibly truncated) history of one address.
    ///
    /// Transactions on other chains never enter the adjacency; those of the
    /// root only feed cross-chain linkage.
    pub fn insert(&mut self, address: impl Into<String>, history: Vec<HistoricalTransaction>) {
        let address = address.into();
        let (local, foreign): (Vec<_>, Vec<_>) = history
            .into_iter()
            .partition(|t| t.chain.eq_ignore_ascii_case(&self.chain));
        if address == self.root {
            self.linked.extend(foreign);
        }
        self.adjacency.entry(address).or_default().extend(local);
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        self.adjacency.contains_key(address)
    }

    /// History of the root in a canonical order
    #[must_use]
    pub fn root_history(&self) -> Vec<&HistoricalTransaction> {
        let mut history: Vec<&HistoricalTransaction> = self
            .adjacency
            .get(&self.root)
            .map(|txs| txs.iter().collect())
            .unwrap_or_default();
        history.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.direction.cmp(&b.direction))
                .then(a.counterparty.cmp(&b.counterparty))
                .then(a.amount.cmp(&b.amount))
        });
        history
    }

    /// Sorted distinct counterparties of an address
    #[must_use]
    pub fn neighbors(&self, address: &str) -> BTreeSet<&str> {
        self.adjacency
            .get(address)
            .map(|txs| txs.iter().map(|t| t.counterparty.as_str()).collect())
            .unwrap_or_default()
    }

    /// Other chains the root was active on, sorted
    #[must_use]
    pub fn foreign_chains(&self) -> Vec<String> {
        let chains: BTreeSet<String> = self
            .linked
            .iter()
            .map(|t| t.chain.to_ascii_lowercase())
            .collect();
        chains.into_iter().collect()
    }
}

/// Known entity addresses (exchange deposits, bridges) with labels
#[derive(Debug, Clone, Default)]
pub struct KnownEntities {
    labels: BTreeMap<String, String>,
}

impl KnownEntities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, address: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.insert(address.into(), label.into());
        self
    }

    pub fn insert(&mut self, address: impl Into<String>, label: impl Into<String>) {
        self.labels.insert(address.into(), label.into());
    }

    #[must_use]
    pub fn label(&self, address: &str) -> Option<&str> {
        self.labels.get(address).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A hop path that has been planned but not executed
#[derive(Debug, Clone)]
pub struct SimulatedPath {
    /// Number of on-chain legs
    pub legs: usize,
    pub original_amount: Decimal,
    pub delivered_amount: Decimal,
    /// Jitter before each leg, the first one included
    pub delays_secs: Vec<u64>,
}

/// Score and the factors that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub score: u8,
    pub factors: Vec<RiskFactor>,
}

impl RiskAssessment {
    #[must_use]
    pub fn has(&self, kind: RiskFactorKind) -> bool {
        self.factors.iter().any(|f| f.kind == kind)
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Stateless scorer over transaction graphs and simulated paths
#[derive(Debug, Clone, Default)]
pub struct RiskModel {
    weights: RiskWeights,
}

impl RiskModel {
    #[must_use]
    pub fn new(weights: RiskWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// Score the root of `graph` against `entities`
    #[must_use]
    pub fn assess(&self, graph: &TransactionGraph, entities: &KnownEntities) -> RiskAssessment {
        let history = graph.root_history();
        if history.is_empty() {
            return RiskAssessment {
                score: 0,
                factors: Vec::new(),
            };
        }

        let mut factors = Vec::new();
        factors.extend(self.entity_proximity(graph, entities));
        factors.extend(self.address_reuse(&history));
        factors.extend(self.amount_correlation(&history));
        factors.extend(self.timing_correlation(&history));
        factors.extend(self.cross_chain_linkage(graph));

        Self::finish(factors)
    }

    /// Score a planned path with the source treated as the known entity
    #[must_use]
    pub fn score_path(&self, path: &SimulatedPath) -> RiskAssessment {
        let mut factors = Vec::new();
        let w = &self.weights;

        if path.legs > 0 && path.legs <= w.max_entity_depth {
            factors.push(RiskFactor {
                kind: RiskFactorKind::KnownEntityProximity,
                weight: w.entity_weight / path.legs as f64,
                evidence: format!("source is {} leg(s) from the destination", path.legs),
            });
        }

        if self.amounts_match(path.original_amount, path.delivered_amount) {
            factors.push(RiskFactor {
                kind: RiskFactorKind::AmountCorrelation,
                weight: w.amount_correlation_penalty,
                evidence: format!(
                    "delivered {} is within {} of sent {}",
                    path.delivered_amount, w.amount_epsilon, path.original_amount
                ),
            });
        }

        let mut timing = 0.0;
        let mut correlated = 0usize;
        for delay in path.delays_secs.iter().skip(1) {
            let gap = i64::try_from(*delay).unwrap_or(i64::MAX);
            if let Some(contribution) = self.timing_contribution(gap) {
                timing += contribution;
                correlated += 1;
            }
        }
        if correlated > 0 {
            factors.push(RiskFactor {
                kind: RiskFactorKind::TimingCorrelation,
                weight: timing.min(w.timing_cap),
                evidence: format!(
                    "{} leg(s) forwarded within {}s",
                    correlated, w.min_separation_secs
                ),
            });
        }

        Self::finish(factors)
    }

    fn finish(mut factors: Vec<RiskFactor>) -> RiskAssessment {
        factors.sort_by(|a, b| a.kind.cmp(&b.kind));
        let total: f64 = factors.iter().map(|f| f.weight).sum();
        RiskAssessment {
            score: total.round().clamp(0.0, 100.0) as u8,
            factors,
        }
    }

    fn entity_proximity(
        &self,
        graph: &TransactionGraph,
        entities: &KnownEntities,
    ) -> Option<RiskFactor> {
        if entities.is_empty() {
            return None;
        }
        let max_depth = self.weights.max_entity_depth;
        let mut visited: HashSet<&str> = HashSet::from([graph.root()]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(graph.root(), 0)]);

        while let Some((address, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in graph.neighbors(address) {
                if !visited.insert(next) {
                    continue;
                }
                let distance = depth + 1;
                if let Some(label) = entities.label(next) {
                    return Some(RiskFactor {
                        kind: RiskFactorKind::KnownEntityProximity,
                        weight: self.weights.entity_weight / distance as f64,
                        evidence: format!("{} ({}) at distance {}", next, label, distance),
                    });
                }
                queue.push_back((next, distance));
            }
        }
        None
    }

    fn address_reuse(&self, history: &[&HistoricalTransaction]) -> Option<RiskFactor> {
        let distinct: BTreeSet<&str> = history.iter().map(|t| t.counterparty.as_str()).collect();
        let excess = distinct.len().checked_sub(self.weights.reuse_threshold)?;
        if excess == 0 {
            return None;
        }
        Some(RiskFactor {
            kind: RiskFactorKind::AddressReuse,
            weight: (excess as f64 * self.weights.reuse_weight_per_excess)
                .min(self.weights.reuse_cap),
            evidence: format!(
                "{} distinct counterparties, {} above threshold",
                distinct.len(),
                excess
            ),
        })
    }

    fn amounts_match(&self, incoming: Decimal, outgoing: Decimal) -> bool {
        if incoming <= Decimal::ZERO || outgoing > incoming {
            return false;
        }
        incoming - outgoing <= incoming * self.weights.amount_epsilon
    }

    fn amount_correlation(&self, history: &[&HistoricalTransaction]) -> Option<RiskFactor> {
        let mut matches = 0usize;
        let mut first_match: Option<(&HistoricalTransaction, &HistoricalTransaction)> = None;

        for (i, out) in history.iter().enumerate() {
            if out.direction != Direction::Outgoing {
                continue;
            }
            let matched = history[..i].iter().find(|inc| {
                inc.direction == Direction::Incoming && self.amounts_match(inc.amount, out.amount)
            });
            if let Some(inc) = matched {
                matches += 1;
                first_match.get_or_insert((*inc, *out));
            }
        }

        let (inc, out) = first_match?;
        Some(RiskFactor {
            kind: RiskFactorKind::AmountCorrelation,
            weight: self.weights.amount_correlation_penalty,
            evidence: format!(
                "{} outgoing transfer(s) mirror incoming amounts (e.g. {} from {} then {} to {})",
                matches, inc.amount, inc.counterparty, out.amount, out.counterparty
            ),
        })
    }

    fn timing_contribution(&self, gap_secs: i64) -> Option<f64> {
        let min_sep = self.weights.min_separation_secs;
        if min_sep <= 0 || gap_secs < 0 || gap_secs >= min_sep {
            return None;
        }
        Some(self.weights.timing_weight * (min_sep - gap_secs) as f64 / min_sep as f64)
    }

    fn timing_correlation(&self, history: &[&HistoricalTransaction]) -> Option<RiskFactor> {
        let mut total = 0.0;
        let mut pairs = 0usize;
        let mut tightest: Option<i64> = None;

        for (i, inc) in history.iter().enumerate() {
            if inc.direction != Direction::Incoming {
                continue;
            }
            let Some(out) = history[i + 1..]
                .iter()
                .find(|t| t.direction == Direction::Outgoing)
            else {
                continue;
            };
            let gap = (out.timestamp - inc.timestamp).num_seconds();
            if let Some(contribution) = self.timing_contribution(gap) {
                total += contribution;
                pairs += 1;
                tightest = Some(tightest.map_or(gap, |t| t.min(gap)));
            }
        }

        let tightest = tightest?;
        Some(RiskFactor {
            kind: RiskFactorKind::TimingCorrelation,
            weight: total.min(self.weights.timing_cap),
            evidence: format!(
                "{} incoming/outgoing pair(s) within {}s (tightest {}s)",
                pairs, self.weights.min_separation_secs, tightest
            ),
        })
    }

    fn cross_chain_linkage(&self, graph: &TransactionGraph) -> Option<RiskFactor> {
        let chains = graph.foreign_chains();
        if chains.is_empty() {
            return None;
        }
        Some(RiskFactor {
            kind: RiskFactorKind::CrossChainLinkage,
            weight: self.weights.cross_chain_penalty,
            evidence: format!("activity also seen on {}", chains.join(", ")),
        })
    }
}
