//! Tracking analyzer and privacy report generator.
//!
//! Read-only path: walks the indexed transaction history around an address,
//! scores it with the Risk Model and turns the fired factors into advice.
//! Analyses are cached in memory for a short TTL.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::risk_model::{KnownEntities, RiskModel, TransactionGraph};
use crate::domain::{
    AppError, DatabaseError, RiskFactorKind, RiskLevel, TrackingAnalysis,
    TrackingRiskReport, TransactionHistoryStore, WalletStore,
};

/// Default cache TTL: 60 seconds
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Default bound on cached analyses
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 1_024;

/// Configuration for the tracking analyzer
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Neighbours expanded per address during the walk
    pub max_fanout: usize,
    /// Hard bound on addresses fetched per analysis
    pub max_nodes: usize,
    pub cache_ttl: Duration,
    /// Oldest analyses are evicted beyond this many; 0 disables caching
    pub cache_max_entries: usize,
    /// Chains checked for activity of the same address
    pub linked_chains: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_fanout: 25,
            max_nodes: 500,
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            linked_chains: vec![
                "solana".to_string(),
                "ethereum".to_string(),
                "bsc".to_string(),
            ],
        }
    }
}

impl AnalyzerConfig {
    /// Load configuration from `ANALYZER_*` environment variables
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let max_fanout = env::var("ANALYZER_MAX_FANOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_fanout);
        let max_nodes = env::var("ANALYZER_MAX_NODES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_nodes);
        let cache_ttl = env::var("ANALYZER_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cache_ttl);
        let cache_max_entries = env::var("ANALYZER_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.cache_max_entries);
        let linked_chains = env::var("ANALYZER_LINKED_CHAINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or(defaults.linked_chains);

        Self {
            max_fanout,
            max_nodes,
            cache_ttl,
            cache_max_entries,
            linked_chains,
        }
    }
}

/// Service producing tracking analyses and privacy reports
pub struct TrackingAnalyzer {
    history: Arc<dyn TransactionHistoryStore>,
    wallets: Arc<dyn WalletStore>,
    model: RiskModel,
    entities: KnownEntities,
    config: AnalyzerConfig,
    cache: DashMap<(String, String), (Instant, TrackingAnalysis)>,
}

impl TrackingAnalyzer {
    pub fn new(
        history: Arc<dyn TransactionHistoryStore>,
        wallets: Arc<dyn WalletStore>,
        model: RiskModel,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            history,
            wallets,
            model,
            entities: KnownEntities::new(),
            config,
            cache: DashMap::new(),
        }
    }

    /// Add statically configured entities to those read from the store
    #[must_use]
    pub fn with_entities(mut self, entities: KnownEntities) -> Self {
        self.entities = entities;
        self
    }

    /// Analyze the traceability of `address` on `chain`.
    ///
    /// Returns a cached analysis when one younger than the TTL exists.
    #[instrument(skip(self), fields(address = %address, chain = %chain))]
    pub async fn analyze_wallet_tracking(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<TrackingAnalysis, AppError> {
        let chain = chain.trim().to_ascii_lowercase();
        let key = (address.to_string(), chain.clone());

        if let Some(entry) = self.cache.get(&key) {
            let (stored_at, analysis) = entry.value();
            if stored_at.elapsed() < self.config.cache_ttl {
                debug!("Returning cached tracking analysis");
                return Ok(analysis.clone());
            }
            drop(entry);
            self.cache.remove(&key);
        }

        let graph = self.build_graph(address, &chain).await?;
        let entities = self.load_entities().await;
        let assessment = self.model.assess(&graph, &entities);

        let transactions_analyzed = graph.root_history().len();
        let analysis = TrackingAnalysis {
            address: address.to_string(),
            chain: chain.clone(),
            risk_score: assessment.score,
            has_direct_link: self.has_direct_link(&graph, &entities),
            suspicious_pattern: assessment.has(RiskFactorKind::AmountCorrelation)
                || assessment.has(RiskFactorKind::TimingCorrelation),
            detected_chains: graph.foreign_chains(),
            factors: assessment.factors,
            transactions_analyzed,
            analyzed_at: Utc::now(),
        };

        info!(
            risk_score = analysis.risk_score,
            factors = analysis.factors.len(),
            transactions = transactions_analyzed,
            "Tracking analysis complete"
        );
        self.store_in_cache(key, &analysis);
        Ok(analysis)
    }

    /// Build the privacy report of a registered wallet
    #[instrument(skip(self))]
    pub async fn generate_wallet_privacy_report(
        &self,
        wallet_id: &str,
    ) -> Result<TrackingRiskReport, AppError> {
        let wallet = self
            .wallets
            .resolve_wallet(wallet_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("wallet {}", wallet_id)))?;

        let analysis = self
            .analyze_wallet_tracking(&wallet.address, &wallet.chain)
            .await?;
        let recommendations = recommendations_for(&analysis);

        Ok(TrackingRiskReport {
            wallet_id: wallet.wallet_id,
            address: wallet.address,
            chain: analysis.chain,
            risk_score: analysis.risk_score,
            risk_level: RiskLevel::from_score(analysis.risk_score),
            privacy_score: 100 - analysis.risk_score.min(100),
            factors: analysis.factors,
            recommendations,
            generated_at: Utc::now(),
        })
    }

    /// Drop every cached analysis
    pub fn invalidate_cache(&self) {
        self.cache.clear();
    }

    /// Number of analyses currently cached
    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Remove expired analyses; returns how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<(String, String)> = self
            .cache
            .iter()
            .filter(|e| e.value().0.elapsed() >= self.config.cache_ttl)
            .map(|e| e.key().clone())
            .collect();
        let removed = expired
            .iter()
            .filter(|key| self.cache.remove(*key).is_some())
            .count();
        if removed > 0 {
            debug!(removed, "Cleaned up expired analyses");
        }
        removed
    }

    fn store_in_cache(&self, key: (String, String), analysis: &TrackingAnalysis) {
        let capacity = self.config.cache_max_entries;
        if capacity == 0 {
            return;
        }
        if self.cache.len() >= capacity && !self.cache.contains_key(&key) {
            self.cleanup_expired();
        }
        if self.cache.len() >= capacity && !self.cache.contains_key(&key) {
            let mut entries: Vec<((String, String), Instant)> = self
                .cache
                .iter()
                .map(|e| (e.key().clone(), e.value().0))
                .collect();
            entries.sort_by_key(|(_, stored_at)| *stored_at);
            let excess = self.cache.len() + 1 - capacity;
            for (old, _) in entries.into_iter().take(excess) {
                self.cache.remove(&old);
            }
            debug!(evicted = excess, "Evicted oldest analyses");
        }
        self.cache.insert(key, (Instant::now(), analysis.clone()));
    }

    async fn load_entities(&self) -> KnownEntities {
        let mut entities = self.entities.clone();
        match self.history.get_known_entities().await {
            Ok(stored) => {
                for entity in stored {
                    entities.insert(entity.address, entity.label);
                }
            }
            Err(e) => warn!(error = %e, "Failed to load known entities, using static set"),
        }
        entities
    }

    fn has_direct_link(&self, graph: &TransactionGraph, entities: &KnownEntities) -> bool {
        graph
            .neighbors(graph.root())
            .into_iter()
            .any(|n| entities.label(n).is_some())
    }

    /// Bounded breadth-first walk of the history store
    async fn build_graph(&self, root: &str, chain: &str) -> Result<TransactionGraph, AppError> {
        let max_depth = self.model.weights().max_entity_depth;
        let mut graph = TransactionGraph::new(root, chain);
        let mut seen: BTreeSet<String> = BTreeSet::from([root.to_string()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(root.to_string(), 0)]);
        let mut fetched = 0usize;

        while let Some((address, depth)) = queue.pop_front() {
            if depth >= max_depth || fetched >= self.config.max_nodes {
                continue;
            }
            let mut history = self
                .history
                .get_transactions_for_address(&address, chain)
                .await?;
            fetched += 1;
            history.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.counterparty.cmp(&b.counterparty))
            });

            let mut expanded = BTreeSet::new();
            for tx in &history {
                if expanded.len() >= self.config.max_fanout {
                    break;
                }
                if expanded.insert(tx.counterparty.clone()) && seen.insert(tx.counterparty.clone())
                {
                    queue.push_back((tx.counterparty.clone(), depth + 1));
                }
            }

            if depth > 0 {
                history.retain(|tx| expanded.contains(&tx.counterparty));
            }
            graph.insert(address, history);
        }

        for other in self.config.linked_chains.iter().filter(|c| *c != chain) {
            match self.history.get_transactions_for_address(root, other).await {
                Ok(foreign) if !foreign.is_empty() => {
                    debug!(chain = %other, count = foreign.len(), "Cross-chain activity found");
                    graph.insert(root, foreign);
                }
                Ok(_) => {}
                Err(e) => warn!(chain = %other, error = %e, "Cross-chain lookup failed"),
            }
        }

        Ok(graph)
    }
}

fn advice_for(kind: RiskFactorKind) -> &'static str {
    match kind {
        RiskFactorKind::KnownEntityProximity => {
            "Route transfers through at least 3 hops before reaching exchanges or other known entities"
        }
        RiskFactorKind::AddressReuse => "Use fresh receiving addresses instead of reusing this wallet",
        RiskFactorKind::AmountCorrelation => {
            "Avoid forwarding the exact amount received; vary amounts between transfers"
        }
        RiskFactorKind::TimingCorrelation => {
            "Enable randomized delays so funds are not forwarded right after arrival"
        }
        RiskFactorKind::CrossChainLinkage => {
            "Use independent wallets on each chain to avoid cross-chain linkage"
        }
    }
}

const HIGH_RISK_ADVICE: &[&str] = &[
    "Use the maximum privacy level (3-5 hops) for outgoing transfers",
    "Rotate intermediary wallets instead of keeping long-lived addresses",
];

const BASELINE_ADVICE: &[&str] = &[
    "Privacy risk is low; keep using fresh addresses and delayed transfers",
    "Re-run the privacy assessment periodically",
];

/// Map fired factors to mitigations; baseline advice when nothing fired
#[must_use]
pub fn recommendations_for(analysis: &TrackingAnalysis) -> Vec<String> {
    let mut advice: Vec<&str> = Vec::new();
    let fired = analysis.factors.iter().map(|f| advice_for(f.kind));
    let high: &[&str] = if analysis.risk_score >= 60 {
        HIGH_RISK_ADVICE
    } else {
        &[]
    };

    for text in fired.chain(high.iter().copied()) {
        if !advice.contains(&text) {
            advice.push(text);
        }
    }
    if advice.is_empty() {
        advice.extend(BASELINE_ADVICE.iter().copied());
    }
    advice.into_iter().map(str::to_string).collect()
}
