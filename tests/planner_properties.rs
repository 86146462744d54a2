//! Path planner invariants across privacy levels.

use std::str::FromStr;
use std::sync::Arc;

use privacy_transfer_engine::app::{
    HopWalletPool, PathPlanner, PlannerConfig, RiskModel, WalletPoolConfig,
};
use privacy_transfer_engine::domain::{
    AppError, HopStatus, HopWalletStore, PlanningError, PrivacyLevel, TransferRequest,
};
use privacy_transfer_engine::infra::{KeyCipher, KeyStrategyRegistry};
use privacy_transfer_engine::test_utils::MockTransferStore;
use rust_decimal::Decimal;

fn planner_with(config: PlannerConfig) -> (PathPlanner, Arc<MockTransferStore>) {
    let store = Arc::new(MockTransferStore::new());
    let pool = Arc::new(HopWalletPool::new(
        store.clone(),
        KeyStrategyRegistry::with_defaults(),
        Arc::new(KeyCipher::generate()),
        WalletPoolConfig::default(),
    ));
    (PathPlanner::new(pool, RiskModel::default(), config), store)
}

fn request(amount: &str, level: PrivacyLevel) -> TransferRequest {
    TransferRequest::new("wallet_1", "DestAddr", "SOL", "solana", amount, level)
}

fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[tokio::test]
async fn test_enhanced_amounts_decrease_by_fee() {
    let (planner, _) = planner_with(PlannerConfig::default().with_fee("solana", dec("0.1")));
    let plan = planner
        .plan("tr_1", &request("100.0", PrivacyLevel::Enhanced), "SrcAddr")
        .await
        .unwrap();

    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].amount, dec("99.9"));
    assert_eq!(plan.steps[1].amount, dec("99.8"));
    assert_eq!(plan.total_fee, dec("0.2"));
    assert_eq!(plan.delivered_amount(), dec("99.8"));
    assert_eq!(plan.privacy_score, 100 - plan.simulated_risk_score);
}

#[tokio::test]
async fn test_standard_is_single_undelayed_step() {
    let (planner, store) = planner_with(PlannerConfig::default());
    let plan = planner
        .plan("tr_1", &request("2.5", PrivacyLevel::Standard), "SrcAddr")
        .await
        .unwrap();

    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].delay_secs, 0);
    assert_eq!(plan.estimated_latency_secs, 0);
    assert_eq!(plan.steps[0].source_address, "SrcAddr");
    assert_eq!(plan.steps[0].destination_address, "DestAddr");
    assert_eq!(store.hop_wallet_count(), 0);
}

#[tokio::test]
async fn test_every_level_chains_and_jitters() {
    let (planner, store) = planner_with(PlannerConfig {
        rng_seed: Some(11),
        ..Default::default()
    });

    for (i, level) in [PrivacyLevel::Enhanced, PrivacyLevel::Maximum]
        .into_iter()
        .cycle()
        .take(10)
        .enumerate()
    {
        let transfer_id = format!("tr_{}", i);
        let plan = planner
            .plan(&transfer_id, &request("50", level), "SrcAddr")
            .await
            .unwrap();

        assert!(plan.check_invariants().is_ok());
        assert_eq!(plan.steps[0].source_address, "SrcAddr");
        assert_eq!(plan.steps.last().unwrap().destination_address, "DestAddr");
        assert!(plan.steps.iter().all(|s| s.status == HopStatus::Pending));
        assert!(plan.steps.iter().skip(1).all(|s| s.delay_secs > 0));
        assert_eq!(
            plan.estimated_latency_secs,
            plan.steps.iter().map(|s| s.delay_secs).sum::<u64>()
        );

        // Intermediaries are fresh and bound to this plan only
        let bound = store.list_hop_wallets_for_plan(&transfer_id).await.unwrap();
        let mut addresses: Vec<String> = bound.into_iter().map(|w| w.wallet.address).collect();
        addresses.sort();
        let mut expected = plan.ephemeral_addresses();
        expected.sort();
        assert_eq!(addresses, expected);
    }
}

#[tokio::test]
async fn test_seeded_planner_is_reproducible() {
    let config = PlannerConfig {
        rng_seed: Some(99),
        ..Default::default()
    };
    let (a, _) = planner_with(config.clone());
    let (b, _) = planner_with(config);

    let plan_a = a
        .plan("tr_1", &request("10", PrivacyLevel::Maximum), "SrcAddr")
        .await
        .unwrap();
    let plan_b = b
        .plan("tr_1", &request("10", PrivacyLevel::Maximum), "SrcAddr")
        .await
        .unwrap();

    let delays_a: Vec<u64> = plan_a.steps.iter().map(|s| s.delay_secs).collect();
    let delays_b: Vec<u64> = plan_b.steps.iter().map(|s| s.delay_secs).collect();
    assert_eq!(delays_a, delays_b);
    assert_eq!(plan_a.simulated_risk_score, plan_b.simulated_risk_score);
}

#[tokio::test]
async fn test_amount_too_small_for_fees() {
    let (planner, store) = planner_with(PlannerConfig::default().with_fee("solana", dec("1")));
    let result = planner
        .plan("tr_1", &request("1.5", PrivacyLevel::Enhanced), "SrcAddr")
        .await;

    assert!(matches!(
        result,
        Err(AppError::Planning(PlanningError::InsufficientAmount { .. }))
    ));
    assert_eq!(store.hop_wallet_count(), 0);
}

#[tokio::test]
async fn test_self_transfer_rejected() {
    let (planner, _) = planner_with(PlannerConfig::default());
    let result = planner
        .plan("tr_1", &request("1", PrivacyLevel::Standard), "DestAddr")
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}
