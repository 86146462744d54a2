//! Service facade and resume worker flows.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DESTINATION, Harness, SOURCE_ADDRESS, WALLET_ID, request};
use privacy_transfer_engine::app::{ResumeWorker, WalletPoolConfig, WorkerConfig, spawn_worker};
use privacy_transfer_engine::domain::{
    AppError, CustomConfig, DatabaseError, Direction, ExecutionError, HistoricalTransaction,
    HopWalletStore, PrivacyLevel, PrivacyPreferences, RiskLevel, TransferHistoryFilter,
    TransferRecord, TransferStatus, TransferStore, ValidationError,
};
use rust_decimal::Decimal;
use tokio::sync::watch;

async fn wait_terminal(h: &Harness, id: &str) -> TransferRecord {
    for _ in 0..1_000 {
        let record = h.service.get_transfer(id).await.unwrap();
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("transfer {} never finished", id);
}

// ============================================================================
// PLANNING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_plan_persists_planned_record() {
    let h = Harness::new();
    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Enhanced))
        .await
        .unwrap();

    let record = h.service.get_transfer(&plan.transfer_id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Planned);
    assert!(!record.execution_requested);
    assert_eq!(record.source_address, SOURCE_ADDRESS);
    assert_eq!(record.plan, plan);
    assert_eq!(plan.steps[0].source_address, SOURCE_ADDRESS);
    assert_eq!(plan.steps[1].destination_address, DESTINATION);
    assert_eq!(h.service.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_plan_rejects_unknown_wallet_and_chain_mismatch() {
    let h = Harness::new();

    let mut req = request("1", PrivacyLevel::Standard);
    req.source_wallet_id = "nobody".to_string();
    assert!(matches!(
        h.service.plan_transfer(&req).await,
        Err(AppError::Validation(ValidationError::InvalidField { field, .. })) if field == "source_wallet_id"
    ));

    let mut req = request("1", PrivacyLevel::Standard);
    req.chain = "ethereum".to_string();
    assert!(matches!(
        h.service.plan_transfer(&req).await,
        Err(AppError::Validation(ValidationError::InvalidField { field, .. })) if field == "chain"
    ));

    let mut req = request("1", PrivacyLevel::Standard);
    req.destination_address = String::new();
    assert!(matches!(
        h.service.plan_transfer(&req).await,
        Err(AppError::Validation(ValidationError::Multiple(_)))
    ));

    assert!(matches!(
        h.service.plan_transfer(&request("0", PrivacyLevel::Standard)).await,
        Err(AppError::Validation(ValidationError::InvalidAmount(_)))
    ));
    assert_eq!(h.store.hop_wallet_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stored_preferences_fill_missing_level() {
    let h = Harness::new();
    h.wallets.set_preferences(PrivacyPreferences {
        wallet_id: WALLET_ID.to_string(),
        privacy_level: PrivacyLevel::Maximum,
        custom: CustomConfig {
            max_hops: Some(4),
            ..Default::default()
        },
    });

    let mut req = request("100", PrivacyLevel::Standard);
    req.privacy_level = None;
    let plan = h.service.plan_transfer(&req).await.unwrap();
    assert_eq!(plan.privacy_level, PrivacyLevel::Maximum);
    assert!((3..=4).contains(&plan.steps.len()));

    // An explicit level wins over the stored one
    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Standard))
        .await
        .unwrap();
    assert_eq!(plan.privacy_level, PrivacyLevel::Standard);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_level_ignores_config_stored_for_another_level() {
    let h = Harness::new();
    h.wallets.set_preferences(PrivacyPreferences {
        wallet_id: WALLET_ID.to_string(),
        privacy_level: PrivacyLevel::Enhanced,
        custom: CustomConfig {
            max_hops: Some(2),
            ..Default::default()
        },
    });

    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Maximum))
        .await
        .unwrap();
    assert_eq!(plan.privacy_level, PrivacyLevel::Maximum);
    assert!((3..=5).contains(&plan.steps.len()));
}

#[tokio::test(start_paused = true)]
async fn test_stored_config_applies_to_matching_explicit_level() {
    let h = Harness::new();
    h.wallets.set_preferences(PrivacyPreferences {
        wallet_id: WALLET_ID.to_string(),
        privacy_level: PrivacyLevel::Maximum,
        custom: CustomConfig {
            max_hops: Some(3),
            ..Default::default()
        },
    });

    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Maximum))
        .await
        .unwrap();
    assert_eq!(plan.steps.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_default_preferences_without_stored_config() {
    let h = Harness::new();

    let mut req = request("100", PrivacyLevel::Standard);
    req.privacy_level = None;
    let plan = h.service.plan_transfer(&req).await.unwrap();
    assert_eq!(plan.privacy_level, PrivacyLevel::Enhanced);
    assert_eq!(plan.steps.len(), 2);

    // The default cap belongs to Enhanced and never narrows Maximum
    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Maximum))
        .await
        .unwrap();
    assert!((3..=5).contains(&plan.steps.len()));
}

// ============================================================================
// HOP WALLET EXPIRY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweep_cancels_expired_unapproved_plan() {
    let h = Harness::with_pool_config(WalletPoolConfig {
        wallet_ttl: chrono::Duration::zero(),
        ..Default::default()
    });
    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Enhanced))
        .await
        .unwrap();
    let hop_wallet = plan.steps[1].source_address.clone();

    assert_eq!(h.service.sweep_expired_wallets(10).await.unwrap(), 1);

    let record = h.service.get_transfer(&plan.transfer_id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(record.failure.unwrap().holding_address, SOURCE_ADDRESS);
    let stored = h.store.get_hop_wallet(&hop_wallet).await.unwrap().unwrap();
    assert!(stored.wallet.retired_at.is_some());
    assert!(stored.encrypted_key.is_none());
    assert_eq!(h.broadcaster.broadcast_count(), 0);

    assert_eq!(h.service.sweep_expired_wallets(10).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_keeps_wallets_of_approved_plan() {
    let h = Harness::with_pool_config(WalletPoolConfig {
        wallet_ttl: chrono::Duration::zero(),
        ..Default::default()
    });
    let id = h.plan_approved(&request("100", PrivacyLevel::Enhanced)).await;
    let hop_wallet = h.record(&id).plan.steps[1].source_address.clone();

    assert_eq!(h.service.sweep_expired_wallets(10).await.unwrap(), 0);
    assert_eq!(h.record(&id).status, TransferStatus::Planned);
    let stored = h.store.get_hop_wallet(&hop_wallet).await.unwrap().unwrap();
    assert!(stored.wallet.retired_at.is_none());

    let record = h.engine.execute(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_wallets_are_not_swept() {
    let h = Harness::new();
    h.service
        .plan_transfer(&request("100", PrivacyLevel::Enhanced))
        .await
        .unwrap();

    assert_eq!(h.service.sweep_expired_wallets(10).await.unwrap(), 0);
}

// ============================================================================
// EXECUTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_execute_transfer_runs_in_background() {
    let h = Harness::new();
    let snapshot = h
        .service
        .execute_transfer(&request("100", PrivacyLevel::Enhanced))
        .await
        .unwrap();
    assert!(snapshot.execution_requested);
    assert!(!snapshot.status.is_terminal());

    let record = wait_terminal(&h, &snapshot.id).await;
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.plan.delivered_amount(), record.plan.steps[1].amount);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.service.in_flight_count(), 0);
    assert_eq!(h.broadcaster.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_deduplicates_in_flight_records() {
    let h = Harness::new();
    let id = h.plan_approved(&request("100", PrivacyLevel::Enhanced)).await;

    assert!(h.service.dispatch(&id));
    assert!(!h.service.dispatch(&id));
    assert_eq!(h.service.in_flight_count(), 1);

    let record = wait_terminal(&h, &id).await;
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(h.broadcaster.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_commit_unknown_transfer() {
    let h = Harness::new();
    assert!(matches!(
        h.service.commit_transfer("missing").await,
        Err(AppError::Execution(ExecutionError::TransferNotFound(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_history_is_scoped_and_filtered() {
    let h = Harness::new();
    let done = h.plan_approved(&request("5", PrivacyLevel::Standard)).await;
    h.engine.execute(&done).await.unwrap();
    h.service
        .plan_transfer(&request("6", PrivacyLevel::Standard))
        .await
        .unwrap();

    let all = h
        .service
        .get_transfer_history(WALLET_ID, &TransferHistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let completed = h
        .service
        .get_transfer_history(
            WALLET_ID,
            &TransferHistoryFilter {
                status: Some(TransferStatus::Completed),
                limit: 10,
            },
        )
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, done);

    assert!(
        h.service
            .get_transfer_history("other_wallet", &TransferHistoryFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert!(matches!(
        h.service
            .get_transfer_history(
                WALLET_ID,
                &TransferHistoryFilter {
                    status: None,
                    limit: 500
                }
            )
            .await,
        Err(AppError::Validation(_))
    ));
}

// ============================================================================
// ANALYSIS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_analysis_entry_points() {
    let h = Harness::new();
    assert!(matches!(
        h.service.analyze_tracking("  ", "solana").await,
        Err(AppError::Validation(ValidationError::MissingField(_)))
    ));

    h.history.set_history(
        SOURCE_ADDRESS,
        "solana",
        vec![HistoricalTransaction::new(
            "Peer1",
            Decimal::from(3),
            chrono::Utc::now(),
            Direction::Incoming,
            "solana",
        )],
    );
    let analysis = h.service.analyze_tracking(SOURCE_ADDRESS, "solana").await.unwrap();
    assert_eq!(analysis.transactions_analyzed, 1);

    let report = h.service.generate_privacy_report(WALLET_ID).await.unwrap();
    assert_eq!(report.address, SOURCE_ADDRESS);
    assert_eq!(report.privacy_score, 100 - report.risk_score);
    assert_eq!(report.risk_level, RiskLevel::from_score(report.risk_score));
    assert!(!report.recommendations.is_empty());

    assert!(matches!(
        h.service.generate_privacy_report("nobody").await,
        Err(AppError::Database(DatabaseError::NotFound(_)))
    ));
}

// ============================================================================
// RESUME WORKER
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worker_resumes_approved_records_only() {
    let h = Harness::new();
    let approved = h.plan_approved(&request("100", PrivacyLevel::Enhanced)).await;
    let unapproved = h
        .service
        .plan_transfer(&request("7", PrivacyLevel::Standard))
        .await
        .unwrap()
        .transfer_id;

    let (_tx, rx) = watch::channel(false);
    let store: Arc<dyn TransferStore> = h.store.clone();
    let worker = ResumeWorker::new(h.service.clone(), store, WorkerConfig::default(), rx);

    assert_eq!(worker.poll_once().await.unwrap(), 1);
    let record = wait_terminal(&h, &approved).await;
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(
        h.service.get_transfer(&unapproved).await.unwrap().status,
        TransferStatus::Planned
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(worker.poll_once().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_resumes_interrupted_record() {
    let h = Harness::new();
    let id = h.plan_approved(&request("100", PrivacyLevel::Enhanced)).await;
    let mut record = h.engine.execute(&id).await.unwrap();
    let broadcasts = h.broadcaster.broadcast_count();
    record.status = TransferStatus::InProgress;
    record.completed_at = None;
    record.plan.steps[1].status = privacy_transfer_engine::domain::HopStatus::Broadcasting;
    h.store.put_record(record);

    let store: Arc<dyn TransferStore> = h.store.clone();
    let (handle, shutdown) = spawn_worker(
        h.service.clone(),
        store,
        WorkerConfig {
            poll_interval: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let resumed = wait_terminal(&h, &id).await;
    assert_eq!(resumed.status, TransferStatus::Completed);
    assert_eq!(h.broadcaster.broadcast_count(), broadcasts);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_worker_sweeps_expired_plans() {
    let h = Harness::with_pool_config(WalletPoolConfig {
        wallet_ttl: chrono::Duration::zero(),
        ..Default::default()
    });
    let plan = h
        .service
        .plan_transfer(&request("100", PrivacyLevel::Enhanced))
        .await
        .unwrap();

    let store: Arc<dyn TransferStore> = h.store.clone();
    let (handle, shutdown) = spawn_worker(h.service.clone(), store, WorkerConfig::default());

    let record = wait_terminal(&h, &plan.transfer_id).await;
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(h.broadcaster.broadcast_count(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap();
}
