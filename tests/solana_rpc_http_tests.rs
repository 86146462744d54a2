//! HTTP-level tests for the Solana JSON-RPC adapter.
//!
//! Uses `wiremock` to stand in for the RPC node.

use std::time::Duration;

use privacy_transfer_engine::domain::{
    AppError, BlockchainError, ChainBroadcaster, ConfirmationStatus, SignedTransaction,
    TransferIntent,
};
use privacy_transfer_engine::infra::{RpcClientConfig, SolanaRpcClient};
use rust_decimal::Decimal;
use serde_json::json;
use solana_sdk::pubkey::Pubkey;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, method},
};

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn rpc_error(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

fn client(server: &MockServer, max_retries: u32) -> SolanaRpcClient {
    SolanaRpcClient::new(
        &server.uri(),
        RpcClientConfig {
            timeout: Duration::from_secs(5),
            max_retries,
            retry_delay: Duration::from_millis(10),
        },
    )
    .unwrap()
}

fn signed(signature: &str) -> SignedTransaction {
    SignedTransaction {
        chain: "solana".to_string(),
        signer_address: Pubkey::new_from_array([1; 32]).to_string(),
        payload: vec![1, 0, 1, 3],
        signature: signature.to_string(),
    }
}

fn sample_signature() -> String {
    bs58::encode([7u8; 64]).into_string()
}

// ============================================================================
// HEALTH / TRANSPORT
// ============================================================================

#[tokio::test]
async fn test_health_check_calls_get_slot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getSlot"})))
        .respond_with(rpc_result(json!(250_000_000u64)))
        .expect(1)
        .mount(&server)
        .await;

    assert!(client(&server, 0).health_check().await.is_ok());
}

#[tokio::test]
async fn test_http_500_is_retried_then_surfaces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .expect(3)
        .mount(&server)
        .await;

    let result = client(&server, 2).health_check().await;
    assert!(matches!(
        result,
        Err(AppError::Blockchain(BlockchainError::RpcError(_)))
    ));
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!(1u64)))
        .mount(&server)
        .await;

    assert!(client(&server, 3).health_check().await.is_ok());
}

// ============================================================================
// BROADCAST
// ============================================================================

#[tokio::test]
async fn test_send_transaction_returns_signature() {
    let server = MockServer::start().await;
    let signature = sample_signature();
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "sendTransaction"})))
        .respond_with(rpc_result(json!(signature)))
        .expect(1)
        .mount(&server)
        .await;

    let tx_id = client(&server, 0)
        .broadcast("solana", &signed(&signature))
        .await
        .unwrap();
    assert_eq!(tx_id, signature);
}

#[tokio::test]
async fn test_preflight_failure_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_error(-32002, "Transaction simulation failed: custom program error"))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server, 3)
        .broadcast("solana", &signed(&sample_signature()))
        .await;
    assert!(matches!(
        result,
        Err(AppError::Blockchain(BlockchainError::Rejected(_)))
    ));
}

#[tokio::test]
async fn test_already_processed_resend_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_error(-32002, "This transaction has already been processed"))
        .mount(&server)
        .await;

    let signature = sample_signature();
    let tx_id = client(&server, 0)
        .broadcast("solana", &signed(&signature))
        .await
        .unwrap();
    assert_eq!(tx_id, signature);
}

#[tokio::test]
async fn test_insufficient_funds_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_error(-32002, "Attempt to debit an account but found no record of a prior credit: insufficient funds"))
        .mount(&server)
        .await;

    let result = client(&server, 0)
        .broadcast("solana", &signed(&sample_signature()))
        .await;
    assert!(matches!(
        result,
        Err(AppError::Blockchain(BlockchainError::InsufficientFunds))
    ));
}

#[tokio::test]
async fn test_malformed_signature_never_reaches_node() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!("unused")))
        .expect(0)
        .mount(&server)
        .await;

    let result = client(&server, 0).broadcast("solana", &signed("short")).await;
    assert!(matches!(
        result,
        Err(AppError::Blockchain(BlockchainError::Rejected(_)))
    ));
}

// ============================================================================
// PREPARE / CONFIRM
// ============================================================================

#[tokio::test]
async fn test_prepare_transfer_fetches_blockhash() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "getLatestBlockhash"})))
        .respond_with(rpc_result(json!({
            "context": {"slot": 1},
            "value": {
                "blockhash": "11111111111111111111111111111111",
                "lastValidBlockHeight": 100
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let intent = TransferIntent {
        chain: "solana".to_string(),
        token: "SOL".to_string(),
        from_address: Pubkey::new_from_array([1; 32]).to_string(),
        to_address: Pubkey::new_from_array([2; 32]).to_string(),
        amount: Decimal::new(15, 1),
        reference: "tr_1:0".to_string(),
    };
    let unsigned = client(&server, 0).prepare_transfer(&intent).await.unwrap();
    assert_eq!(unsigned.intent, intent);
    assert!(!unsigned.payload.is_empty());
}

#[tokio::test]
async fn test_confirmation_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!({
            "context": {"slot": 5},
            "value": [{"slot": 5, "confirmations": null, "err": null, "confirmationStatus": "finalized"}]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!({"context": {"slot": 5}, "value": [null]})))
        .mount(&server)
        .await;

    let client = client(&server, 0);
    let signature = sample_signature();
    assert_eq!(
        client.get_confirmation_status("solana", &signature).await.unwrap(),
        ConfirmationStatus::Confirmed
    );
    assert_eq!(
        client.get_confirmation_status("solana", &signature).await.unwrap(),
        ConfirmationStatus::Pending
    );
}
