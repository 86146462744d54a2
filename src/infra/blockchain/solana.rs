//! Solana JSON-RPC adapter implementing the chain broadcaster.
//!
//! Builds native SOL transfer messages, submits externally signed
//! transactions via `sendTransaction` and polls `getSignatureStatuses`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use solana_sdk::{hash::Hash, message::Message, pubkey::Pubkey};
use solana_system_interface::instruction as system_instruction;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AppError, BlockchainError, ChainBroadcaster, ConfirmationStatus, SignedTransaction,
    TransferIntent, UnsignedTransaction,
};

/// Chain identifier served by this adapter
pub const SOLANA_CHAIN: &str = "solana";

/// Native token symbol
pub const NATIVE_TOKEN: &str = "SOL";

const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl RpcClientConfig {
    /// Load from `SOLANA_RPC_TIMEOUT_SECS` and `SOLANA_RPC_MAX_RETRIES`
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        Self {
            timeout: env::var("SOLANA_RPC_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: env::var("SOLANA_RPC_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            ..defaults
        }
    }
}

/// Abstract provider for Solana RPC interactions to enable testing
#[async_trait]
pub trait SolanaRpcProvider: Send + Sync {
    /// Send a JSON-RPC request
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError>;
}

/// HTTP-based Solana RPC provider
pub struct HttpSolanaRpcProvider {
    http_client: Client,
    rpc_url: String,
}

impl HttpSolanaRpcProvider {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Blockchain(BlockchainError::Connection(e.to_string())))?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[async_trait]
impl SolanaRpcProvider for HttpSolanaRpcProvider {
    async fn send_request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Blockchain(BlockchainError::Timeout(e.to_string()))
                } else if e.is_connect() {
                    AppError::Blockchain(BlockchainError::Connection(e.to_string()))
                } else {
                    AppError::Blockchain(BlockchainError::RpcError(e.to_string()))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Blockchain(BlockchainError::RpcError(format!(
                "HTTP {}",
                status
            ))));
        }

        let rpc_response: JsonRpcResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| AppError::Blockchain(BlockchainError::RpcError(e.to_string())))?;

        if let Some(error) = rpc_response.error {
            return Err(AppError::Blockchain(classify_rpc_error(
                error.code,
                &error.message,
            )));
        }

        rpc_response.result.ok_or_else(|| {
            AppError::Blockchain(BlockchainError::RpcError("Empty response".to_string()))
        })
    }
}

/// Map a JSON-RPC error object to a blockchain error
fn classify_rpc_error(code: i64, message: &str) -> BlockchainError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient") {
        return BlockchainError::InsufficientFunds;
    }
    if lower.contains("already been processed") {
        return BlockchainError::Rejected(ALREADY_PROCESSED.to_string());
    }
    match code {
        // Preflight simulation failure and signature verification failure
        -32002 | -32003 => BlockchainError::Rejected(format!("{}: {}", code, message)),
        -32602 => BlockchainError::InvalidAddress(message.to_string()),
        _ => BlockchainError::RpcError(format!("{}: {}", code, message)),
    }
}

const ALREADY_PROCESSED: &str = "already processed";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct BlockhashResponse {
    blockhash: String,
}

#[derive(Debug, Deserialize)]
struct BlockhashResult {
    value: BlockhashResponse,
}

#[derive(Debug, Deserialize)]
struct SignatureStatus {
    err: Option<serde_json::Value>,
    #[serde(rename = "confirmationStatus")]
    confirmation_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignatureStatusResult {
    value: Vec<Option<SignatureStatus>>,
}

/// Solana chain adapter
pub struct SolanaRpcClient {
    provider: Box<dyn SolanaRpcProvider>,
    config: RpcClientConfig,
}

impl SolanaRpcClient {
    /// Create a new RPC client with custom configuration
    pub fn new(rpc_url: &str, config: RpcClientConfig) -> Result<Self, AppError> {
        let provider = HttpSolanaRpcProvider::new(rpc_url, config.timeout)?;
        info!(rpc_url = %rpc_url, "Created Solana RPC client");
        Ok(Self {
            provider: Box::new(provider),
            config,
        })
    }

    /// Create a new RPC client with default configuration
    pub fn with_defaults(rpc_url: &str) -> Result<Self, AppError> {
        Self::new(rpc_url, RpcClientConfig::default())
    }

    /// Create a new client with a specific provider (useful for testing)
    pub fn with_provider(provider: Box<dyn SolanaRpcProvider>, config: RpcClientConfig) -> Self {
        Self { provider, config }
    }

    /// Make an RPC call, retrying transient failures
    #[instrument(skip(self, params))]
    async fn rpc_call<P: Serialize + Send + Sync, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, AppError> {
        let params_value = serde_json::to_value(params).map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Serialization error: {}",
                e
            )))
        })?;

        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self
                .provider
                .send_request(method, params_value.clone())
                .await
            {
                Ok(result_value) => {
                    return serde_json::from_value(result_value).map_err(|e| {
                        AppError::Blockchain(BlockchainError::RpcError(format!(
                            "Deserialization error: {}",
                            e
                        )))
                    });
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt = attempt, error = ?e, method = %method, "RPC call failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Blockchain(BlockchainError::RpcError("Unknown error".to_string()))
        }))
    }

    async fn latest_blockhash(&self) -> Result<Hash, AppError> {
        let result: BlockhashResult = self
            .rpc_call(
                "getLatestBlockhash",
                serde_json::json!([{"commitment": "confirmed"}]),
            )
            .await?;
        Hash::from_str(&result.value.blockhash).map_err(|e| {
            AppError::Blockchain(BlockchainError::RpcError(format!(
                "Invalid blockhash: {}",
                e
            )))
        })
    }
}

fn ensure_chain(chain: &str) -> Result<(), AppError> {
    if chain.eq_ignore_ascii_case(SOLANA_CHAIN) {
        Ok(())
    } else {
        Err(BlockchainError::UnsupportedChain(chain.to_string()).into())
    }
}

fn parse_pubkey(address: &str) -> Result<Pubkey, AppError> {
    address.parse::<Pubkey>().map_err(|e| {
        AppError::Blockchain(BlockchainError::InvalidAddress(format!(
            "{}: {}",
            address, e
        )))
    })
}

/// Convert a SOL amount to lamports, rejecting sub-lamport precision
pub fn sol_to_lamports(amount: Decimal) -> Result<u64, AppError> {
    let lamports = amount * Decimal::from(LAMPORTS_PER_SOL);
    if lamports.fract() != Decimal::ZERO {
        return Err(BlockchainError::Rejected(format!(
            "{} SOL is not a whole number of lamports",
            amount
        ))
        .into());
    }
    match lamports.to_u64() {
        Some(value) if value > 0 => Ok(value),
        _ => Err(BlockchainError::Rejected(format!("invalid transfer amount {}", amount)).into()),
    }
}

/// Serialize a single-signer legacy transaction for the wire
pub fn encode_wire_transaction(signed: &SignedTransaction) -> Result<Vec<u8>, AppError> {
    let signature = bs58::decode(&signed.signature).into_vec().map_err(|e| {
        AppError::Blockchain(BlockchainError::Rejected(format!(
            "Malformed signature: {}",
            e
        )))
    })?;
    if signature.len() != 64 {
        return Err(BlockchainError::Rejected(format!(
            "Signature must be 64 bytes, got {}",
            signature.len()
        ))
        .into());
    }

    let mut wire = Vec::with_capacity(1 + signature.len() + signed.payload.len());
    wire.push(1u8);
    wire.extend_from_slice(&signature);
    wire.extend_from_slice(&signed.payload);
    Ok(wire)
}

#[async_trait]
impl ChainBroadcaster for SolanaRpcClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let _: u64 = self.rpc_call("getSlot", Vec::<()>::new()).await?;
        Ok(())
    }

    #[instrument(skip(self, intent), fields(reference = %intent.reference, amount = %intent.amount))]
    async fn prepare_transfer(
        &self,
        intent: &TransferIntent,
    ) -> Result<UnsignedTransaction, AppError> {
        ensure_chain(&intent.chain)?;
        if !intent.token.eq_ignore_ascii_case(NATIVE_TOKEN) {
            return Err(BlockchainError::UnsupportedToken {
                chain: intent.chain.clone(),
                token: intent.token.clone(),
            }
            .into());
        }

        let from = parse_pubkey(&intent.from_address)?;
        let to = parse_pubkey(&intent.to_address)?;
        let lamports = sol_to_lamports(intent.amount)?;
        let blockhash = self.latest_blockhash().await?;

        let instruction = system_instruction::transfer(&from, &to, lamports);
        let message = Message::new_with_blockhash(&[instruction], Some(&from), &blockhash);
        debug!(lamports, "Built transfer message");

        Ok(UnsignedTransaction {
            intent: intent.clone(),
            payload: message.serialize(),
        })
    }

    #[instrument(skip(self, signed), fields(signer = %signed.signer_address))]
    async fn broadcast(&self, chain: &str, signed: &SignedTransaction) -> Result<String, AppError> {
        ensure_chain(chain)?;
        let wire = encode_wire_transaction(signed)?;
        let params = serde_json::json!([
            BASE64_STANDARD.encode(&wire),
            {"encoding": "base64", "preflightCommitment": "confirmed"}
        ]);

        match self.rpc_call::<_, String>("sendTransaction", params).await {
            Ok(tx_id) => {
                info!(tx_id = %tx_id, "Transaction submitted");
                Ok(tx_id)
            }
            // A resend of a landed transaction; its id is its first signature
            Err(AppError::Blockchain(BlockchainError::Rejected(msg)))
                if msg == ALREADY_PROCESSED =>
            {
                debug!("Transaction already processed");
                Ok(signed.signature.clone())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn get_confirmation_status(
        &self,
        chain: &str,
        tx_id: &str,
    ) -> Result<ConfirmationStatus, AppError> {
        ensure_chain(chain)?;
        let params = serde_json::json!([[tx_id], {"searchTransactionHistory": true}]);
        let result: SignatureStatusResult = self.rpc_call("getSignatureStatuses", params).await?;

        match result.value.first() {
            Some(Some(status)) => {
                if let Some(err) = &status.err {
                    return Ok(ConfirmationStatus::Rejected(err.to_string()));
                }
                match status.confirmation_status.as_deref() {
                    Some("confirmed") | Some("finalized") => Ok(ConfirmationStatus::Confirmed),
                    _ => Ok(ConfirmationStatus::Pending),
                }
            }
            _ => Ok(ConfirmationStatus::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum MockReply {
        Ok(serde_json::Value),
        Err(BlockchainError),
    }

    struct ScriptedProvider {
        replies: Mutex<VecDeque<MockReply>>,
        methods: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<MockReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                methods: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SolanaRpcProvider for ScriptedProvider {
        async fn send_request(
            &self,
            method: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value, AppError> {
            self.methods.lock().unwrap().push(method.to_string());
            match self.replies.lock().unwrap().pop_front() {
                Some(MockReply::Ok(value)) => Ok(value),
                Some(MockReply::Err(e)) => Err(AppError::Blockchain(e)),
                None => Ok(serde_json::Value::Null),
            }
        }
    }

    fn fast_config() -> RpcClientConfig {
        RpcClientConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn client(replies: Vec<MockReply>) -> SolanaRpcClient {
        SolanaRpcClient::with_provider(Box::new(ScriptedProvider::new(replies)), fast_config())
    }

    fn intent(amount: &str) -> TransferIntent {
        TransferIntent {
            chain: "solana".to_string(),
            token: "SOL".to_string(),
            from_address: Pubkey::new_from_array([1u8; 32]).to_string(),
            to_address: Pubkey::new_from_array([2u8; 32]).to_string(),
            amount: amount.parse().unwrap(),
            reference: "t1:0".to_string(),
        }
    }

    fn blockhash_reply() -> MockReply {
        MockReply::Ok(serde_json::json!({
            "context": {"slot": 1},
            "value": {"blockhash": Hash::new_from_array([5u8; 32]).to_string(), "lastValidBlockHeight": 100}
        }))
    }

    #[test]
    fn test_rpc_client_config_default() {
        let config = RpcClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_sol_to_lamports() {
        assert_eq!(sol_to_lamports("1.5".parse().unwrap()).unwrap(), 1_500_000_000);
        assert_eq!(sol_to_lamports("0.000000001".parse().unwrap()).unwrap(), 1);
        assert!(sol_to_lamports("0.0000000001".parse().unwrap()).is_err());
        assert!(sol_to_lamports(Decimal::ZERO).is_err());
    }

    #[test]
    fn test_classify_rpc_error() {
        assert_eq!(
            classify_rpc_error(-32002, "Transaction simulation failed: insufficient lamports"),
            BlockchainError::InsufficientFunds
        );
        assert!(matches!(
            classify_rpc_error(-32003, "Transaction signature verification failure"),
            BlockchainError::Rejected(_)
        ));
        assert!(matches!(
            classify_rpc_error(-32005, "Node is behind"),
            BlockchainError::RpcError(_)
        ));
    }

    #[test]
    fn test_encode_wire_transaction_layout() {
        let signed = SignedTransaction {
            chain: "solana".to_string(),
            signer_address: "addr".to_string(),
            payload: vec![9, 9, 9],
            signature: bs58::encode([7u8; 64]).into_string(),
        };
        let wire = encode_wire_transaction(&signed).unwrap();
        assert_eq!(wire.len(), 1 + 64 + 3);
        assert_eq!(wire[0], 1);
        assert_eq!(&wire[65..], &[9, 9, 9]);
    }

    #[test]
    fn test_encode_wire_rejects_short_signature() {
        let signed = SignedTransaction {
            chain: "solana".to_string(),
            signer_address: "addr".to_string(),
            payload: vec![],
            signature: bs58::encode([7u8; 10]).into_string(),
        };
        assert!(encode_wire_transaction(&signed).is_err());
    }

    #[tokio::test]
    async fn test_prepare_transfer_builds_message() {
        let client = client(vec![blockhash_reply()]);
        let intent = intent("0.25");
        let unsigned = client.prepare_transfer(&intent).await.unwrap();

        assert_eq!(unsigned.intent, intent);
        assert!(!unsigned.payload.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_transfer_rejects_spl_tokens() {
        let client = client(vec![]);
        let mut intent = intent("1");
        intent.token = "USDC".to_string();

        let result = client.prepare_transfer(&intent).await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::UnsupportedToken { .. }))
        ));
    }

    #[tokio::test]
    async fn test_prepare_transfer_rejects_other_chains() {
        let client = client(vec![]);
        let mut intent = intent("1");
        intent.chain = "ethereum".to_string();

        let result = client.prepare_transfer(&intent).await;
        assert!(matches!(
            result,
            Err(AppError::Blockchain(BlockchainError::UnsupportedChain(_)))
        ));
    }

    #[tokio::test]
    async fn test_rpc_call_retries_transient_errors() {
        let client = client(vec![
            MockReply::Err(BlockchainError::Timeout("slow".to_string())),
            MockReply::Ok(serde_json::json!(42u64)),
        ]);
        assert!(client.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_rpc_call_does_not_retry_rejections() {
        let provider = ScriptedProvider::new(vec![
            MockReply::Err(BlockchainError::Rejected("bad".to_string())),
            MockReply::Ok(serde_json::json!(42u64)),
        ]);
        let client = SolanaRpcClient::with_provider(Box::new(provider), fast_config());
        assert!(matches!(
            client.health_check().await,
            Err(AppError::Blockchain(BlockchainError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_resend_of_processed_transaction() {
        let client = client(vec![MockReply::Err(BlockchainError::Rejected(
            ALREADY_PROCESSED.to_string(),
        ))]);
        let signed = SignedTransaction {
            chain: "solana".to_string(),
            signer_address: "addr".to_string(),
            payload: vec![1, 2, 3],
            signature: bs58::encode([3u8; 64]).into_string(),
        };
        assert_eq!(
            client.broadcast("solana", &signed).await.unwrap(),
            signed.signature
        );
    }

    #[tokio::test]
    async fn test_confirmation_status_mapping() {
        let client = client(vec![
            MockReply::Ok(serde_json::json!({"value": [null]})),
            MockReply::Ok(serde_json::json!({"value": [{"err": null, "confirmationStatus": "processed"}]})),
            MockReply::Ok(serde_json::json!({"value": [{"err": null, "confirmationStatus": "finalized"}]})),
            MockReply::Ok(serde_json::json!({"value": [{"err": {"InstructionError": [0, "Custom"]}, "confirmationStatus": "confirmed"}]})),
        ]);

        assert_eq!(
            client.get_confirmation_status("solana", "sig").await.unwrap(),
            ConfirmationStatus::Pending
        );
        assert_eq!(
            client.get_confirmation_status("solana", "sig").await.unwrap(),
            ConfirmationStatus::Pending
        );
        assert_eq!(
            client.get_confirmation_status("solana", "sig").await.unwrap(),
            ConfirmationStatus::Confirmed
        );
        assert!(matches!(
            client.get_confirmation_status("solana", "sig").await.unwrap(),
            ConfirmationStatus::Rejected(_)
        ));
    }
}
