//! Infrastructure layer implementations.

pub mod blockchain;
pub mod database;
pub mod keys;
pub mod signing;

pub use blockchain::{RpcClientConfig, SolanaRpcClient};
pub use database::{PostgresClient, PostgresConfig};
pub use keys::{KeyCipher, KeyStrategyRegistry, signing_key_from_base58};
pub use signing::StaticKeySigner;
