//! Chain adapter implementations.

pub mod solana;

pub use solana::{
    HttpSolanaRpcProvider, RpcClientConfig, SolanaRpcClient, SolanaRpcProvider,
    encode_wire_transaction, sol_to_lamports,
};
