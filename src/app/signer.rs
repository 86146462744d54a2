//! Signer routing between hop wallets and source wallets.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use super::wallet_pool::HopWalletPool;
use crate::domain::{
    AppError, SignedTransaction, SigningError, TransactionSigner, UnsignedTransaction,
};

/// Signs with the hop wallet pool when it owns the wallet, otherwise with the source signer
pub struct RoutingSigner {
    pool: Arc<HopWalletPool>,
    source: Option<Arc<dyn TransactionSigner>>,
}

impl RoutingSigner {
    pub fn new(pool: Arc<HopWalletPool>, source: Option<Arc<dyn TransactionSigner>>) -> Self {
        Self { pool, source }
    }
}

#[async_trait]
impl TransactionSigner for RoutingSigner {
    #[instrument(skip(self, unsigned))]
    async fn sign(
        &self,
        wallet_ref: &str,
        unsigned: &UnsignedTransaction,
    ) -> Result<SignedTransaction, AppError> {
        if self.pool.owns(wallet_ref).await? {
            return self.pool.sign(wallet_ref, unsigned).await;
        }
        match &self.source {
            Some(source) => source.sign(wallet_ref, unsigned).await,
            None => Err(SigningError::SigningUnavailable(wallet_ref.to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wallet_pool::WalletPoolConfig;
    use crate::domain::TransferIntent;
    use crate::infra::keys::{KeyCipher, KeyStrategyRegistry};
    use crate::test_utils::{MockSigner, MockTransferStore};
    use rust_decimal::Decimal;

    fn unsigned(from: &str) -> UnsignedTransaction {
        UnsignedTransaction {
            intent: TransferIntent {
                chain: "solana".to_string(),
                token: "SOL".to_string(),
                from_address: from.to_string(),
                to_address: "Dest".to_string(),
                amount: Decimal::ONE,
                reference: "tr_1:0".to_string(),
            },
            payload: vec![9, 9],
        }
    }

    fn pool() -> Arc<HopWalletPool> {
        Arc::new(HopWalletPool::new(
            Arc::new(MockTransferStore::new()),
            KeyStrategyRegistry::with_defaults(),
            Arc::new(KeyCipher::generate()),
            WalletPoolConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_routes_hop_wallets_to_pool() {
        let pool = pool();
        let wallet = pool.allocate("solana", "tr_1").await.unwrap();
        let source = Arc::new(MockSigner::new());
        let signer = RoutingSigner::new(pool, Some(source.clone()));

        let signed = signer
            .sign(&wallet.address, &unsigned(&wallet.address))
            .await
            .unwrap();
        assert_eq!(signed.signer_address, wallet.address);
        assert_eq!(source.sign_count(), 0);
    }

    #[tokio::test]
    async fn test_routes_other_refs_to_source() {
        let source = Arc::new(MockSigner::new());
        let signer = RoutingSigner::new(pool(), Some(source.clone()));
        signer.sign("wallet_1", &unsigned("SrcAddr")).await.unwrap();
        assert_eq!(source.sign_count(), 1);
    }

    #[tokio::test]
    async fn test_without_source_signer_is_unavailable() {
        let signer = RoutingSigner::new(pool(), None);
        assert!(matches!(
            signer.sign("wallet_1", &unsigned("SrcAddr")).await,
            Err(AppError::Signing(SigningError::SigningUnavailable(_)))
        ));
    }
}
