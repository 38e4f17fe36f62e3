use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use uuid::Uuid;

use vaultgate_core::IdempotencyKey;

use super::{CreateWalletRequest, CustodialProvider, ProviderError, Wallet};

/// Idempotent provider for tests/dev.
///
/// Calls with a known key return the wallet created by the first call. It can
/// be told to fail the next calls to exercise retries.
#[derive(Debug, Default)]
pub struct InMemoryCustodialProvider {
    wallets: Mutex<HashMap<IdempotencyKey, Wallet>>,
    calls: AtomicUsize,
    failures_left: AtomicU32,
    /// Error returned by injected failures; a 503 when unset.
    injected: Mutex<Option<ProviderError>>,
}

impl InMemoryCustodialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `error`.
    pub fn fail_next_with(&self, n: u32, error: ProviderError) {
        *self.injected.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct wallets created.
    pub fn wallet_count(&self) -> usize {
        self.wallets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl CustodialProvider for InMemoryCustodialProvider {
    async fn create_wallet(
        &self,
        request: CreateWalletRequest,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Wallet, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let injected = self.injected.lock().unwrap_or_else(PoisonError::into_inner).clone();
            return Err(injected.unwrap_or_else(|| {
                ProviderError::from_response(503, r#"{"error":{"message":"provider temporarily unavailable"}}"#)
            }));
        }

        if request.account_id.trim().is_empty() {
            return Err(ProviderError::from_response(422, r#"{"errors":[{"detail":"accountId is required"}]}"#));
        }

        let mut wallets = self.wallets.lock().unwrap_or_else(PoisonError::into_inner);
        let wallet = wallets.entry(idempotency_key.clone()).or_insert_with(|| {
            let id = Uuid::new_v4();
            Wallet {
                id: id.to_string(),
                account_id: request.account_id.clone(),
                address: format!("0x{}", id.simple()),
                blockchain: request.blockchain.clone(),
                created_at: Utc::now(),
            }
        });
        Ok(wallet.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_returns_the_same_wallet() {
        let provider = InMemoryCustodialProvider::new();
        let key = IdempotencyKey::parse("wallet-a-1").unwrap();

        let first = provider.create_wallet(CreateWalletRequest::new("a-1"), &key).await.unwrap();
        let second = provider.create_wallet(CreateWalletRequest::new("a-1"), &key).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.wallet_count(), 1);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_normalized() {
        let provider = InMemoryCustodialProvider::new();
        provider.fail_next(1);
        let key = IdempotencyKey::generate();

        let err = provider.create_wallet(CreateWalletRequest::new("a-1"), &key).await.unwrap_err();
        assert_eq!(err.message, "provider temporarily unavailable");
        assert!(err.is_transient());

        provider.create_wallet(CreateWalletRequest::new("a-1"), &key).await.unwrap();
        assert_eq!(provider.wallet_count(), 1);
    }

    #[tokio::test]
    async fn blank_account_is_rejected() {
        let provider = InMemoryCustodialProvider::new();
        let err = provider
            .create_wallet(CreateWalletRequest::new(" "), &IdempotencyKey::generate())
            .await
            .unwrap_err();
        assert_eq!(err.message, "accountId is required");
        assert!(!err.is_transient());
    }
}
