//! Custodial wallet provider port.
//!
//! The provider collapses repeated requests carrying the same idempotency key
//! into one wallet, which is what makes queue retries of a provisioning job
//! safe. Failures surface as [`ProviderError`] with a message normalized from
//! the provider's response envelope.

pub mod http;
pub mod in_memory;
pub mod provisioner;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use vaultgate_core::IdempotencyKey;

pub use http::HttpCustodialProvider;
pub use in_memory::InMemoryCustodialProvider;
pub use provisioner::{WALLET_PROVISIONED, WalletProvisioner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletRequest {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl CreateWalletRequest {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            blockchain: None,
            label: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: String,
    pub account_id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A provider call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Normalized, user-presentable message.
    pub message: String,
    /// HTTP status when the provider answered at all.
    pub status: Option<u16>,
    /// Wait the provider asked for, from `Retry-After`.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// Build from a provider response, normalizing the envelope.
    pub fn from_response(status: u16, body: &str) -> Self {
        Self {
            message: normalize_error_message(body),
            status: Some(status),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Network failures, rate limiting and server errors may succeed later.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 408 || status == 429 || status >= 500,
        }
    }
}

/// Extract the most specific message from a provider error body.
///
/// Looks at `error.message`, then `errors[0].message` or `errors[0].detail`,
/// then top-level `message` and `detail`. Falls back to the raw text when the
/// body is not JSON or carries none of these.
pub fn normalize_error_message(raw: &str) -> String {
    let fallback = || {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            "provider request failed".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let Ok(body) = serde_json::from_str::<JsonValue>(raw) else {
        return fallback();
    };

    let first_error = body.get("errors").and_then(|e| e.get(0));
    let candidates = [
        body.get("error").and_then(|e| e.get("message")),
        first_error.and_then(|e| e.get("message")),
        first_error.and_then(|e| e.get("detail")),
        body.get("message"),
        body.get("detail"),
        // `{"error": "..."}`
        body.get("error"),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(fallback)
}

#[async_trait::async_trait]
pub trait CustodialProvider: Send + Sync {
    /// Create a wallet. Repeating the call with the same key returns the same
    /// wallet instead of creating another.
    async fn create_wallet(
        &self,
        request: CreateWalletRequest,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Wallet, ProviderError>;
}

#[async_trait::async_trait]
impl<P> CustodialProvider for Arc<P>
where
    P: CustodialProvider + ?Sized,
{
    async fn create_wallet(
        &self,
        request: CreateWalletRequest,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Wallet, ProviderError> {
        (**self).create_wallet(request, idempotency_key).await
    }
}
