//! HTTP adapter for a custodial wallet provider.

use std::time::Duration;

use tracing::{debug, warn};

use vaultgate_core::IdempotencyKey;

use super::{CreateWalletRequest, CustodialProvider, ProviderError, Wallet};

/// Header carrying the idempotency key on provider requests.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Calls `POST {base_url}/wallets` with the idempotency key as a header.
#[derive(Debug, Clone)]
pub struct HttpCustodialProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpCustodialProvider {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_timeout(base_url, Duration::from_secs(10))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::new(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait::async_trait]
impl CustodialProvider for HttpCustodialProvider {
    async fn create_wallet(
        &self,
        request: CreateWalletRequest,
        idempotency_key: &IdempotencyKey,
    ) -> Result<Wallet, ProviderError> {
        let url = format!("{}/wallets", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key.as_str())
            .json(&request);

        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "custodial provider unreachable");
            ProviderError::new(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            let mut err = ProviderError::from_response(status.as_u16(), &body);
            if let Some(delay) = retry_after {
                err = err.with_retry_after(delay);
            }
            warn!(status = status.as_u16(), error = %err, "custodial provider rejected request");
            return Err(err);
        }

        let wallet: Wallet = resp
            .json()
            .await
            .map_err(|e| ProviderError::new(format!("unexpected provider response: {e}")))?;
        debug!(wallet_id = %wallet.id, account_id = %wallet.account_id, "wallet created");
        Ok(wallet)
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        serve_once_with(status, "", body).await
    }

    async fn serve_once_with(
        status: &'static str,
        headers: &'static str,
        body: &'static str,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut request = Vec::new();
            // Headers plus a small JSON body arrive well within a few reads.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if n == 0 || (text.contains("\r\n\r\n") && text.trim_end().ends_with('}')) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\n{headers}content-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (format!("http://{addr}"), rx)
    }

    #[tokio::test]
    async fn sends_idempotency_key_and_parses_wallet() {
        let (url, request) = serve_once(
            "201 Created",
            r#"{"id":"w-1","accountId":"a-1","address":"0xabc","createdAt":"2024-01-01T00:00:00Z"}"#,
        )
        .await;

        let provider = HttpCustodialProvider::new(url).unwrap().with_api_key("secret");
        let key = IdempotencyKey::parse("wallet-a-1").unwrap();
        let wallet = provider.create_wallet(CreateWalletRequest::new("a-1"), &key).await.unwrap();

        assert_eq!(wallet.id, "w-1");
        let request = request.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /wallets"));
        assert!(request.contains("idempotency-key: wallet-a-1"));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn error_envelope_is_normalized() {
        let (url, _request) = serve_once(
            "422 Unprocessable Entity",
            r#"{"errors":[{"detail":"blockchain not supported"}]}"#,
        )
        .await;

        let provider = HttpCustodialProvider::new(url).unwrap();
        let err = provider
            .create_wallet(CreateWalletRequest::new("a-1"), &IdempotencyKey::generate())
            .await
            .unwrap_err();

        assert_eq!(err.message, "blockchain not supported");
        assert_eq!(err.status, Some(422));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let (url, _request) = serve_once_with(
            "429 Too Many Requests",
            "retry-after: 7\r\n",
            r#"{"message":"slow down"}"#,
        )
        .await;

        let provider = HttpCustodialProvider::new(url).unwrap();
        let err = provider
            .create_wallet(CreateWalletRequest::new("a-1"), &IdempotencyKey::generate())
            .await
            .unwrap_err();

        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_provider_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = HttpCustodialProvider::with_timeout(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
        let err = provider
            .create_wallet(CreateWalletRequest::new("a-1"), &IdempotencyKey::generate())
            .await
            .unwrap_err();

        assert!(err.status.is_none());
        assert!(err.is_transient());
    }
}
