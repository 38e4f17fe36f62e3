use std::sync::Arc;

use serde_json::{Value as JsonValue, json};
use tokio::runtime::Handle;
use tracing::{info, warn};

use vaultgate_core::IdempotencyKey;
use vaultgate_events::NewOutboxEvent;

use super::{CreateWalletRequest, CustodialProvider, ProviderError};
use crate::outbox::OutboxStore;
use crate::queues::{Job, JobHandler, JobOutcome};

/// Event type appended once a wallet exists.
pub const WALLET_PROVISIONED: &str = "wallet.provisioned";

/// Job handler that provisions a custodial wallet.
///
/// Job data is either a relayed event body (`{ id, eventType, payload, .. }`)
/// or a bare payload. The payload must carry `accountId`. The idempotency key
/// is derived from the originating event, so every retry and every
/// redelivery of the same event asks the provider for the same wallet.
///
/// Runs on queue worker threads, never inside an async task: provider calls
/// block on `runtime`.
pub struct WalletProvisioner {
    provider: Arc<dyn CustodialProvider>,
    outbox: Option<Arc<dyn OutboxStore>>,
    runtime: Handle,
}

impl core::fmt::Debug for WalletProvisioner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WalletProvisioner")
            .field("records_outcome", &self.outbox.is_some())
            .finish_non_exhaustive()
    }
}

impl WalletProvisioner {
    pub fn new(provider: Arc<dyn CustodialProvider>, runtime: Handle) -> Self {
        Self {
            provider,
            outbox: None,
            runtime,
        }
    }

    /// Append a `wallet.provisioned` event for every provisioned wallet.
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// The key the provider sees for `job`.
    pub fn idempotency_key(job: &Job) -> IdempotencyKey {
        let identity = job
            .data
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| job.id.to_string());
        IdempotencyKey::derive(payload_of(job), identity)
    }

    fn request(job: &Job) -> Option<CreateWalletRequest> {
        let payload = payload_of(job);
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(JsonValue::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Some(CreateWalletRequest {
            account_id: field("accountId")?,
            blockchain: field("blockchain"),
            label: field("label"),
        })
    }
}

/// Rejections are final; transient errors retry, honouring `Retry-After`.
fn failure_outcome(error: ProviderError) -> JobOutcome {
    match (error.is_transient(), error.retry_after) {
        (false, _) => JobOutcome::Fatal(error.message),
        (true, Some(delay)) => JobOutcome::RetryAfter(error.message, delay),
        (true, None) => JobOutcome::Failure(error.message),
    }
}

fn payload_of(job: &Job) -> &JsonValue {
    job.data.get("payload").unwrap_or(&job.data)
}

impl JobHandler for WalletProvisioner {
    fn handle(&self, job: &Job) -> JobOutcome {
        let Some(request) = Self::request(job) else {
            return JobOutcome::Fatal("payload.accountId is required".to_string());
        };
        let key = Self::idempotency_key(job);

        let wallet = match self.runtime.block_on(self.provider.create_wallet(request, &key)) {
            Ok(wallet) => wallet,
            Err(e) => {
                warn!(job_id = %job.id, attempt = job.attempt, idempotency_key = %key, status = ?e.status, error = %e, "wallet provisioning failed");
                return failure_outcome(e);
            }
        };

        if let Some(outbox) = &self.outbox {
            let event = NewOutboxEvent::new(
                WALLET_PROVISIONED,
                json!({
                    "accountId": wallet.account_id,
                    "walletId": wallet.id,
                    "address": wallet.address,
                    "idempotencyKey": key.as_str(),
                }),
            )
            .map(|e| e.with_dedupe_key(format!("{WALLET_PROVISIONED}:{key}")));

            let appended = match event {
                Ok(event) => self.runtime.block_on(outbox.append_event(event)).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = appended {
                // The provider already holds the wallet; the retry gets it back.
                warn!(job_id = %job.id, wallet_id = %wallet.id, error = %e, "failed to record provisioned wallet");
                return JobOutcome::Failure(format!("failed to record provisioned wallet: {e}"));
            }
        }

        info!(job_id = %job.id, account_id = %wallet.account_id, wallet_id = %wallet.id, "wallet provisioned");
        JobOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::outbox::InMemoryOutboxStore;
    use crate::queues::{InMemoryJobStore, JobHandlers, JobStatus, QueueBinding, QueueDefinition};
    use crate::provider::InMemoryCustodialProvider;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn relayed_job(event_id: &str, payload: JsonValue) -> Job {
        Job::new(
            "account-tasks",
            "wallet.provision",
            json!({ "id": event_id, "eventType": "wallet.provision", "payload": payload }),
        )
    }

    #[test]
    fn key_prefers_payload_then_event_id_then_job_id() {
        let with_key = relayed_job("evt-1", json!({ "accountId": "a-1", "idempotencyKey": "k-1" }));
        assert_eq!(WalletProvisioner::idempotency_key(&with_key).as_str(), "k-1");

        let with_event = relayed_job("evt-1", json!({ "accountId": "a-1" }));
        assert_eq!(WalletProvisioner::idempotency_key(&with_event).as_str(), "evt-1");

        let bare = Job::new("account-tasks", "wallet.provision", json!({ "accountId": "a-1" }));
        assert_eq!(WalletProvisioner::idempotency_key(&bare).as_str(), bare.id.to_string());
    }

    #[test]
    fn retries_and_redeliveries_create_one_wallet() {
        let rt = runtime();
        let provider = Arc::new(InMemoryCustodialProvider::new());
        let outbox = Arc::new(InMemoryOutboxStore::new());
        let provisioner = WalletProvisioner::new(provider.clone(), rt.handle().clone()).with_outbox(outbox.clone());

        provider.fail_next(1);
        let job = relayed_job("evt-7", json!({ "accountId": "a-7" }));
        let redelivered = relayed_job("evt-7", json!({ "accountId": "a-7" }));

        let outcomes = thread::spawn(move || {
            vec![
                provisioner.handle(&job),
                provisioner.handle(&job),
                provisioner.handle(&redelivered),
            ]
        })
        .join()
        .unwrap();

        assert!(matches!(outcomes[0], JobOutcome::Failure(ref m) if m == "provider temporarily unavailable"));
        assert_eq!(outcomes[1], JobOutcome::Success);
        assert_eq!(outcomes[2], JobOutcome::Success);
        assert_eq!(provider.wallet_count(), 1);

        let pending = rt.block_on(outbox.fetch_pending(10)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type(), WALLET_PROVISIONED);
        assert_eq!(pending[0].payload()["accountId"], "a-7");
    }

    #[test]
    fn missing_account_fails_without_calling_provider() {
        let rt = runtime();
        let provider = Arc::new(InMemoryCustodialProvider::new());
        let provisioner = WalletProvisioner::new(provider.clone(), rt.handle().clone());

        let job = relayed_job("evt-8", json!({}));
        let outcome = thread::spawn(move || provisioner.handle(&job)).join().unwrap();

        assert!(matches!(outcome, JobOutcome::Fatal(_)));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn provider_rejection_is_dead_lettered_at_once() {
        let rt = runtime();
        let provider = Arc::new(InMemoryCustodialProvider::new());
        provider.fail_next_with(
            1,
            ProviderError::from_response(422, r#"{"errors":[{"detail":"blockchain not supported"}]}"#),
        );
        let provisioner = WalletProvisioner::new(provider.clone(), rt.handle().clone());
        let queue = QueueBinding::bind(QueueDefinition::new("account-tasks", "Account Tasks"), InMemoryJobStore::arc())
            .unwrap();
        queue
            .add_job(relayed_job("evt-9", json!({ "accountId": "a-9", "blockchain": "DOGE" })))
            .unwrap();

        let handlers = JobHandlers::new().with("wallet.provision", provisioner);
        let worker_queue = queue.clone();
        let job = thread::spawn(move || worker_queue.process_next(&handlers))
            .join()
            .unwrap()
            .unwrap();

        assert!(matches!(
            job.unwrap().status,
            JobStatus::DeadLettered { ref error, attempts: 1 } if error == "blockchain not supported"
        ));
        assert_eq!(queue.dead_letters(10).unwrap().len(), 1);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn rate_limit_retries_after_the_provider_delay() {
        let rt = runtime();
        let provider = Arc::new(InMemoryCustodialProvider::new());
        provider.fail_next_with(
            1,
            ProviderError::from_response(429, r#"{"message":"slow down"}"#).with_retry_after(Duration::from_secs(7)),
        );
        let provisioner = WalletProvisioner::new(provider, rt.handle().clone());

        let job = relayed_job("evt-10", json!({ "accountId": "a-10" }));
        let outcome = thread::spawn(move || provisioner.handle(&job)).join().unwrap();

        assert_eq!(outcome, JobOutcome::RetryAfter("slow down".to_string(), Duration::from_secs(7)));
    }
}
