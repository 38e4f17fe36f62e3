//! Infrastructure wiring: outbox store, broker, relay, task queues and workers.
//!
//! Every backend falls back to its in-memory variant when its URL is unset,
//! so `cargo run` works without Postgres, Redis or a provider account.

use std::sync::Arc;

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use vaultgate_events::{EventHandlerRegistry, HandlerError, OutboxEvent};
use vaultgate_infra::broker::{Broker, InMemoryBroker};
use vaultgate_infra::consumer::{BrokerConsumer, ConsumerHandle, dispatch_to, forward_to_queue};
use vaultgate_infra::dashboard::DashboardFeed;
use vaultgate_infra::outbox::{InMemoryOutboxStore, OutboxStore, PostgresOutboxStore};
use vaultgate_infra::provider::{
    CustodialProvider, HttpCustodialProvider, InMemoryCustodialProvider, WALLET_PROVISIONED, WalletProvisioner,
};
use vaultgate_infra::queues::{
    InMemoryJobStore, Job, JobHandlers, JobOutcome, QueueDefinition, QueueRegistry, QueueWorker, QueueWorkerHandle,
};
use vaultgate_infra::{AppConfig, BrokerTopology, Relay, RelayHandle, RelayMonitor};

/// Broker queue whose events become jobs on [`ACCOUNT_TASKS`].
const WALLET_PROVISIONER_QUEUE: &str = "wallet-provisioner.queue";
const ACCOUNT_TASKS: &str = "account-tasks";

/// Broker queues handled in-process by the event handler registry.
const DISPATCHED_QUEUES: [&str; 3] = ["account-events.queue", "kyc-events.queue", "point-minter.queue"];

/// What HTTP handlers see.
#[derive(Clone)]
pub struct AppState {
    pub outbox: Arc<dyn OutboxStore>,
    pub dashboard: DashboardFeed,
    pub relay: RelayMonitor,
    pub dev_mode: bool,
}

/// Running background services. Dropping this stops them without waiting;
/// prefer [`Services::shutdown`].
pub struct Services {
    state: AppState,
    queues: QueueRegistry,
    relay: RelayHandle,
    workers: Vec<QueueWorkerHandle>,
    consumers: Vec<ConsumerHandle>,
}

impl Services {
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.state.outbox
    }

    /// Wake the relay, e.g. right after committing outbox rows.
    pub fn trigger_relay(&self) {
        self.relay.trigger();
    }

    /// Stop the relay first so no new messages reach consumers, then join
    /// consumer and worker threads.
    pub async fn shutdown(self) {
        self.relay.shutdown().await;

        let (consumers, workers) = (self.consumers, self.workers);
        let joined = tokio::task::spawn_blocking(move || {
            for consumer in consumers {
                consumer.shutdown();
            }
            for worker in workers {
                worker.shutdown();
            }
        })
        .await;
        if let Err(e) = joined {
            error!(error = %e, "failed to join background workers");
        }
        info!("background services stopped");
    }
}

/// Build every backend from `config` and start the relay, queue workers and
/// broker consumers. Must be called inside a multi-threaded runtime: wallet
/// provisioning blocks worker threads on it.
pub async fn start(config: &AppConfig) -> anyhow::Result<Services> {
    let topology = BrokerTopology::default_catalogue();
    let outbox = build_outbox(config).await?;
    let provider = build_provider(config)?;

    let queues = QueueRegistry::bind_all(QueueDefinition::default_catalogue(), InMemoryJobStore::arc())
        .context("failed to bind task queues")?;

    let handlers = Arc::new(job_handlers(provider, outbox.clone()));
    let mut workers = Vec::with_capacity(queues.len());
    for binding in queues.bindings() {
        let worker_config = config.worker.clone().with_name(format!("{}-worker", binding.name()));
        let worker = QueueWorker::spawn(binding.clone(), handlers.clone(), worker_config)
            .with_context(|| format!("failed to spawn worker for '{}'", binding.name()))?;
        workers.push(worker);
    }

    let (broker, consumers): (Arc<dyn Broker>, Vec<ConsumerHandle>) = match redis_broker(config, &topology)? {
        Some(broker) => (broker, Vec::new()),
        None => {
            let broker = Arc::new(InMemoryBroker::from_topology(&topology));
            let consumers = spawn_consumers(&broker, &queues)?;
            (broker, consumers)
        }
    };

    let relay = Relay::new(outbox.clone(), broker, topology, config.relay.clone())
        .context("invalid relay configuration")?
        .spawn();

    info!(
        dev_mode = config.is_dev_mode(),
        queues = queues.len(),
        consumers = consumers.len(),
        "background services started"
    );

    Ok(Services {
        state: AppState {
            outbox,
            dashboard: DashboardFeed::new(&queues),
            relay: relay.monitor(),
            dev_mode: config.is_dev_mode(),
        },
        queues,
        relay,
        workers,
        consumers,
    })
}

async fn build_outbox(config: &AppConfig) -> anyhow::Result<Arc<dyn OutboxStore>> {
    let Some(url) = &config.database_url else {
        warn!("DATABASE_URL not set; using in-memory outbox (dev mode)");
        return Ok(Arc::new(InMemoryOutboxStore::new()));
    };

    let store = PostgresOutboxStore::connect(url)
        .await
        .context("failed to connect to DATABASE_URL")?;
    store.ensure_schema().await.context("failed to prepare outbox schema")?;
    info!("using Postgres outbox store");
    Ok(Arc::new(store))
}

fn build_provider(config: &AppConfig) -> anyhow::Result<Arc<dyn CustodialProvider>> {
    let Some(url) = &config.provider_url else {
        warn!("PROVIDER_URL not set; using in-memory custodial provider");
        return Ok(Arc::new(InMemoryCustodialProvider::new()));
    };

    let mut provider = HttpCustodialProvider::new(url.clone()).context("failed to build provider client")?;
    if let Some(api_key) = &config.provider_api_key {
        provider = provider.with_api_key(api_key.clone());
    }
    Ok(Arc::new(provider))
}

#[cfg(feature = "redis")]
fn redis_broker(config: &AppConfig, topology: &BrokerTopology) -> anyhow::Result<Option<Arc<dyn Broker>>> {
    let Some(url) = &config.redis_url else {
        return Ok(None);
    };

    let broker = vaultgate_infra::broker::RedisStreamsBroker::new(url, topology).context("invalid REDIS_URL")?;
    info!("relaying to Redis Streams; consumers read the streams out of process");
    Ok(Some(Arc::new(broker)))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(config: &AppConfig, _topology: &BrokerTopology) -> anyhow::Result<Option<Arc<dyn Broker>>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but redis feature not enabled, falling back to in-memory broker");
    }
    Ok(None)
}

fn job_handlers(provider: Arc<dyn CustodialProvider>, outbox: Arc<dyn OutboxStore>) -> JobHandlers {
    let provisioner = WalletProvisioner::new(provider, Handle::current()).with_outbox(outbox);

    JobHandlers::new()
        .with("wallet.provision", provisioner)
        .with(WALLET_PROVISIONED, |job: &Job| {
            info!(job_id = %job.id, "provisioned wallet acknowledged");
            JobOutcome::Success
        })
}

fn spawn_consumers(broker: &InMemoryBroker, queues: &QueueRegistry) -> anyhow::Result<Vec<ConsumerHandle>> {
    let account_tasks = queues.get(ACCOUNT_TASKS)?.clone();
    let mut consumers = vec![BrokerConsumer::spawn(
        "wallet-provisioner",
        broker.consume(WALLET_PROVISIONER_QUEUE)?,
        forward_to_queue(account_tasks),
    )?];

    let registry = event_handlers();
    for queue in DISPATCHED_QUEUES {
        let name = queue.trim_end_matches(".queue");
        consumers.push(BrokerConsumer::spawn(name, broker.consume(queue)?, dispatch_to(registry.clone()))?);
    }
    Ok(consumers)
}

/// In-process reactions to relayed domain events.
fn event_handlers() -> Arc<EventHandlerRegistry> {
    EventHandlerRegistry::builder()
        .on("account.created", log_event)
        .on("kyc.status_changed", log_event)
        .on("points.mint", log_event)
        .build()
}

fn log_event(event: &OutboxEvent) -> Result<(), HandlerError> {
    info!(event_id = %event.id(), event_type = %event.event_type(), "domain event received");
    Ok(())
}
