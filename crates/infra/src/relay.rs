//! Outbox relay: drains pending outbox rows to the broker.
//!
//! Each cycle fetches a bounded batch, resolves every event's route from its
//! event type, publishes with an explicit timeout and marks the row published
//! only after the broker acknowledged it. Nothing is ever dropped:
//!
//! - a broker failure (unreachable, NACK, timeout) ends the cycle and leaves
//!   the row and the rest of the batch pending; the next cycle is delayed by
//!   the backoff policy until a cycle succeeds again
//! - an event type with no declared route, or a row the broker permanently
//!   rejects, is logged and left pending; the cycle pages past it so newer
//!   rows keep flowing
//!
//! Delivery is at-least-once. A crash between publish and mark republishes
//! the row; consumers dedupe on the `event-id` header.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vaultgate_events::OutboxEvent;

use crate::broker::{Broker, BrokerError, BrokerMessage};
use crate::error::ConfigurationError;
use crate::outbox::{MarkOutcome, OutboxError, OutboxStore, PendingCursor};
use crate::queues::RetryPolicy;
use crate::topology::BrokerTopology;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Rows fetched per cycle
    pub batch_size: usize,
    /// Wait between cycles when the outbox is drained
    pub poll_interval: Duration,
    /// Upper bound on one broker acknowledgment
    pub publish_timeout: Duration,
    /// Delay schedule after consecutive broker failures
    pub backoff: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_millis(5000),
            backoff: RetryPolicy::exponential(u32::MAX, Duration::from_millis(500), Duration::from_secs(30)),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCycleReport {
    pub fetched: usize,
    pub published: usize,
    /// Acknowledged, but another relay had already moved the watermark.
    pub already_published: usize,
    pub failed: usize,
    pub unroutable: usize,
}

impl RelayCycleReport {
    fn delivered(&self) -> usize {
        self.published + self.already_published
    }
}

/// Running totals of a spawned relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub cycles: u64,
    pub published: u64,
    pub already_published: u64,
    pub failed: u64,
    pub unroutable: u64,
    pub consecutive_failures: u32,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl RelayStats {
    fn record(&mut self, report: &RelayCycleReport) {
        self.cycles += 1;
        self.published += report.published as u64;
        self.already_published += report.already_published as u64;
        self.failed += report.failed as u64;
        self.unroutable += report.unroutable as u64;
        self.last_cycle_at = Some(Utc::now());
    }
}

struct Cycle {
    report: RelayCycleReport,
    broker_error: Option<BrokerError>,
}

pub struct Relay<S, B> {
    store: S,
    broker: B,
    topology: BrokerTopology,
    config: RelayConfig,
}

impl<S, B> core::fmt::Debug for Relay<S, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Relay").field("config", &self.config).finish_non_exhaustive()
    }
}

impl<S, B> Relay<S, B>
where
    S: OutboxStore + 'static,
    B: Broker + 'static,
{
    /// Fails when the catalogue does not validate or the batch size is zero.
    pub fn new(
        store: S,
        broker: B,
        topology: BrokerTopology,
        config: RelayConfig,
    ) -> Result<Self, ConfigurationError> {
        topology.validate()?;
        if config.batch_size == 0 {
            return Err(ConfigurationError::invalid_setting("relay batch size", "must be at least 1"));
        }
        if config.publish_timeout.is_zero() {
            return Err(ConfigurationError::invalid_setting("relay publish timeout", "must be positive"));
        }

        Ok(Self {
            store,
            broker,
            topology,
            config,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run a single relay cycle.
    ///
    /// Only a failure to read the outbox is an error; per-event problems are
    /// counted in the report.
    pub async fn run_once(&self) -> Result<RelayCycleReport, OutboxError> {
        self.cycle().await.map(|c| c.report)
    }

    async fn cycle(&self) -> Result<Cycle, OutboxError> {
        let mut report = RelayCycleReport::default();
        let mut cursor: Option<PendingCursor> = None;

        // Rows that cannot be delivered are paged past, so they never hold
        // back newer rows. A cycle ends once a batch was delivered or no
        // pending rows remain after the cursor.
        loop {
            let wanted = self.config.batch_size - report.delivered();
            let page = self.store.fetch_pending_after(cursor, wanted).await?;
            report.fetched += page.len();

            for event in &page {
                if let Some(e) = self.relay_event(event, &mut report).await {
                    return Ok(Cycle {
                        report,
                        broker_error: Some(e),
                    });
                }
            }

            if page.len() < wanted || report.delivered() >= self.config.batch_size {
                break;
            }
            cursor = page.last().map(PendingCursor::from);
        }

        if report.fetched > 0 {
            debug!(
                fetched = report.fetched,
                published = report.published,
                already_published = report.already_published,
                failed = report.failed,
                unroutable = report.unroutable,
                "relay cycle complete"
            );
        }

        Ok(Cycle {
            report,
            broker_error: None,
        })
    }

    /// Route, publish and mark one row. Returns the broker error that should
    /// end the cycle, if any.
    async fn relay_event(&self, event: &OutboxEvent, report: &mut RelayCycleReport) -> Option<BrokerError> {
        let route = match self.topology.route_for_event(event.event_type()) {
            Ok(route) => route,
            Err(e) => {
                warn!(event_id = %event.id(), event_type = %event.event_type(), error = %e, "unroutable outbox event left pending");
                report.unroutable += 1;
                return None;
            }
        };

        if let Err(e) = self.publish(BrokerMessage::from_event(&route, event)).await {
            report.failed += 1;
            if e.is_transient() {
                warn!(event_id = %event.id(), event_type = %event.event_type(), error = %e, "broker publish failed, ending cycle");
                return Some(e);
            }
            error!(event_id = %event.id(), event_type = %event.event_type(), error = %e, "broker rejected event");
            return None;
        }

        self.mark(event, report).await;
        None
    }

    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        match tokio::time::timeout(self.config.publish_timeout, self.broker.publish(message)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.config.publish_timeout)),
        }
    }

    async fn mark(&self, event: &OutboxEvent, report: &mut RelayCycleReport) {
        match self.store.mark_published(event.id(), Utc::now()).await {
            Ok(MarkOutcome::Marked) => {
                report.published += 1;
                debug!(event_id = %event.id(), event_type = %event.event_type(), "outbox event published");
            }
            Ok(MarkOutcome::AlreadyPublished) => report.already_published += 1,
            Err(e) => {
                // Published but not marked: the next cycle republishes it.
                report.failed += 1;
                warn!(event_id = %event.id(), error = %e, "failed to mark outbox event published");
            }
        }
    }

    /// Run cycles in the background until [`RelayHandle::shutdown`] is called
    /// or the handle is dropped.
    pub fn spawn(self) -> RelayHandle {
        let trigger = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(relay_loop(self, trigger.clone(), stats.clone(), shutdown_rx));

        RelayHandle {
            trigger,
            stats,
            shutdown: shutdown_tx,
            join,
        }
    }

    fn next_wait(&self, cycle: &Cycle, consecutive_failures: u32) -> Duration {
        if cycle.broker_error.is_some() {
            self.config.backoff.delay_for_attempt(consecutive_failures)
        } else if cycle.report.delivered() >= self.config.batch_size {
            // More rows are probably waiting.
            Duration::ZERO
        } else {
            self.config.poll_interval
        }
    }
}

async fn relay_loop<S, B>(
    relay: Relay<S, B>,
    trigger: Arc<Notify>,
    stats: Arc<Mutex<RelayStats>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: OutboxStore + 'static,
    B: Broker + 'static,
{
    info!(
        batch_size = relay.config.batch_size,
        poll_interval_ms = relay.config.poll_interval.as_millis() as u64,
        "outbox relay started"
    );
    let mut consecutive_failures = 0u32;

    loop {
        let wait = match relay.cycle().await {
            Ok(cycle) => {
                if cycle.broker_error.is_some() {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                } else {
                    if consecutive_failures > 0 {
                        info!(after_failures = consecutive_failures, "broker reachable again");
                    }
                    consecutive_failures = 0;
                }

                {
                    let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                    s.record(&cycle.report);
                    s.consecutive_failures = consecutive_failures;
                }

                relay.next_wait(&cycle, consecutive_failures)
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                error!(error = %e, failures = consecutive_failures, "failed to read outbox");
                stats.lock().unwrap_or_else(PoisonError::into_inner).consecutive_failures = consecutive_failures;
                relay.config.backoff.delay_for_attempt(consecutive_failures)
            }
        };

        if *shutdown.borrow() {
            break;
        }
        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = trigger.notified() => debug!("relay triggered"),
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("outbox relay stopped");
}

/// Control handle of a spawned relay.
#[derive(Debug)]
pub struct RelayHandle {
    trigger: Arc<Notify>,
    stats: Arc<Mutex<RelayStats>>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Start the next cycle now. Triggers arriving during a cycle coalesce
    /// into one follow-up cycle.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// A cloneable view for readers that must not own the relay.
    pub fn monitor(&self) -> RelayMonitor {
        RelayMonitor {
            trigger: self.trigger.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Stop after the current cycle and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "outbox relay task failed");
        }
    }
}

/// Stats and trigger of a spawned relay, detached from its lifetime.
#[derive(Debug, Clone)]
pub struct RelayMonitor {
    trigger: Arc<Notify>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayMonitor {
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serde_json::json;

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::outbox::InMemoryOutboxStore;

    fn fast_config() -> RelayConfig {
        RelayConfig {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            publish_timeout: Duration::from_millis(200),
            backoff: RetryPolicy::fixed(u32::MAX, Duration::from_millis(10)),
        }
    }

    fn setup() -> (Arc<InMemoryOutboxStore>, Arc<InMemoryBroker>, BrokerTopology) {
        let topology = BrokerTopology::default_catalogue();
        let broker = Arc::new(InMemoryBroker::from_topology(&topology));
        (Arc::new(InMemoryOutboxStore::new()), broker, topology)
    }

    async fn wait_until<F, Fut>(mut done: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn publishes_pending_events_in_order() {
        let (store, broker, topology) = setup();
        let mut consumer = broker.consume("account-events.queue").unwrap();

        let first = store.append("account.created", json!({ "accountId": "a-1" })).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = store.append("account.created", json!({ "accountId": "a-2" })).await.unwrap();

        let relay = Relay::new(store.clone(), broker.clone(), topology, fast_config()).unwrap();
        let report = relay.run_once().await.unwrap();

        assert_eq!(
            report,
            RelayCycleReport {
                fetched: 2,
                published: 2,
                ..Default::default()
            }
        );
        assert_eq!(store.pending_count().await.unwrap(), 0);

        let received: Vec<_> = consumer.drain().into_iter().map(|m| m.event_id().map(str::to_string)).collect();
        assert_eq!(received, vec![Some(first.id().to_string()), Some(second.id().to_string())]);
    }

    #[tokio::test]
    async fn broker_outage_leaves_rows_pending_until_recovery() {
        let (store, broker, topology) = setup();
        store.append("points.mint", json!({ "amount": 10 })).await.unwrap();
        store.append("points.mint", json!({ "amount": 20 })).await.unwrap();

        let relay = Relay::new(store.clone(), broker.clone(), topology, fast_config()).unwrap();

        broker.set_online(false);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 0);
        assert_eq!(store.pending_count().await.unwrap(), 2);

        broker.set_online(true);
        let report = relay.run_once().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_broker_times_out_and_row_stays_pending() {
        let (store, broker, topology) = setup();
        store.append("kyc.status_changed", json!({ "status": "approved" })).await.unwrap();
        broker.set_latency(Some(Duration::from_millis(200)));

        let config = RelayConfig {
            publish_timeout: Duration::from_millis(20),
            ..fast_config()
        };
        let relay = Relay::new(store.clone(), broker.clone(), topology, config).unwrap();

        let report = relay.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unroutable_events_are_skipped_not_dropped() {
        let (store, broker, topology) = setup();
        store.append("ledger.posted", json!({})).await.unwrap();
        store.append("account.created", json!({})).await.unwrap();

        let relay = Relay::new(store.clone(), broker.clone(), topology, fast_config()).unwrap();
        let report = relay.run_once().await.unwrap();

        assert_eq!(report.unroutable, 1);
        assert_eq!(report.published, 1);

        let pending = store.fetch_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type(), "ledger.posted");
    }

    #[tokio::test]
    async fn undeliverable_rows_do_not_hold_back_newer_ones() {
        let (store, broker, topology) = setup();
        store.append("ledger.posted", json!({ "n": 1 })).await.unwrap();
        store.append("ledger.posted", json!({ "n": 2 })).await.unwrap();
        let routable = store.append("account.created", json!({ "accountId": "a-3" })).await.unwrap();

        let config = RelayConfig {
            batch_size: 2,
            ..fast_config()
        };
        let relay = Relay::new(store.clone(), broker.clone(), topology, config).unwrap();
        let report = relay.run_once().await.unwrap();

        assert_eq!(report.unroutable, 2);
        assert_eq!(report.published, 1);
        assert_eq!(report.fetched, 3);
        assert!(store.get(routable.id()).unwrap().unwrap().published_at().is_some());

        let pending: Vec<_> = store
            .fetch_pending(10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(pending, vec!["ledger.posted", "ledger.posted"]);
    }

    #[tokio::test]
    async fn cycle_delivers_at_most_one_batch() {
        let (store, broker, topology) = setup();
        for n in 0..5 {
            store.append("points.mint", json!({ "n": n })).await.unwrap();
        }

        let config = RelayConfig {
            batch_size: 2,
            ..fast_config()
        };
        let relay = Relay::new(store.clone(), broker.clone(), topology, config).unwrap();

        assert_eq!(relay.run_once().await.unwrap().published, 2);
        assert_eq!(store.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn racing_relays_move_each_watermark_once() {
        let (store, broker, topology) = setup();
        for n in 0..5 {
            store.append("wallet.provision", json!({ "n": n })).await.unwrap();
        }

        // Publishing yields, so both relays fetch the same batch.
        broker.set_latency(Some(Duration::from_millis(1)));

        let a = Relay::new(store.clone(), broker.clone(), topology.clone(), fast_config()).unwrap();
        let b = Relay::new(store.clone(), broker.clone(), topology, fast_config()).unwrap();

        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.published + rb.published, 5);
        assert_eq!(ra.already_published + rb.already_published, 5);
        assert_eq!(ra.failed + rb.failed, 0);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected() {
        let (store, broker, _) = setup();
        let broken = BrokerTopology::builder()
            .group("points", "points.exchange.topic", "")
            .routing_key("points", "mint", "points.mint")
            .build();

        assert!(Relay::new(store.clone(), broker.clone(), broken, fast_config()).is_err());

        let zero_batch = RelayConfig {
            batch_size: 0,
            ..fast_config()
        };
        assert!(matches!(
            Relay::new(store, broker, BrokerTopology::default_catalogue(), zero_batch),
            Err(ConfigurationError::InvalidSetting { .. })
        ));
    }

    #[tokio::test]
    async fn spawned_relay_drains_on_trigger_and_shuts_down() {
        let (store, broker, topology) = setup();
        let config = RelayConfig {
            poll_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let handle = Relay::new(store.clone(), broker.clone(), topology, config).unwrap().spawn();

        let (h, s) = (&handle, &store);

        // Let the initial cycle run against the empty outbox.
        wait_until(|| async move { h.stats().cycles >= 1 }).await;

        let monitor = handle.monitor();
        store.append("account.created", json!({ "accountId": "a-9" })).await.unwrap();
        monitor.trigger();
        wait_until(|| async move { s.pending_count().await.unwrap() == 0 }).await;

        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(handle.stats().published, 1);
        handle.shutdown().await;
        // The monitor outlives the relay and keeps its last totals.
        assert_eq!(monitor.stats().published, 1);
    }

    #[tokio::test]
    async fn spawned_relay_backs_off_and_recovers() {
        let (store, broker, topology) = setup();
        store.append("points.mint", json!({ "amount": 1 })).await.unwrap();
        broker.set_online(false);

        let handle = Relay::new(store.clone(), broker.clone(), topology, fast_config()).unwrap().spawn();
        let (h, s) = (&handle, &store);

        wait_until(|| async move { h.stats().consecutive_failures >= 2 }).await;
        assert_eq!(store.pending_count().await.unwrap(), 1);

        broker.set_online(true);
        wait_until(|| async move { s.pending_count().await.unwrap() == 0 }).await;
        assert_eq!(store.pending_count().await.unwrap(), 0);

        wait_until(|| async move { h.stats().consecutive_failures == 0 }).await;
        assert_eq!(handle.stats().consecutive_failures, 0);
        handle.shutdown().await;
    }
}
