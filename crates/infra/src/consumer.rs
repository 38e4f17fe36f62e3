//! Broker queue consumers.
//!
//! A consumer drains one broker queue subscription on a dedicated thread and
//! hands every message to a handler. Delivery is at-least-once, so handlers
//! must tolerate redelivery; [`forward_to_queue`] drops recently seen event
//! ids before enqueueing.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use vaultgate_events::{EventHandlerRegistry, Subscription};

use crate::broker::BrokerMessage;
use crate::queues::{QueueBinding, QueueError};

/// Event ids remembered by [`forward_to_queue`] for redelivery detection.
pub const RECENT_EVENT_IDS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumeError {
    #[error("malformed broker message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Handle to control and join a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Request graceful shutdown and wait for the consumer to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug)]
pub struct BrokerConsumer;

impl BrokerConsumer {
    /// Spawn a consumer thread over `subscription`.
    ///
    /// Handler errors are logged and the message is not retried here; the
    /// outbox already guarantees the event was durably recorded.
    pub fn spawn<H, E>(
        name: impl Into<String>,
        subscription: Subscription<BrokerMessage>,
        mut handler: H,
    ) -> std::io::Result<ConsumerHandle>
    where
        H: FnMut(BrokerMessage) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || consume_loop(&name, subscription, shutdown_rx, &mut handler))?;

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn consume_loop<H, E>(
    name: &str,
    subscription: Subscription<BrokerMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    handler: &mut H,
) where
    H: FnMut(BrokerMessage) -> Result<(), E>,
    E: core::fmt::Display,
{
    let tick = Duration::from_millis(250);
    info!(consumer = name, "broker consumer started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match subscription.recv_timeout(tick) {
            Ok(message) => {
                let event_id = message.event_id().unwrap_or_default().to_string();
                if let Err(err) = handler(message) {
                    warn!(consumer = name, event_id = %event_id, error = %err, "broker consumer handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(consumer = name, "broker consumer stopped");
}

/// Dispatch every consumed message to the in-process handler registry.
pub fn dispatch_to(registry: Arc<EventHandlerRegistry>) -> impl FnMut(BrokerMessage) -> Result<(), ConsumeError> {
    move |message| {
        let event = message
            .to_event()
            .map_err(|e| ConsumeError::Malformed(e.to_string()))?;
        let report = registry.dispatch(&event);
        debug!(event_id = %event.id(), event_type = %event.event_type(), invoked = report.invoked, failed = report.failed, "event dispatched");
        Ok(())
    }
}

/// Enqueue every consumed message on `binding` as a job named after the
/// event type, with the message body as job data.
pub fn forward_to_queue(binding: QueueBinding) -> impl FnMut(BrokerMessage) -> Result<(), ConsumeError> {
    let mut recent = RecentIds::new(RECENT_EVENT_IDS);

    move |message| {
        let event_type = message
            .event_type()
            .ok_or_else(|| ConsumeError::Malformed("missing event-type header".to_string()))?
            .to_string();

        let event_id = message.event_id().map(str::to_string);
        if let Some(id) = &event_id {
            if recent.contains(id) {
                debug!(queue = %binding.name(), event_id = %id, "redelivered event skipped");
                return Ok(());
            }
        }

        // Only a stored job counts as seen, so a redelivery after a failed
        // enqueue gets another chance.
        let job = binding.add(event_type, message.body)?;
        if let Some(id) = event_id {
            recent.insert(&id);
        }
        debug!(queue = %binding.name(), job_id = %job.id, job = %job.name, "event enqueued");
        Ok(())
    }
}

/// Bounded set of the most recently seen ids.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// `false` when `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use serde_json::json;
    use vaultgate_events::{HandlerError, NewOutboxEvent, OutboxEvent};

    use super::*;
    use crate::broker::{Broker, InMemoryBroker};
    use crate::queues::{InMemoryJobStore, QueueDefinition};
    use crate::topology::BrokerTopology;

    fn message(event_type: &str) -> BrokerMessage {
        let topology = BrokerTopology::default_catalogue();
        let route = topology.route_for_event(event_type).unwrap();
        let event = NewOutboxEvent::new(event_type, json!({ "accountId": "a-1" }))
            .unwrap()
            .into_event(vaultgate_core::OutboxEventId::new(), chrono::Utc::now());
        BrokerMessage::from_event(&route, &event)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn forwarding_skips_redelivered_events() {
        let queue = QueueBinding::bind(
            QueueDefinition::new("account-tasks", "Account Tasks"),
            InMemoryJobStore::arc(),
        )
        .unwrap();
        let mut forward = forward_to_queue(queue.clone());

        let msg = message("wallet.provision");
        forward(msg.clone()).unwrap();
        forward(msg).unwrap();
        forward(message("wallet.provision")).unwrap();

        assert_eq!(queue.metadata().unwrap().counts.waiting, 2);
    }

    #[test]
    fn redelivery_after_failed_enqueue_is_forwarded() {
        let store = InMemoryJobStore::arc();
        let queue = QueueBinding::bind(QueueDefinition::new("account-tasks", "Account Tasks"), store.clone()).unwrap();
        let mut forward = forward_to_queue(queue.clone());
        let msg = message("wallet.provision");

        store.set_reachable(false);
        assert!(forward(msg.clone()).is_err());

        store.set_reachable(true);
        forward(msg.clone()).unwrap();
        forward(msg).unwrap();

        assert_eq!(queue.metadata().unwrap().counts.waiting, 1);
    }

    #[test]
    fn forwarding_rejects_messages_without_event_type() {
        let queue = QueueBinding::bind(
            QueueDefinition::new("account-tasks", "Account Tasks"),
            InMemoryJobStore::arc(),
        )
        .unwrap();
        let mut msg = message("account.created");
        msg.headers.clear();

        let err = forward_to_queue(queue)(msg).unwrap_err();
        assert!(matches!(err, ConsumeError::Malformed(_)));
    }

    #[test]
    fn recent_ids_forget_the_oldest() {
        let mut recent = RecentIds::new(2);
        assert!(recent.insert("a"));
        assert!(recent.insert("b"));
        assert!(!recent.insert("a"));
        assert!(recent.insert("c"));
        assert!(recent.insert("a"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn consumer_dispatches_broker_messages_to_registry() {
        let topology = BrokerTopology::default_catalogue();
        let broker = InMemoryBroker::from_topology(&topology);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let registry = EventHandlerRegistry::builder()
            .on("account.created", move |event: &OutboxEvent| -> Result<(), HandlerError> {
                assert_eq!(event.payload()["accountId"], "a-1");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();

        let handle = BrokerConsumer::spawn(
            "account-events",
            broker.consume("account-events.queue").unwrap(),
            dispatch_to(registry),
        )
        .unwrap();

        broker.publish(message("account.created")).await.unwrap();
        wait_until(|| seen.load(Ordering::SeqCst) == 1);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        handle.shutdown();
    }
}
