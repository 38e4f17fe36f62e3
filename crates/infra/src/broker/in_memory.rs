//! In-memory broker for tests/dev.
//!
//! Each catalogue queue is an [`InMemoryEventBus`]; publishing to an
//! exchange/routing-key pair fans the message out to every subscriber of the
//! bound queue. The broker can be switched offline or slowed down to exercise
//! the relay's failure handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use vaultgate_events::{EventBus, InMemoryEventBus, Subscription};

use super::{Broker, BrokerError, BrokerMessage};
use crate::topology::BrokerTopology;

#[derive(Debug)]
pub struct InMemoryBroker {
    /// (exchange, routing key) -> bound queues
    bindings: HashMap<(String, String), Vec<String>>,
    queues: HashMap<String, InMemoryEventBus<BrokerMessage>>,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
    published: AtomicU64,
}

impl InMemoryBroker {
    /// Declare every queue and binding of `topology`.
    pub fn from_topology(topology: &BrokerTopology) -> Self {
        let mut bindings: HashMap<(String, String), Vec<String>> = HashMap::new();
        let mut queues = HashMap::new();

        for route in topology.routes() {
            queues
                .entry(route.queue.clone())
                .or_insert_with(InMemoryEventBus::new);
            bindings
                .entry((route.exchange, route.routing_key))
                .or_default()
                .push(route.queue);
        }

        Self {
            bindings,
            queues,
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to a queue. Each subscriber receives its own copy.
    pub fn consume(&self, queue: &str) -> Result<Subscription<BrokerMessage>, BrokerError> {
        self.queues
            .get(queue)
            .map(|bus| bus.subscribe())
            .ok_or_else(|| BrokerError::Configuration(format!("queue '{queue}' is not declared")))
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Delay every acknowledgment by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Messages acknowledged so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.is_online() {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }

        let key = (message.exchange.clone(), message.routing_key.clone());
        let queues = self.bindings.get(&key).ok_or_else(|| {
            BrokerError::Nack(format!(
                "no queue bound to '{}' on exchange '{}'",
                message.routing_key, message.exchange
            ))
        })?;

        for queue in queues {
            if let Some(bus) = self.queues.get(queue) {
                bus.publish(message.clone())
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
                debug!(queue = %queue, routing_key = %message.routing_key, "message delivered");
            }
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
