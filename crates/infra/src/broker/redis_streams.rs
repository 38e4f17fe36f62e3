//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `vaultgate:<queue>`, one stream per catalogue queue
//! - **Routing**: the catalogue's (exchange, routing key) bindings decide
//!   which streams a message is appended to
//! - **Entry fields**: `event-id`, `event-type`, `exchange`, `routing-key`, `body`
//!
//! Consumers read with XREADGROUP on the stream of their queue and dedupe on
//! the `event-id` field.

use std::collections::HashMap;

use tracing::instrument;

use super::{Broker, BrokerError, BrokerMessage, EVENT_ID_HEADER, EVENT_TYPE_HEADER};
use crate::topology::BrokerTopology;

/// Default stream key prefix.
const DEFAULT_STREAM_PREFIX: &str = "vaultgate";

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    stream_prefix: String,
    bindings: HashMap<(String, String), Vec<String>>,
}

impl RedisStreamsBroker {
    /// Create a broker for `topology`.
    ///
    /// A malformed URL is a configuration error; connectivity is only checked
    /// on publish.
    pub fn new(redis_url: impl AsRef<str>, topology: &BrokerTopology) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Configuration(format!("invalid redis url: {e}")))?;

        let mut bindings: HashMap<(String, String), Vec<String>> = HashMap::new();
        for route in topology.routes() {
            bindings
                .entry((route.exchange, route.routing_key))
                .or_default()
                .push(route.queue);
        }

        Ok(Self {
            client,
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            bindings,
        })
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    pub fn stream_key(&self, queue: &str) -> String {
        format!("{}:{}", self.stream_prefix, queue)
    }
}

#[async_trait::async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(
        skip(self, message),
        fields(exchange = %message.exchange, routing_key = %message.routing_key),
        err
    )]
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let key = (message.exchange.clone(), message.routing_key.clone());
        let queues = self.bindings.get(&key).ok_or_else(|| {
            BrokerError::Nack(format!(
                "no stream bound to '{}' on exchange '{}'",
                message.routing_key, message.exchange
            ))
        })?;

        let body = serde_json::to_string(&message.body)
            .map_err(|e| BrokerError::Nack(format!("unserializable body: {e}")))?;

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        for queue in queues {
            let _: String = redis::cmd("XADD")
                .arg(self.stream_key(queue))
                .arg("*")
                .arg(EVENT_ID_HEADER)
                .arg(message.event_id().unwrap_or_default())
                .arg(EVENT_TYPE_HEADER)
                .arg(message.event_type().unwrap_or_default())
                .arg("exchange")
                .arg(&message.exchange)
                .arg("routing-key")
                .arg(&message.routing_key)
                .arg("body")
                .arg(&body)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
                        BrokerError::Connection(e.to_string())
                    } else {
                        BrokerError::Nack(format!("XADD failed: {e}"))
                    }
                })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_url_is_a_configuration_error() {
        let err = RedisStreamsBroker::new("not a url", &BrokerTopology::default_catalogue()).unwrap_err();
        assert!(matches!(err, BrokerError::Configuration(_)));
    }

    #[test]
    fn one_stream_per_queue() {
        let broker = RedisStreamsBroker::new("redis://127.0.0.1:6379", &BrokerTopology::default_catalogue())
            .unwrap()
            .with_stream_prefix("test");
        assert_eq!(broker.stream_key("kyc-events.queue"), "test:kyc-events.queue");
    }
}
