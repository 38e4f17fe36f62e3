//! Broker publish/consume primitives over the static topology.
//!
//! The core bus abstraction lives in `vaultgate-events` as pure mechanics.
//! This module provides the broker-facing message format and its
//! implementations (in-memory, and Redis Streams behind the `redis` feature).

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use vaultgate_core::OutboxEventId;
use vaultgate_events::OutboxEvent;

use crate::topology::Route;

pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

/// Header carrying the outbox event id, for consumer-side dedupe.
pub const EVENT_ID_HEADER: &str = "event-id";
/// Header carrying the event-type tag.
pub const EVENT_TYPE_HEADER: &str = "event-type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker did not acknowledge within {0:?}")]
    Timeout(std::time::Duration),

    #[error("broker rejected message: {0}")]
    Nack(String),

    #[error("broker misconfigured: {0}")]
    Configuration(String),
}

impl BrokerError {
    /// Worth retrying on a later cycle.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BrokerError::Configuration(_))
    }
}

/// A message addressed to an exchange with a routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub headers: BTreeMap<String, String>,
    pub body: JsonValue,
}

/// Wire body of a relayed outbox event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventBody {
    id: OutboxEventId,
    event_type: String,
    #[serde(default)]
    payload: JsonValue,
    created_at: DateTime<Utc>,
}

impl BrokerMessage {
    /// Address `event` along `route`.
    ///
    /// The body is `{ id, eventType, payload, createdAt }`; the id and type are
    /// repeated as headers so consumers can dedupe without parsing the body.
    pub fn from_event(route: &Route, event: &OutboxEvent) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("id".to_string(), JsonValue::String(event.id().to_string()));
        body.insert("eventType".to_string(), JsonValue::String(event.event_type().to_string()));
        body.insert("payload".to_string(), event.payload().clone());
        body.insert(
            "createdAt".to_string(),
            JsonValue::String(event.created_at().to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );

        let mut headers = BTreeMap::new();
        headers.insert(EVENT_ID_HEADER.to_string(), event.id().to_string());
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type().to_string());

        Self {
            exchange: route.exchange.clone(),
            routing_key: route.routing_key.clone(),
            headers,
            body: JsonValue::Object(body),
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        self.headers.get(EVENT_ID_HEADER).map(String::as_str)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.headers.get(EVENT_TYPE_HEADER).map(String::as_str)
    }

    /// Rebuild the pending event carried by this message.
    pub fn to_event(&self) -> Result<OutboxEvent, serde_json::Error> {
        let body: EventBody = serde_json::from_value(self.body.clone())?;
        Ok(OutboxEvent::restore(
            body.id,
            body.event_type,
            body.payload,
            None,
            None,
            body.created_at,
            body.created_at,
        ))
    }
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Publish and wait for the broker's acknowledgment.
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError>;
}

#[async_trait::async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        (**self).publish(message).await
    }
}
