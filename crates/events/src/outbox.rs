//! Outbox event model.
//!
//! An `OutboxEvent` is written in the same unit of work as the domain mutation
//! it reports and is relayed to the broker afterwards. It is immutable except
//! for the single `published_at` transition performed by the relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use vaultgate_core::{CoreError, CoreResult, IdempotencyKey, OutboxEventId};

/// An event ready to be appended to the outbox (not yet assigned an id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    event_type: String,
    payload: JsonValue,
    dedupe_key: Option<String>,
}

impl NewOutboxEvent {
    /// Validate and build a pending event.
    ///
    /// The event type must be non-blank and the payload must be a JSON object
    /// (`null` is accepted and normalized to `{}`).
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> CoreResult<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(CoreError::validation("event type must not be blank"));
        }

        let payload = match payload {
            JsonValue::Null => JsonValue::Object(Map::new()),
            JsonValue::Object(map) => JsonValue::Object(map),
            other => {
                return Err(CoreError::validation(format!(
                    "payload for '{event_type}' must be a JSON object, got {}",
                    json_kind(&other)
                )));
            }
        };

        Ok(Self {
            event_type,
            payload,
            dedupe_key: None,
        })
    }

    /// Attach a deduplication key tying this event to one logical mutation.
    ///
    /// Appending twice with the same key yields the row created first.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        let trimmed = key.trim();
        self.dedupe_key = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn dedupe_key(&self) -> Option<&str> {
        self.dedupe_key.as_deref()
    }

    /// Assign identity and audit timestamps.
    pub fn into_event(self, id: OutboxEventId, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id,
            event_type: self.event_type,
            payload: self.payload,
            dedupe_key: self.dedupe_key,
            published_at: None,
            created_at,
            updated_at: created_at,
        }
    }
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    id: OutboxEventId,
    event_type: String,
    payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dedupe_key: Option<String>,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Rebuild an event from persisted columns.
    pub fn restore(
        id: OutboxEventId,
        event_type: String,
        payload: JsonValue,
        dedupe_key: Option<String>,
        published_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            payload,
            dedupe_key,
            published_at,
            created_at,
            updated_at,
        }
    }

    pub fn id(&self) -> OutboxEventId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn dedupe_key(&self) -> Option<&str> {
        self.dedupe_key.as_deref()
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }

    /// Key that downstream provider calls use for this event.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(&self.payload, self.id)
    }

    /// Record the relay's successful publication.
    ///
    /// Returns `false` (and changes nothing) when the event was already
    /// published: the watermark moves from `None` exactly once.
    pub fn record_published(&mut self, at: DateTime<Utc>) -> bool {
        if self.published_at.is_some() {
            return false;
        }
        self.published_at = Some(at);
        self.updated_at = at;
        true
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
