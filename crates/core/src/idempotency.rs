//! Idempotency keys for outbound provider calls.
//!
//! A provider recognizes retries of the same logical request by the key
//! attached to it. The key must therefore be decided once per logical
//! operation and reused on every retry; callers own that persistence.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Payload field consulted when deriving a key from an event document.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotencyKey";

/// A non-blank deduplication token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Generate a fresh, globally unique key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a caller-supplied key.
    ///
    /// Returns `None` when the candidate is blank after trimming.
    pub fn parse(candidate: &str) -> Option<Self> {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Derive a key from an event document.
    ///
    /// Uses the document's `idempotencyKey` string field when it is non-blank,
    /// otherwise the stable identity of the event itself. Redeliveries of the
    /// same event always derive the same key.
    pub fn derive(payload: &JsonValue, event_identity: impl core::fmt::Display) -> Self {
        payload
            .get(IDEMPOTENCY_KEY_FIELD)
            .and_then(JsonValue::as_str)
            .and_then(Self::parse)
            .unwrap_or_else(|| Self(event_identity.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Return `candidate` trimmed when it is non-blank, else a freshly generated key.
///
/// Pure: no IO and no shared state.
pub fn ensure_idempotency_key(candidate: Option<&str>) -> IdempotencyKey {
    candidate
        .and_then(IdempotencyKey::parse)
        .unwrap_or_else(IdempotencyKey::generate)
}
