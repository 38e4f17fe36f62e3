//! Outbox persistence.
//!
//! Domain operations append an [`OutboxEvent`] in the same unit of work as
//! their state change; the relay later drains pending rows to the broker and
//! moves each row's `published_at` watermark exactly once.
//!
//! ## Guarantees
//!
//! - `fetch_pending` never returns published rows and never reserves rows:
//!   concurrent relays may read the same batch.
//! - `mark_published` only succeeds against a row that is still pending, so
//!   racing relays produce at most one transition and neither fails.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use vaultgate_core::{CoreError, OutboxEventId};
use vaultgate_events::{NewOutboxEvent, OutboxEvent};

pub use in_memory::{InMemoryOutboxStore, OutboxTransaction};
pub use postgres::PostgresOutboxStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutboxError {
    /// The unit of work could not commit; fatal to the triggering request.
    #[error("outbox persistence failed: {0}")]
    Persistence(String),

    /// No such row. Benign for relays.
    #[error("outbox event not found: {0}")]
    NotFound(OutboxEventId),

    /// Rejected before touching storage.
    #[error("invalid outbox event: {0}")]
    Validation(String),
}

impl From<CoreError> for OutboxError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Position in the pending order: rows strictly after this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingCursor {
    pub created_at: DateTime<Utc>,
    pub id: OutboxEventId,
}

impl From<&OutboxEvent> for PendingCursor {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            created_at: event.created_at(),
            id: event.id(),
        }
    }
}

/// Result of [`OutboxStore::mark_published`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call moved the watermark.
    Marked,
    /// Another relay (or an earlier cycle) got there first. No-op.
    AlreadyPublished,
}

#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a pending row.
    ///
    /// When the event carries a dedupe key that already exists, the existing
    /// row is returned and nothing is inserted.
    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxError>;

    /// Validate and insert a pending row for `event_type`.
    async fn append(&self, event_type: &str, payload: JsonValue) -> Result<OutboxEvent, OutboxError> {
        let event = NewOutboxEvent::new(event_type, payload)?;
        self.append_event(event).await
    }

    /// Pending rows, oldest first (ties broken by id), at most `limit`.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.fetch_pending_after(None, limit).await
    }

    /// As [`fetch_pending`](Self::fetch_pending), starting after `cursor`.
    async fn fetch_pending_after(
        &self,
        cursor: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Move the `published_at` watermark of a pending row.
    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, OutboxError>;

    /// Number of rows still awaiting relay.
    async fn pending_count(&self) -> Result<u64, OutboxError>;
}

#[async_trait::async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxError> {
        (**self).append_event(event).await
    }

    async fn append(&self, event_type: &str, payload: JsonValue) -> Result<OutboxEvent, OutboxError> {
        (**self).append(event_type, payload).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        (**self).fetch_pending(limit).await
    }

    async fn fetch_pending_after(
        &self,
        cursor: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        (**self).fetch_pending_after(cursor, limit).await
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, OutboxError> {
        (**self).mark_published(id, at).await
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        (**self).pending_count().await
    }
}
