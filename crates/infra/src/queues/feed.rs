//! Queue lifecycle events and their multi-subscriber feed.
//!
//! Every binding owns one broadcast channel. Subscribers see events from the
//! moment they subscribe; a subscriber that falls behind loses the oldest
//! events (counted as skipped) and never slows job processing down.

use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use vaultgate_core::JobId;

/// Default buffer per binding before slow subscribers start losing events.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Job lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueEvent {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl QueueEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEvent::Waiting => "waiting",
            QueueEvent::Active => "active",
            QueueEvent::Completed => "completed",
            QueueEvent::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueEvent::Completed | QueueEvent::Failed)
    }
}

impl core::fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of the lifecycle feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEventPayload {
    pub queue_name: String,
    pub event: QueueEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl QueueEventPayload {
    pub fn new(queue_name: impl Into<String>, event: QueueEvent) -> Self {
        Self {
            queue_name: queue_name.into(),
            event,
            job_id: None,
            data: None,
            attempt: None,
        }
    }

    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Boxed stream of feed records, as consumed by SSE endpoints.
pub type QueueEventStream = Pin<Box<dyn Stream<Item = QueueEventPayload> + Send>>;

/// A subscription to one binding's lifecycle events.
///
/// Dropping it unsubscribes without affecting the binding or other
/// subscribers.
#[derive(Debug)]
pub struct QueueEventFeed {
    queue_name: String,
    receiver: broadcast::Receiver<QueueEventPayload>,
    skipped: u64,
}

impl QueueEventFeed {
    pub(crate) fn new(queue_name: String, receiver: broadcast::Receiver<QueueEventPayload>) -> Self {
        Self {
            queue_name,
            receiver,
            skipped: 0,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Events lost so far because this subscriber lagged.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Wait for the next event. `None` only once the binding is gone.
    pub async fn recv(&mut self) -> Option<QueueEventPayload> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.record_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<QueueEventPayload> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<QueueEventPayload> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn into_stream(self) -> QueueEventStream {
        let queue = self.queue_name;
        Box::pin(BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                debug!(queue = %queue, skipped = n, "queue feed subscriber lagged");
                None
            }
        }))
    }

    fn record_lag(&mut self, n: u64) {
        self.skipped += n;
        debug!(queue = %self.queue_name, skipped = n, "queue feed subscriber lagged");
    }
}
