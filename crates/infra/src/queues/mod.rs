//! Named background task queues with observable lifecycle events.
//!
//! ## Components
//!
//! - `QueueDefinition`: stable name plus a display label
//! - `QueueBinding`: a definition bound to a `JobStore` and a broadcast feed
//!   of `QueueEventPayload` (`waiting -> active -> completed | failed`)
//! - `QueueWorker`: background thread polling a binding
//! - `QueueRegistry`: the process-wide catalogue of bindings
//!
//! Jobs carry a `RetryPolicy`; failed jobs are rescheduled with backoff and
//! dead-lettered once the policy is exhausted.

pub mod binding;
pub mod feed;
pub mod handlers;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

use thiserror::Error;

use crate::error::ConfigurationError;

pub use binding::{QueueBinding, QueueDefinition, QueueMetadata};
pub use feed::{QueueEvent, QueueEventFeed, QueueEventPayload, QueueEventStream};
pub use handlers::{JobHandler, JobHandlers};
pub use registry::QueueRegistry;
pub use store::{InMemoryJobStore, JobCounts, JobStore, JobStoreError};
pub use types::{AttemptRecord, BackoffStrategy, DeadLetterEntry, Job, JobOutcome, JobStatus, RetryPolicy};
pub use worker::{QueueWorker, QueueWorkerConfig, QueueWorkerHandle, QueueWorkerStats};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The backing job store is unreachable.
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for QueueError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Unavailable(msg) => QueueError::Connection(msg),
            JobStoreError::NotFound(id) => QueueError::NotFound(format!("job {id}")),
            other => QueueError::Storage(other.to_string()),
        }
    }
}
