//! Binding of one queue definition to its job store and lifecycle feed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::QueueError;
use crate::error::ConfigurationError;
use super::feed::{DEFAULT_FEED_CAPACITY, QueueEvent, QueueEventFeed, QueueEventPayload};
use super::handlers::JobHandlers;
use super::store::{JobCounts, JobStore};
use super::types::{DeadLetterEntry, Job, JobOutcome, JobStatus, RetryPolicy};

/// A named background queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDefinition {
    /// Stable machine identifier, unique across the catalogue.
    pub name: String,
    /// Human label for observability only.
    pub display_name: String,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
        }
    }

    /// The production queues.
    pub fn default_catalogue() -> Vec<QueueDefinition> {
        vec![
            QueueDefinition::new("login-tasks", "Login Tasks"),
            QueueDefinition::new("contract-address-tasks", "Contract Address Tasks"),
            QueueDefinition::new("account-tasks", "Account Tasks"),
        ]
    }
}

/// Queue metadata for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetadata {
    pub name: String,
    pub display_name: String,
    pub counts: JobCounts,
}

/// A live queue: its definition, job store handle and lifecycle feed.
///
/// Cheap to clone; clones share the store and the feed. Every event emitted
/// carries this binding's queue name.
#[derive(Clone)]
pub struct QueueBinding {
    definition: Arc<QueueDefinition>,
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<QueueEventPayload>,
    retry_policy: RetryPolicy,
}

impl core::fmt::Debug for QueueBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueBinding")
            .field("definition", &self.definition)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl QueueBinding {
    /// Attach `definition` to `store`.
    ///
    /// Fails with [`QueueError::Connection`] when the store is unreachable.
    pub fn bind(definition: QueueDefinition, store: Arc<dyn JobStore>) -> Result<Self, QueueError> {
        Self::bind_with_capacity(definition, store, DEFAULT_FEED_CAPACITY)
    }

    /// As [`bind`](Self::bind), with a custom feed buffer size.
    pub fn bind_with_capacity(
        definition: QueueDefinition,
        store: Arc<dyn JobStore>,
        feed_capacity: usize,
    ) -> Result<Self, QueueError> {
        if definition.name.trim().is_empty() {
            return Err(QueueError::Configuration(ConfigurationError::invalid_setting(
                "queue name",
                "must not be blank",
            )));
        }

        store
            .ping()
            .map_err(|e| QueueError::Connection(format!("queue '{}': {e}", definition.name)))?;

        let (events, _) = broadcast::channel(feed_capacity.max(1));
        Ok(Self {
            definition: Arc::new(definition),
            store,
            events,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Retry policy applied to jobs added through this binding.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> QueueEventFeed {
        QueueEventFeed::new(self.definition.name.clone(), self.events.subscribe())
    }

    pub fn metadata(&self) -> Result<QueueMetadata, QueueError> {
        Ok(QueueMetadata {
            name: self.definition.name.clone(),
            display_name: self.definition.display_name.clone(),
            counts: self.store.counts(self.name())?,
        })
    }

    /// Enqueue a job named `name`. Emits `waiting`.
    pub fn add(&self, name: impl Into<String>, data: JsonValue) -> Result<Job, QueueError> {
        let job = Job::new(self.name(), name, data).with_retry_policy(self.retry_policy.clone());
        self.add_job(job)
    }

    /// Enqueue a prepared job (e.g. delayed or with its own retry policy).
    pub fn add_job(&self, mut job: Job) -> Result<Job, QueueError> {
        job.queue = self.definition.name.clone();
        self.store.enqueue(job.clone())?;
        debug!(queue = %self.name(), job_id = %job.id, job = %job.name, "job added");
        self.emit(
            QueueEventPayload::new(self.name(), QueueEvent::Waiting)
                .job(job.id)
                .data(job.data.clone()),
        );
        Ok(job)
    }

    /// Claim and run the oldest ready job, if any.
    ///
    /// Emits `active`, then `completed` or `failed`. A failed job that will be
    /// retried emits `waiting` again; one that exhausted its policy is moved to
    /// the dead-letter queue.
    pub fn process_next(&self, handlers: &JobHandlers) -> Result<Option<Job>, QueueError> {
        let Some(mut job) = self.store.claim_next(self.name())? else {
            return Ok(None);
        };

        self.emit(
            QueueEventPayload::new(self.name(), QueueEvent::Active)
                .job(job.id)
                .attempt(job.attempt),
        );

        let started = Utc::now();
        let outcome = match handlers.get(&job.name) {
            Some(handler) => catch_unwind(AssertUnwindSafe(|| handler.handle(&job))).unwrap_or_else(|_| {
                JobOutcome::Failure(format!("handler for job '{}' panicked", job.name))
            }),
            None => JobOutcome::Failure(format!("no handler registered for job '{}'", job.name)),
        };

        match outcome {
            JobOutcome::Success => {
                job.record_success(started);
                self.store.update(&job)?;
                debug!(queue = %self.name(), job_id = %job.id, attempt = job.attempt, "job completed");
                self.emit(
                    QueueEventPayload::new(self.name(), QueueEvent::Completed)
                        .job(job.id)
                        .attempt(job.attempt),
                );
            }
            JobOutcome::Failure(error) => {
                job.record_failure(error.clone(), started, None);
                self.settle_failure(&mut job, error)?;
            }
            JobOutcome::RetryAfter(error, delay) => {
                job.record_failure(error.clone(), started, Some(delay));
                self.settle_failure(&mut job, error)?;
            }
            JobOutcome::Fatal(error) => {
                job.record_fatal(error.clone(), started);
                self.settle_failure(&mut job, error)?;
            }
        }

        Ok(Some(job))
    }

    /// Dead-lettered jobs of this queue, oldest first.
    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.store.list_dead_letters(self.name(), limit)?)
    }

    /// Put a dead-lettered job back on the queue. Emits `waiting`.
    pub fn retry_dead_letter(&self, job_id: vaultgate_core::JobId) -> Result<Job, QueueError> {
        let job = self.store.retry_dead_letter(job_id)?;
        self.emit(
            QueueEventPayload::new(self.name(), QueueEvent::Waiting)
                .job(job.id)
                .data(job.data.clone()),
        );
        Ok(job)
    }

    /// Persist a recorded failure, then retry or dead-letter per its status.
    fn settle_failure(&self, job: &mut Job, error: String) -> Result<(), QueueError> {
        self.store.update(job)?;

        self.emit(
            QueueEventPayload::new(self.name(), QueueEvent::Failed)
                .job(job.id)
                .attempt(job.attempt)
                .data(json!({ "failedReason": error })),
        );

        match &job.status {
            JobStatus::Failed { .. } => {
                debug!(queue = %self.name(), job_id = %job.id, attempt = job.attempt, error = %error, "job failed, retry scheduled");
                self.emit(QueueEventPayload::new(self.name(), QueueEvent::Waiting).job(job.id));
            }
            JobStatus::DeadLettered { .. } => {
                warn!(queue = %self.name(), job_id = %job.id, attempts = job.attempt, error = %error, "job dead-lettered");
                self.store.dead_letter(job.clone(), error)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn emit(&self, payload: QueueEventPayload) {
        // No subscribers is fine: the feed is purely observational.
        let _ = self.events.send(payload);
    }
}
