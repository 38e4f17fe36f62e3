//! Jobs, their lifecycle states and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use vaultgate_core::JobId;

/// Where a job stands. Only `Waiting` and `Failed` jobs can be claimed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    /// Last attempt failed; claimable again once its backoff elapses.
    Failed { error: String, attempt: u32 },
    /// Retries exhausted.
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Failed { .. })
    }
}

/// How the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    Fixed { delay: Duration },
    /// `base * 2^(n - 1)`, never above `cap`.
    Exponential { base: Duration, cap: Duration },
}

/// Attempt budget plus backoff.
///
/// Used for queued jobs and for the relay's broker backoff, where
/// `max_attempts` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, the first one included. `0` and `1` both mean no retry.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Fixed { delay },
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential { base, cap },
        }
    }

    /// Wait before the attempt following failed attempt number `attempt`
    /// (1-based). Zero for `attempt == 0`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self.backoff {
            BackoffStrategy::Fixed { delay } => delay,
            BackoffStrategy::Exponential { base, cap } => {
                let factor = 1u32 << (attempt - 1).min(31);
                base.checked_mul(factor).map_or(cap, |d| d.min(cap))
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// A unit of work on a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Selects the handler.
    pub name: String,
    pub data: JsonValue,
    pub status: JobStatus,
    pub retry_policy: RetryPolicy,
    /// Attempts started so far.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant.
    pub run_after: Option<DateTime<Utc>>,
    pub attempt_log: Vec<AttemptRecord>,
}

/// One finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` on success.
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl Job {
    pub fn new(queue: impl Into<String>, name: impl Into<String>, data: JsonValue) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            name: name.into(),
            data,
            status: JobStatus::Waiting,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            run_after: None,
            attempt_log: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Hold the job back for `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.run_after = Some(after(Utc::now(), delay));
        self
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.run_after.is_none_or(|at| now >= at)
    }

    /// A worker claimed the job.
    pub fn activate(&mut self) {
        self.status = JobStatus::Active;
        self.attempt += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_success(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.log_attempt(started_at, now, None);
        self.status = JobStatus::Completed;
        self.run_after = None;
        self.updated_at = now;
    }

    /// Schedule a retry or dead-letter the job, per its policy. `retry_after`
    /// replaces the policy's backoff for this one retry.
    pub fn record_failure(&mut self, error: String, started_at: DateTime<Utc>, retry_after: Option<Duration>) {
        let now = Utc::now();
        self.log_attempt(started_at, now, Some(error.clone()));
        self.updated_at = now;

        if !self.retry_policy.should_retry(self.attempt) {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
            return;
        }

        let delay = retry_after.unwrap_or_else(|| self.retry_policy.delay_for_attempt(self.attempt));
        self.run_after = Some(after(now, delay));
        self.status = JobStatus::Failed {
            error,
            attempt: self.attempt,
        };
    }

    /// Dead-letter the job now, whatever attempts remain.
    pub fn record_fatal(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.log_attempt(started_at, now, Some(error.clone()));
        self.updated_at = now;
        self.run_after = None;
        self.status = JobStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    /// Back to a fresh `Waiting` job, keeping id, name and data.
    pub fn reset(&mut self) {
        self.status = JobStatus::Waiting;
        self.attempt = 0;
        self.run_after = None;
        self.attempt_log.clear();
        self.updated_at = Utc::now();
    }

    fn log_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.attempt_log.push(AttemptRecord {
            number: self.attempt,
            started_at,
            finished_at,
            error,
        });
    }
}

fn after(instant: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a handler reports for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    /// Retried per the job's policy.
    Failure(String),
    /// Retried after exactly this delay, e.g. a provider's `Retry-After`.
    RetryAfter(String, Duration),
    /// Retrying cannot help; dead-lettered at once.
    Fatal(String),
}

/// A job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub job: Job,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: Job, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
