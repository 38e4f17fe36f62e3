//! Job storage implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::Serialize;

use vaultgate_core::JobId;

use super::types::{DeadLetterEntry, Job, JobStatus};

/// Job store abstraction. One store may back several queues.
pub trait JobStore: Send + Sync {
    /// Verify the store is reachable.
    fn ping(&self) -> Result<(), JobStoreError>;

    /// Enqueue a new job.
    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Update a job.
    fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claim the oldest claimable job of `queue` that is ready to run,
    /// marking it active. Returns None if no jobs are available.
    fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    /// List dead-lettered jobs of a queue, oldest first.
    fn list_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Move a dead-lettered job back to waiting with a fresh attempt count.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Per-state counts for a queue.
    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn ping(&self) -> Result<(), JobStoreError> {
        (**self).ping()
    }

    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(queue)
    }

    fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason)
    }

    fn list_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(queue, limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id)
    }

    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError> {
        (**self).counts(queue)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job store unreachable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-state job counts of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    /// Failed and scheduled for retry
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory job store for tests/dev.
///
/// Completed jobs are dropped once recorded; only their per-queue count is
/// kept, so the store holds live and dead-lettered jobs only.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
    completed: RwLock<HashMap<String, usize>>,
    reachable: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            completed: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the backing store going away.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Jobs held in memory, across queues, excluding dead letters.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<(), JobStoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(JobStoreError::Unavailable("in-memory job store offline".to_string()))
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("lock poisoned".to_string())
}

impl JobStore for InMemoryJobStore {
    fn ping(&self) -> Result<(), JobStoreError> {
        self.check_reachable()
    }

    fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.check_reachable()?;
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if !jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }

        if job.status == JobStatus::Completed {
            jobs.remove(&job.id);
            let mut completed = self.completed.write().map_err(|_| poisoned())?;
            *completed.entry(job.queue.clone()).or_default() += 1;
        } else {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobStoreError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let now = Utc::now();

        // Oldest ready job first; ids are time-ordered and break ties.
        let next = jobs
            .values()
            .filter(|j| j.queue == queue && j.status.is_claimable() && j.is_ready_at(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| jobs.get_mut(&id)).map(|job| {
            job.activate();
            job.clone()
        }))
    }

    fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut dls = self.dead_letters.write().map_err(|_| poisoned())?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = Utc::now();

        jobs.remove(&job.id);
        dls.insert(job.id, DeadLetterEntry::new(job, reason));

        Ok(())
    }

    fn list_dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        self.check_reachable()?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;
        let mut result: Vec<_> = dls.values().filter(|e| e.job.queue == queue).cloned().collect();

        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.check_reachable()?;
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let mut dls = self.dead_letters.write().map_err(|_| poisoned())?;

        let entry = dls.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.reset();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn counts(&self, queue: &str) -> Result<JobCounts, JobStoreError> {
        self.check_reachable()?;
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let dls = self.dead_letters.read().map_err(|_| poisoned())?;

        let mut counts = JobCounts {
            completed: self
                .completed
                .read()
                .map_err(|_| poisoned())?
                .get(queue)
                .copied()
                .unwrap_or_default(),
            ..JobCounts::default()
        };
        for job in jobs.values().filter(|j| j.queue == queue) {
            match &job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed { .. } => counts.failed += 1,
                JobStatus::DeadLettered { .. } => counts.dead_lettered += 1,
            }
        }
        counts.dead_lettered += dls.values().filter(|e| e.job.queue == queue).count();

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(queue: &str) -> Job {
        Job::new(queue, "test", serde_json::json!({}))
    }

    #[test]
    fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job("account-tasks")).unwrap();

        let claimed = store.claim_next("account-tasks").unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next("account-tasks").unwrap().is_none());
    }

    #[test]
    fn claims_are_scoped_to_the_queue() {
        let store = InMemoryJobStore::new();
        store.enqueue(job("login-tasks")).unwrap();

        assert!(store.claim_next("account-tasks").unwrap().is_none());
        assert!(store.claim_next("login-tasks").unwrap().is_some());
    }

    #[test]
    fn claims_in_fifo_order() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("account-tasks")).unwrap();
        let second = store.enqueue(job("account-tasks")).unwrap();

        assert_eq!(store.claim_next("account-tasks").unwrap().unwrap().id, first);
        assert_eq!(store.claim_next("account-tasks").unwrap().unwrap().id, second);
    }

    #[test]
    fn delayed_jobs_are_not_claimed_early() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(job("account-tasks").delayed(std::time::Duration::from_secs(60)))
            .unwrap();

        assert!(store.claim_next("account-tasks").unwrap().is_none());
        assert_eq!(store.counts("account-tasks").unwrap().waiting, 1);
    }

    #[test]
    fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let job = job("account-tasks");
        let job_id = job.id;
        store.enqueue(job).unwrap();

        let mut claimed = store.claim_next("account-tasks").unwrap().unwrap();
        claimed.record_failure("test error".to_string(), Utc::now(), None);

        store.dead_letter(claimed, "max retries exceeded".to_string()).unwrap();

        // Job is no longer in main queue
        assert!(store.get(job_id).unwrap().is_none());

        let dls = store.list_dead_letters("account-tasks", 10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);
        assert_eq!(store.counts("account-tasks").unwrap().dead_lettered, 1);

        let retried = store.retry_dead_letter(job_id).unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);
        assert_eq!(retried.attempt, 0);

        assert!(store.list_dead_letters("account-tasks", 10).unwrap().is_empty());
    }

    #[test]
    fn counts_track_states() {
        let store = InMemoryJobStore::new();
        for _ in 0..5 {
            store.enqueue(job("contract-address-tasks")).unwrap();
        }

        assert_eq!(store.counts("contract-address-tasks").unwrap().waiting, 5);

        store.claim_next("contract-address-tasks").unwrap();
        store.claim_next("contract-address-tasks").unwrap();

        let counts = store.counts("contract-address-tasks").unwrap();
        assert_eq!(counts.waiting, 3);
        assert_eq!(counts.active, 2);
    }

    #[test]
    fn completed_jobs_are_counted_then_dropped() {
        let store = InMemoryJobStore::new();
        for _ in 0..100 {
            store.enqueue(job("account-tasks")).unwrap();
            let mut claimed = store.claim_next("account-tasks").unwrap().unwrap();
            claimed.record_success(Utc::now());
            store.update(&claimed).unwrap();
        }
        store.enqueue(job("account-tasks")).unwrap();

        assert_eq!(store.len(), 1);
        let counts = store.counts("account-tasks").unwrap();
        assert_eq!(counts.completed, 100);
        assert_eq!(counts.waiting, 1);
        assert_eq!(store.counts("login-tasks").unwrap().completed, 0);
    }

    #[test]
    fn unreachable_store_fails_ping_and_operations() {
        let store = InMemoryJobStore::new();
        store.set_reachable(false);

        assert!(matches!(store.ping(), Err(JobStoreError::Unavailable(_))));
        assert!(matches!(store.enqueue(job("login-tasks")), Err(JobStoreError::Unavailable(_))));
    }
}
