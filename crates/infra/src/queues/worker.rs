//! Background worker polling one queue binding.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use super::binding::QueueBinding;
use super::handlers::JobHandlers;
use super::types::JobStatus;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWorkerConfig {
    /// How often to poll when the queue is empty
    pub poll_interval: Duration,
    /// Thread name, used in logs
    pub name: String,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "queue-worker".to_string(),
        }
    }
}

impl QueueWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueWorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<QueueWorkerStats>>,
}

impl QueueWorkerHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> QueueWorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Polls a [`QueueBinding`] on a dedicated thread and runs claimed jobs.
#[derive(Debug)]
pub struct QueueWorker;

impl QueueWorker {
    pub fn spawn(
        binding: QueueBinding,
        handlers: Arc<JobHandlers>,
        config: QueueWorkerConfig,
    ) -> std::io::Result<QueueWorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(QueueWorkerStats::default()));
        let worker_stats = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(binding, handlers, config, shutdown_rx, worker_stats))?;

        Ok(QueueWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop(
    binding: QueueBinding,
    handlers: Arc<JobHandlers>,
    config: QueueWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<QueueWorkerStats>>,
) {
    info!(worker = %config.name, queue = %binding.name(), "queue worker started");
    let start_time = Instant::now();

    loop {
        let idle = match binding.process_next(&handlers) {
            Ok(Some(job)) => {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.jobs_processed += 1;
                match job.status {
                    JobStatus::Completed => s.jobs_succeeded += 1,
                    JobStatus::DeadLettered { .. } => {
                        s.jobs_failed += 1;
                        s.jobs_dead_lettered += 1;
                    }
                    _ => s.jobs_failed += 1,
                }
                debug!(worker = %config.name, job_id = %job.id, status = ?job.status, "job processed");
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!(worker = %config.name, queue = %binding.name(), error = %e, "failed to process job");
                true
            }
        };

        stats.lock().unwrap_or_else(PoisonError::into_inner).uptime_secs = start_time.elapsed().as_secs();

        // Sleep only when idle; the shutdown signal interrupts the wait.
        let wait = if idle { config.poll_interval } else { Duration::ZERO };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }

    info!(worker = %config.name, queue = %binding.name(), "queue worker stopped");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::queues::binding::QueueDefinition;
    use crate::queues::store::InMemoryJobStore;
    use crate::queues::types::{Job, JobOutcome, RetryPolicy};

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn worker_drains_queue_and_reports_stats() {
        let binding = QueueBinding::bind(
            QueueDefinition::new("account-tasks", "Account Tasks"),
            InMemoryJobStore::arc(),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::no_retry());
        let mut feed = binding.events();

        let handlers = Arc::new(
            JobHandlers::new()
                .with("ok", |_job: &Job| JobOutcome::Success)
                .with("bad", |_job: &Job| JobOutcome::Failure("boom".into())),
        );

        binding.add("ok", json!({})).unwrap();
        binding.add("ok", json!({})).unwrap();
        binding.add("bad", json!({})).unwrap();

        let handle = QueueWorker::spawn(
            binding.clone(),
            handlers,
            QueueWorkerConfig::default()
                .with_name("account-worker")
                .with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap();

        wait_until(|| handle.stats().jobs_processed == 3);
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_succeeded, 2);
        assert_eq!(stats.jobs_dead_lettered, 1);

        let terminal = feed
            .drain()
            .into_iter()
            .filter(|e| e.event.is_terminal())
            .count();
        assert_eq!(terminal, 3);
        assert_eq!(binding.metadata().unwrap().counts.completed, 2);
    }

    #[test]
    fn shutdown_stops_an_idle_worker() {
        let binding = QueueBinding::bind(
            QueueDefinition::new("login-tasks", "Login Tasks"),
            InMemoryJobStore::arc(),
        )
        .unwrap();

        let handle = QueueWorker::spawn(binding, Arc::new(JobHandlers::new()), QueueWorkerConfig::default()).unwrap();
        handle.shutdown();
    }
}
