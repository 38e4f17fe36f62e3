//! Read-only dashboard feed over every queue binding.
//!
//! Merges the lifecycle feeds of all bindings into one stream and reports
//! queue metadata. It only subscribes and reads; queue state is never touched.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_stream::{StreamExt, StreamMap};
use tracing::debug;

use crate::queues::{QueueBinding, QueueError, QueueEventStream, QueueMetadata, QueueRegistry};

/// Queue metadata at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub queues: Vec<QueueMetadata>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DashboardFeed {
    bindings: Vec<QueueBinding>,
}

impl DashboardFeed {
    pub fn new(registry: &QueueRegistry) -> Self {
        Self {
            bindings: registry.bindings().cloned().collect(),
        }
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.bindings.iter().map(QueueBinding::name).collect()
    }

    /// Every queue's events from now on, merged.
    ///
    /// Events of one queue keep their order; there is no ordering across
    /// queues. Dropping the stream unsubscribes from all of them.
    pub fn subscribe(&self) -> QueueEventStream {
        let mut merged = StreamMap::new();
        for binding in &self.bindings {
            merged.insert(binding.name().to_string(), binding.events().into_stream());
        }
        debug!(queues = merged.len(), "dashboard subscriber attached");
        Box::pin(merged.map(|(_, event)| event))
    }

    pub fn snapshot(&self) -> Result<DashboardSnapshot, QueueError> {
        let queues = self
            .bindings
            .iter()
            .map(QueueBinding::metadata)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DashboardSnapshot {
            queues,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::queues::{InMemoryJobStore, Job, JobHandlers, JobOutcome, QueueDefinition, QueueEvent};

    fn registry() -> QueueRegistry {
        QueueRegistry::bind_all(QueueDefinition::default_catalogue(), InMemoryJobStore::arc()).unwrap()
    }

    #[tokio::test]
    async fn merges_events_of_all_queues() {
        let registry = registry();
        let feed = DashboardFeed::new(&registry);
        let mut stream = feed.subscribe();

        registry.get("login-tasks").unwrap().add("session.audit", json!({})).unwrap();
        registry.get("account-tasks").unwrap().add("wallet.provision", json!({})).unwrap();

        let mut queues = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event, QueueEvent::Waiting);
            queues.push(event.queue_name);
        }
        queues.sort();
        assert_eq!(queues, vec!["account-tasks", "login-tasks"]);
    }

    #[tokio::test]
    async fn one_job_yields_waiting_active_and_one_terminal_event() {
        let registry = registry();
        let feed = DashboardFeed::new(&registry);
        let mut stream = feed.subscribe();

        let queue = registry.get("account-tasks").unwrap();
        let handlers = JobHandlers::new().with("*", |_job: &Job| JobOutcome::Success);
        let job = queue.add("wallet.provision", json!({})).unwrap();
        queue.process_next(&handlers).unwrap();

        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(100), stream.next()).await {
            assert_eq!(event.job_id, Some(job.id));
            events.push(event.event);
        }
        assert_eq!(events, vec![QueueEvent::Waiting, QueueEvent::Active, QueueEvent::Completed]);
    }

    #[test]
    fn snapshot_reads_without_mutating() {
        let registry = registry();
        registry.get("account-tasks").unwrap().add("wallet.provision", json!({})).unwrap();

        let feed = DashboardFeed::new(&registry);
        let first = feed.snapshot().unwrap();
        let second = feed.snapshot().unwrap();

        assert_eq!(first.queues, second.queues);
        let account = first.queues.iter().find(|q| q.name == "account-tasks").unwrap();
        assert_eq!(account.counts.waiting, 1);
        assert_eq!(feed.queue_names().len(), 3);
    }
}
