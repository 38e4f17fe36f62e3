//! Job handler table, keyed by job name.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Job, JobOutcome};

/// Runs one job attempt.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> JobOutcome;
}

impl<F> JobHandler for F
where
    F: Fn(&Job) -> JobOutcome + Send + Sync,
{
    fn handle(&self, job: &Job) -> JobOutcome {
        self(job)
    }
}

/// Handlers by job name.
///
/// Lookup tries the exact name, then category patterns such as `"wallet.*"`,
/// then the `"*"` wildcard.
#[derive(Default, Clone)]
pub struct JobHandlers {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for JobHandlers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort_unstable();
        f.debug_struct("JobHandlers").field("names", &names).finish()
    }
}

impl JobHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job name or pattern.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, pattern: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn get(&self, job_name: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(job_name) {
            return Some(h);
        }

        // Longest category prefix wins ("wallet.*" matches "wallet.provision").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_name
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);

        category.or_else(|| self.handlers.get("*"))
    }
}
