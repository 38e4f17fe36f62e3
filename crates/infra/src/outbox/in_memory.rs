use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use vaultgate_core::OutboxEventId;
use vaultgate_events::{NewOutboxEvent, OutboxEvent};

use super::{MarkOutcome, OutboxError, OutboxStore, PendingCursor};

#[derive(Debug, Default)]
struct Rows {
    events: HashMap<OutboxEventId, OutboxEvent>,
    by_dedupe_key: HashMap<String, OutboxEventId>,
}

impl Rows {
    /// Insert, or return the row already holding the same dedupe key.
    fn insert(&mut self, event: OutboxEvent) -> OutboxEvent {
        if let Some(key) = event.dedupe_key() {
            if let Some(existing) = self.by_dedupe_key.get(key).and_then(|id| self.events.get(id)) {
                return existing.clone();
            }
            self.by_dedupe_key.insert(key.to_string(), event.id());
        }
        self.events.insert(event.id(), event.clone());
        event
    }
}

/// In-memory outbox for tests/dev.
///
/// Supports a unit of work through [`InMemoryOutboxStore::begin`] and can be
/// switched unavailable to simulate a database outage.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    rows: RwLock<Rows>,
    available: AtomicBool,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Rows::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a unit of work. Nothing staged in it is visible until commit.
    pub fn begin(&self) -> OutboxTransaction<'_> {
        OutboxTransaction {
            store: self,
            staged: Vec::new(),
        }
    }

    /// Simulate the database going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Look up a row regardless of its state.
    pub fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxError> {
        self.ensure_available()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| OutboxError::Persistence("lock poisoned".to_string()))?;
        Ok(rows.events.get(&id).cloned())
    }

    /// Total rows, published or not.
    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<(), OutboxError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OutboxError::Persistence("outbox storage unavailable".to_string()))
        }
    }

    fn commit_staged<T, E, F>(
        &self,
        staged: Vec<OutboxEvent>,
        mutation: F,
    ) -> Result<(T, Vec<OutboxEvent>), OutboxError>
    where
        F: FnOnce() -> Result<T, E>,
        E: core::fmt::Display,
    {
        self.ensure_available()?;

        // No lock is held while the mutation runs, so it may read this store.
        let value = mutation()
            .map_err(|err| OutboxError::Persistence(format!("unit of work rolled back: {err}")))?;

        // The mutation has been applied; its rows must land even after a
        // panic elsewhere poisoned the lock.
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        let committed = staged.into_iter().map(|event| rows.insert(event)).collect();
        Ok((value, committed))
    }
}

#[async_trait::async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append_event(&self, event: NewOutboxEvent) -> Result<OutboxEvent, OutboxError> {
        let mut tx = self.begin();
        tx.append_event(event);
        let mut committed = tx.commit()?;
        committed
            .pop()
            .ok_or_else(|| OutboxError::Persistence("append produced no row".to_string()))
    }

    async fn fetch_pending_after(
        &self,
        cursor: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.ensure_available()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| OutboxError::Persistence("lock poisoned".to_string()))?;

        let mut pending: Vec<_> = rows
            .events
            .values()
            .filter(|e| e.is_pending())
            .filter(|e| cursor.is_none_or(|c| PendingCursor::from(*e) > c))
            .collect();
        pending.sort_by_key(|e| (e.created_at(), e.id()));

        Ok(pending.into_iter().take(limit).cloned().collect())
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, OutboxError> {
        self.ensure_available()?;
        let mut rows = self
            .rows
            .write()
            .map_err(|_| OutboxError::Persistence("lock poisoned".to_string()))?;

        let event = rows.events.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        if event.record_published(at) {
            Ok(MarkOutcome::Marked)
        } else {
            Ok(MarkOutcome::AlreadyPublished)
        }
    }

    async fn pending_count(&self) -> Result<u64, OutboxError> {
        self.ensure_available()?;
        let rows = self
            .rows
            .read()
            .map_err(|_| OutboxError::Persistence("lock poisoned".to_string()))?;
        Ok(rows.events.values().filter(|e| e.is_pending()).count() as u64)
    }
}

/// A unit of work against [`InMemoryOutboxStore`].
///
/// Appends are staged and become visible together with the caller's mutation
/// on [`commit_with`](Self::commit_with). Dropping the transaction discards
/// everything staged.
#[derive(Debug)]
pub struct OutboxTransaction<'a> {
    store: &'a InMemoryOutboxStore,
    staged: Vec<OutboxEvent>,
}

impl OutboxTransaction<'_> {
    /// Stage a validated event.
    pub fn append(&mut self, event_type: &str, payload: JsonValue) -> Result<&OutboxEvent, OutboxError> {
        let event = NewOutboxEvent::new(event_type, payload)?;
        Ok(self.append_event(event))
    }

    pub fn append_event(&mut self, event: NewOutboxEvent) -> &OutboxEvent {
        let index = self.staged.len();
        self.staged.push(event.into_event(OutboxEventId::new(), Utc::now()));
        &self.staged[index]
    }

    pub fn staged(&self) -> &[OutboxEvent] {
        &self.staged
    }

    /// Commit the staged events alone.
    pub fn commit(self) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.commit_with(|| Ok::<_, Infallible>(()))
            .map(|((), events)| events)
    }

    /// Run `mutation` and commit the staged events only if it succeeds.
    ///
    /// A failed mutation is reported as a persistence error and nothing is
    /// written: the event and the state change succeed or fail together.
    /// The mutation runs without the store's lock, so it may read the store;
    /// staged rows are not visible to it.
    pub fn commit_with<T, E, F>(self, mutation: F) -> Result<(T, Vec<OutboxEvent>), OutboxError>
    where
        F: FnOnce() -> Result<T, E>,
        E: core::fmt::Display,
    {
        self.store.commit_staged(self.staged, mutation)
    }
}
