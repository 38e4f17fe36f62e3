//! In-process event handler registry (dispatch by event-type tag).
//!
//! Handlers are registered explicitly at startup against a string tag such as
//! `"account.created"`. The event source never learns who consumes it: it
//! dispatches the event and every handler registered for the tag runs.
//!
//! ## Failure isolation
//!
//! A handler failure, whether a returned [`HandlerError`] or a panic, is caught
//! and logged for that handler alone. Sibling handlers still run and nothing
//! propagates back to the dispatching caller.
//!
//! ## Payload contract
//!
//! The payload is opaque JSON. Registry and handler agree on its schema per tag
//! out-of-band; there is no type-level coupling.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::outbox::OutboxEvent;

/// Failure reported by an in-process handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler failed: {message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reacts to events of the tags it is registered for.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &OutboxEvent) -> Result<(), HandlerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<F> EventHandler for F
where
    F: Fn(&OutboxEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &OutboxEvent) -> Result<(), HandlerError> {
        self(event)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

/// Outcome of a single dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that were invoked.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failed
    }
}

/// Tag-keyed table of handlers.
#[derive(Default, Clone)]
pub struct EventHandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl core::fmt::Debug for EventHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(tag, hs)| (tag.as_str(), hs.len()))
            .collect();
        f.debug_struct("EventHandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl EventHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EventHandlerRegistryBuilder {
        EventHandlerRegistryBuilder::default()
    }

    /// Associate a handler with a tag. Multiple handlers per tag all run.
    pub fn register<H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.register_shared(event_type, Arc::new(handler));
    }

    /// Register a handler that is already shared (e.g. across several tags).
    pub fn register_shared(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(event_type.into()).or_default().push(handler);
    }

    /// Number of handlers registered for a tag.
    pub fn handlers_for(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Tags that have at least one handler.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Invoke every handler registered for `event.event_type()`.
    ///
    /// Never fails: an unregistered tag invokes nothing, and handler failures
    /// are logged and counted in the report.
    pub fn dispatch(&self, event: &OutboxEvent) -> DispatchReport {
        let Some(handlers) = self.handlers.get(event.event_type()) else {
            debug!(event_type = event.event_type(), "no handlers registered");
            return DispatchReport::default();
        };

        let mut report = DispatchReport::default();
        for handler in handlers {
            report.invoked += 1;

            match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        event_id = %event.id(),
                        event_type = event.event_type(),
                        handler = handler.name(),
                        error = %err,
                        "event handler failed"
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    warn!(
                        event_id = %event.id(),
                        event_type = event.event_type(),
                        handler = handler.name(),
                        panic = panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }

        report
    }
}

/// Builds an immutable registry at startup.
#[derive(Default)]
pub struct EventHandlerRegistryBuilder {
    registry: EventHandlerRegistry,
}

impl EventHandlerRegistryBuilder {
    pub fn on<H>(mut self, event_type: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.registry.register(event_type, handler);
        self
    }

    pub fn build(self) -> Arc<EventHandlerRegistry> {
        Arc::new(self.registry)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
