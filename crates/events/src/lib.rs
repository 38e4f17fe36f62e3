//! Outbox events and in-process dispatch mechanics.
//!
//! - [`OutboxEvent`]: the durable record of a domain fact awaiting relay.
//! - [`EventHandlerRegistry`]: tag-keyed handler table for same-process reactions.
//! - [`EventBus`] / [`Subscription`]: transport-agnostic fan-out primitives the
//!   broker implementations build on.

pub mod bus;
pub mod handler;
pub mod in_memory_bus;
pub mod outbox;

pub use bus::{EventBus, Subscription};
pub use handler::{
    DispatchReport, EventHandler, EventHandlerRegistry, EventHandlerRegistryBuilder, HandlerError,
};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use outbox::{NewOutboxEvent, OutboxEvent};
