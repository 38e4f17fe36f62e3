//! `vaultgate-core`: foundation building blocks shared by every crate.
//!
//! Identifiers, the idempotency key discipline for provider calls and the
//! base error model. No IO lives here.

pub mod error;
pub mod id;
pub mod idempotency;

pub use error::{CoreError, CoreResult};
pub use id::{JobId, OutboxEventId};
pub use idempotency::{IdempotencyKey, ensure_idempotency_key};
