//! Infrastructure layer: outbox stores, broker catalogue and brokers, the
//! relay, task queues, the dashboard feed and the custodial provider port.
//!
//! ## Pipeline
//!
//! ```text
//! domain mutation + outbox append (one transaction)
//!     -> Relay (fetch pending, route, publish with timeout, mark published)
//!     -> Broker (exchange + routing key -> queue)
//!     -> BrokerConsumer (dispatch in-process / enqueue job)
//!     -> QueueWorker (job handlers, retries, dead letters)
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dashboard;
pub mod error;
pub mod outbox;
pub mod provider;
pub mod queues;
pub mod relay;
pub mod topology;

pub use config::AppConfig;
pub use error::ConfigurationError;
pub use relay::{Relay, RelayConfig, RelayCycleReport, RelayHandle, RelayMonitor, RelayStats};
pub use topology::{BrokerTopology, Route};
