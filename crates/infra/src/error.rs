//! Startup configuration failures shared by the catalogues and settings.

use thiserror::Error;

/// Invalid static configuration. Fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("no route declared for '{group}.{action}'")]
    UnknownRoute { group: String, action: String },

    #[error("event type '{0}' does not name a route (expected '<group>.<action>')")]
    UnroutableEventType(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("duplicate queue: {0}")]
    DuplicateQueue(String),

    #[error("invalid broker catalogue: {0}")]
    InvalidCatalogue(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_setting(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
