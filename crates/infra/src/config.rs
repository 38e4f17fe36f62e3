//! Startup configuration from environment variables.
//!
//! | Variable                   | Default         |
//! |----------------------------|-----------------|
//! | `DATABASE_URL`             | unset (in-memory outbox) |
//! | `REDIS_URL`                | unset (in-memory broker) |
//! | `PROVIDER_URL`             | unset (in-memory provider) |
//! | `PROVIDER_API_KEY`         | unset           |
//! | `BIND_ADDR`                | `0.0.0.0:8080`  |
//! | `RELAY_BATCH_SIZE`         | `50`            |
//! | `RELAY_POLL_INTERVAL_MS`   | `500`           |
//! | `RELAY_PUBLISH_TIMEOUT_MS` | `5000`          |
//! | `WORKER_POLL_INTERVAL_MS`  | `100`           |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::queues::QueueWorkerConfig;
use crate::relay::RelayConfig;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    pub bind_addr: SocketAddr,
    pub relay: RelayConfig,
    pub worker: QueueWorkerConfig,
}

impl AppConfig {
    /// Read the process environment once.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let relay_defaults = RelayConfig::default();
        let relay = RelayConfig {
            batch_size: parse_or(&get, "RELAY_BATCH_SIZE", relay_defaults.batch_size)?,
            poll_interval: millis_or(&get, "RELAY_POLL_INTERVAL_MS", relay_defaults.poll_interval)?,
            publish_timeout: millis_or(&get, "RELAY_PUBLISH_TIMEOUT_MS", relay_defaults.publish_timeout)?,
            backoff: relay_defaults.backoff,
        };
        if relay.batch_size == 0 {
            return Err(ConfigurationError::invalid_setting("RELAY_BATCH_SIZE", "must be at least 1"));
        }
        if relay.publish_timeout.is_zero() {
            return Err(ConfigurationError::invalid_setting("RELAY_PUBLISH_TIMEOUT_MS", "must be positive"));
        }

        let worker_defaults = QueueWorkerConfig::default();
        let worker = QueueWorkerConfig {
            poll_interval: millis_or(&get, "WORKER_POLL_INTERVAL_MS", worker_defaults.poll_interval)?,
            ..worker_defaults
        };

        let bind_addr = match get("BIND_ADDR") {
            Some(raw) => parse("BIND_ADDR", &raw)?,
            None => parse("BIND_ADDR", DEFAULT_BIND_ADDR)?,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            provider_url: get("PROVIDER_URL"),
            provider_api_key: get("PROVIDER_API_KEY"),
            bind_addr,
            relay,
            worker,
        })
    }

    /// No database configured: everything stays in memory.
    pub fn is_dev_mode(&self) -> bool {
        self.database_url.is_none()
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| ConfigurationError::invalid_setting(key, format!("'{raw}': {e}")))
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    get(key).map_or(Ok(default), |raw| parse(key, &raw))
}

fn millis_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigurationError> {
    get(key).map_or(Ok(default), |raw| parse::<u64>(key, &raw).map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigurationError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]).unwrap();

        assert!(config.is_dev_mode());
        assert_eq!(config.redis_url, None);
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.relay.batch_size, 50);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(500));
        assert_eq!(config.relay.publish_timeout, Duration::from_millis(5000));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/vaultgate"),
            ("BIND_ADDR", "127.0.0.1:9090"),
            ("RELAY_BATCH_SIZE", "200"),
            ("WORKER_POLL_INTERVAL_MS", "25"),
            ("REDIS_URL", "  "),
        ])
        .unwrap();

        assert!(!config.is_dev_mode());
        assert_eq!(config.redis_url, None);
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(config.relay.batch_size, 200);
        assert_eq!(config.worker.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn invalid_numbers_are_configuration_errors() {
        let err = config(&[("RELAY_POLL_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidSetting { ref key, .. } if key == "RELAY_POLL_INTERVAL_MS"));

        assert!(config(&[("RELAY_BATCH_SIZE", "0")]).is_err());
        assert!(config(&[("RELAY_BATCH_SIZE", "-1")]).is_err());
        assert!(config(&[("BIND_ADDR", "localhost")]).is_err());
    }
}
