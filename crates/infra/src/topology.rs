//! Static broker catalogue: exchanges, queues and routing keys per domain group.
//!
//! The catalogue is built once, validated exhaustively at startup and then
//! shared read-only. Event types map onto it by splitting the tag at its first
//! `.`: `"wallet.provision"` resolves group `wallet`, action `provision`.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::ConfigurationError;

/// Where a message goes: the exchange it is published to, its routing key and
/// the queue that key is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerTopology {
    exchanges: BTreeMap<String, String>,
    queues: BTreeMap<String, String>,
    routing_keys: BTreeMap<String, BTreeMap<String, String>>,
}

impl BrokerTopology {
    pub fn builder() -> BrokerTopologyBuilder {
        BrokerTopologyBuilder::default()
    }

    /// The production catalogue.
    pub fn default_catalogue() -> Self {
        Self::builder()
            .group("points", "points.exchange.topic", "point-minter.queue")
            .routing_key("points", "mint", "points.mint")
            .group("account", "account.exchange.topic", "account-events.queue")
            .routing_key("account", "created", "account.created")
            .group("wallet", "wallet.exchange.topic", "wallet-provisioner.queue")
            .routing_key("wallet", "provision", "wallet.provision")
            .routing_key("wallet", "provisioned", "wallet.provisioned")
            .group("kyc", "kyc.exchange.topic", "kyc-events.queue")
            .routing_key("kyc", "status_changed", "kyc.status_changed")
            .build()
    }

    /// Check every invariant of the catalogue.
    ///
    /// Every group with routing keys must declare an exchange and a queue; no
    /// name may be blank; exchange, queue and routing-key names must be unique.
    /// All violations are reported together.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut problems = Vec::new();

        for (group, exchange) in &self.exchanges {
            if group.trim().is_empty() {
                problems.push("blank domain group".to_string());
            }
            if exchange.trim().is_empty() {
                problems.push(format!("blank exchange for group '{group}'"));
            }
        }
        for (group, queue) in &self.queues {
            if queue.trim().is_empty() {
                problems.push(format!("blank queue for group '{group}'"));
            }
        }

        problems.extend(duplicates("exchange", self.exchanges.values()));
        problems.extend(duplicates("queue", self.queues.values()));
        problems.extend(duplicates(
            "routing key",
            self.routing_keys.values().flat_map(BTreeMap::values),
        ));

        for (group, actions) in &self.routing_keys {
            if !self.exchanges.contains_key(group) {
                problems.push(format!("group '{group}' has routing keys but no exchange"));
            }
            if !self.queues.contains_key(group) {
                problems.push(format!("group '{group}' has routing keys but no queue"));
            }
            for (action, key) in actions {
                if action.trim().is_empty() {
                    problems.push(format!("blank action in group '{group}'"));
                }
                if key.trim().is_empty() {
                    problems.push(format!("blank routing key for '{group}.{action}'"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidCatalogue(problems.join("; ")))
        }
    }

    pub fn resolve_route(&self, group: &str, action: &str) -> Result<Route, ConfigurationError> {
        let unknown = || ConfigurationError::UnknownRoute {
            group: group.to_string(),
            action: action.to_string(),
        };

        let routing_key = self
            .routing_keys
            .get(group)
            .and_then(|actions| actions.get(action))
            .ok_or_else(unknown)?;
        let exchange = self.exchanges.get(group).ok_or_else(unknown)?;
        let queue = self.queues.get(group).ok_or_else(unknown)?;

        Ok(Route {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
            queue: queue.clone(),
        })
    }

    /// Resolve the route for an event-type tag such as `"account.created"`.
    pub fn route_for_event(&self, event_type: &str) -> Result<Route, ConfigurationError> {
        match event_type.split_once('.') {
            Some((group, action)) if !group.is_empty() && !action.is_empty() => {
                self.resolve_route(group, action)
            }
            _ => Err(ConfigurationError::UnroutableEventType(event_type.to_string())),
        }
    }

    /// Every declared route.
    pub fn routes(&self) -> Vec<Route> {
        self.routing_keys
            .iter()
            .flat_map(|(group, actions)| {
                actions
                    .keys()
                    .filter_map(move |action| self.resolve_route(group, action).ok())
            })
            .collect()
    }

    pub fn exchange_names(&self) -> impl Iterator<Item = &str> {
        self.exchanges.values().map(String::as_str)
    }

    pub fn queue_names(&self) -> impl Iterator<Item = &str> {
        self.queues.values().map(String::as_str)
    }
}

fn duplicates<'a>(kind: &str, names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut reported: HashSet<&str> = HashSet::new();
    let mut problems = Vec::new();
    for name in names {
        let name = name.as_str();
        if !seen.insert(name) && reported.insert(name) {
            problems.push(format!("duplicate {kind} '{name}'"));
        }
    }
    problems
}

#[derive(Debug, Default)]
pub struct BrokerTopologyBuilder {
    topology: BrokerTopology,
}

impl BrokerTopologyBuilder {
    /// Declare a domain group with its exchange and queue.
    pub fn group(
        mut self,
        group: impl Into<String>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        let group = group.into();
        self.topology.exchanges.insert(group.clone(), exchange.into());
        self.topology.queues.insert(group, queue.into());
        self
    }

    pub fn routing_key(
        mut self,
        group: impl Into<String>,
        action: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.topology
            .routing_keys
            .entry(group.into())
            .or_default()
            .insert(action.into(), key.into());
        self
    }

    /// Unvalidated; call [`BrokerTopology::validate`] before use.
    pub fn build(self) -> BrokerTopology {
        self.topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalogue_validates() {
        BrokerTopology::default_catalogue().validate().unwrap();
    }

    #[test]
    fn resolves_points_mint() {
        let route = BrokerTopology::default_catalogue()
            .resolve_route("points", "mint")
            .unwrap();

        assert_eq!(route.exchange, "points.exchange.topic");
        assert_eq!(route.routing_key, "points.mint");
        assert_eq!(route.queue, "point-minter.queue");
    }

    #[test]
    fn unknown_group_or_action_is_a_configuration_error() {
        let topology = BrokerTopology::default_catalogue();

        assert_eq!(
            topology.resolve_route("loyalty", "mint"),
            Err(ConfigurationError::UnknownRoute {
                group: "loyalty".into(),
                action: "mint".into(),
            })
        );
        assert!(topology.resolve_route("points", "burn").is_err());
    }

    #[test]
    fn event_type_splits_at_first_dot() {
        let topology = BrokerTopology::default_catalogue();

        let route = topology.route_for_event("kyc.status_changed").unwrap();
        assert_eq!(route.routing_key, "kyc.status_changed");
        assert_eq!(route.queue, "kyc-events.queue");

        assert_eq!(
            topology.route_for_event("heartbeat"),
            Err(ConfigurationError::UnroutableEventType("heartbeat".into()))
        );
        assert!(topology.route_for_event(".created").is_err());
    }

    #[test]
    fn wallet_group_has_two_routes() {
        let routes = BrokerTopology::default_catalogue().routes();
        let wallet: Vec<_> = routes
            .iter()
            .filter(|r| r.exchange == "wallet.exchange.topic")
            .map(|r| r.routing_key.as_str())
            .collect();

        assert_eq!(wallet, vec!["wallet.provision", "wallet.provisioned"]);
        assert_eq!(routes.len(), 5);
    }

    #[test]
    fn routing_keys_without_exchange_or_queue_fail_validation() {
        let topology = BrokerTopology::builder()
            .routing_key("orphan", "created", "orphan.created")
            .build();

        let err = topology.validate().unwrap_err().to_string();
        assert!(err.contains("no exchange"), "{err}");
        assert!(err.contains("no queue"), "{err}");
    }

    #[test]
    fn duplicate_and_blank_names_fail_validation() {
        let topology = BrokerTopology::builder()
            .group("a", "shared.exchange", "a.queue")
            .group("b", "shared.exchange", " ")
            .routing_key("a", "x", "same.key")
            .routing_key("b", "y", "same.key")
            .build();

        let err = topology.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate exchange 'shared.exchange'"), "{err}");
        assert!(err.contains("duplicate routing key 'same.key'"), "{err}");
        assert!(err.contains("blank queue for group 'b'"), "{err}");
    }
}
