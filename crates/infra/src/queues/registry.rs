use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use super::QueueError;
use super::binding::{QueueBinding, QueueDefinition, QueueMetadata};
use super::store::JobStore;
use crate::error::ConfigurationError;

/// The process-wide set of queue bindings, keyed by queue name.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    bindings: BTreeMap<String, QueueBinding>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every definition to `store` and register the results.
    ///
    /// Stops at the first unreachable store or duplicate name.
    pub fn bind_all(
        definitions: impl IntoIterator<Item = QueueDefinition>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, QueueError> {
        let mut registry = Self::new();
        for definition in definitions {
            let binding = QueueBinding::bind(definition, store.clone())?;
            registry.register(binding)?;
        }
        info!(queues = registry.bindings.len(), "queue registry ready");
        Ok(registry)
    }

    pub fn register(&mut self, binding: QueueBinding) -> Result<(), ConfigurationError> {
        let name = binding.name().to_string();
        if self.bindings.contains_key(&name) {
            return Err(ConfigurationError::DuplicateQueue(name));
        }
        self.bindings.insert(name, binding);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&QueueBinding, QueueError> {
        self.bindings
            .get(name)
            .ok_or_else(|| QueueError::Configuration(ConfigurationError::UnknownQueue(name.to_string())))
    }

    /// Bindings in name order.
    pub fn bindings(&self) -> impl Iterator<Item = &QueueBinding> {
        self.bindings.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn metadata(&self) -> Result<Vec<QueueMetadata>, QueueError> {
        self.bindings.values().map(QueueBinding::metadata).collect()
    }
}
