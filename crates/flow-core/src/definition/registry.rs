//! In-process registry of workflow definitions, keyed by `(name, version)`.

use std::collections::HashMap;

use crate::definition::WorkflowDefinition;
use crate::error::FlowError;

/// Holds every registered [`WorkflowDefinition`] for the lifetime of the
/// process. Registration happens once at startup, explicitly, in Rust —
/// there is no dynamic reload.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<(String, i32), WorkflowDefinition>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// Register a definition. Re-registering the same `(name, version)`
    /// overwrites the previous entry, matching process-restart semantics
    /// rather than accumulating stale duplicates.
    pub fn register(&mut self, definition: WorkflowDefinition) {
        let key = (definition.name.clone(), definition.version);
        self.definitions.insert(key, definition);
    }

    pub fn get(&self, name: &str, version: i32) -> Result<&WorkflowDefinition, FlowError> {
        self.definitions
            .get(&(name.to_string(), version))
            .ok_or_else(|| FlowError::NotFound(format!("workflow {name} v{version} not registered")))
    }

    /// The highest registered version for `name`, if any.
    pub fn latest_version(&self, name: &str) -> Option<i32> {
        self.definitions
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .max()
    }

    pub fn get_latest(&self, name: &str) -> Result<&WorkflowDefinition, FlowError> {
        let version = self
            .latest_version(name)
            .ok_or_else(|| FlowError::NotFound(format!("workflow {name} not registered")))?;
        self.get(name, version)
    }

    pub fn list(&self) -> impl Iterator<Item = &WorkflowDefinition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Element, StepDef};

    fn sample(name: &str, version: i32) -> WorkflowDefinition {
        WorkflowDefinition::new(name, version, vec![Element::Step(StepDef::new("a", "h"))]).unwrap()
    }

    #[test]
    fn register_and_get_roundtrip() {
        let mut registry = DefinitionRegistry::new();
        registry.register(sample("order", 1));
        assert_eq!(registry.get("order", 1).unwrap().name, "order");
        assert!(registry.get("order", 2).is_err());
    }

    #[test]
    fn get_latest_picks_highest_version() {
        let mut registry = DefinitionRegistry::new();
        registry.register(sample("order", 1));
        registry.register(sample("order", 3));
        registry.register(sample("order", 2));

        assert_eq!(registry.latest_version("order"), Some(3));
        assert_eq!(registry.get_latest("order").unwrap().version, 3);
    }

    #[test]
    fn reregistering_same_key_overwrites() {
        let mut registry = DefinitionRegistry::new();
        registry.register(sample("order", 1));
        assert_eq!(registry.len(), 1);
        registry.register(sample("order", 1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_registry_reports_not_found() {
        let registry = DefinitionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get_latest("missing").is_err());
    }
}
