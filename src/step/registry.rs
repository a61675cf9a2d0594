//! Step Registry
//!
//! Startup table mapping `implementation` references to handlers. The
//! registry is built explicitly and passed through the execution context;
//! there is no global registration.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::builtin::{ExportStep, FilterStep, GenerateStep, SqlStep};
use super::{Step, StepDescriptor};
use crate::error::EngineError;

#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: BTreeMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the `builtin.*` implementations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [Arc<dyn Step>; 4] = [
            Arc::new(GenerateStep),
            Arc::new(FilterStep),
            Arc::new(SqlStep),
            Arc::new(ExportStep),
        ];
        for step in builtins {
            let name = step.describe().implementation;
            registry.steps.insert(name, step);
        }
        registry
    }

    /// Registers a handler under its described implementation name.
    pub fn register<S: Step + 'static>(&mut self, step: S) -> Result<(), EngineError> {
        self.register_arc(Arc::new(step))
    }

    pub fn register_arc(&mut self, step: Arc<dyn Step>) -> Result<(), EngineError> {
        let name = step.describe().implementation;
        if self.steps.contains_key(&name) {
            return Err(EngineError::DuplicateImplementation(name));
        }
        debug!("Registered step implementation '{}'", name);
        self.steps.insert(name, step);
        Ok(())
    }

    pub fn resolve(&self, implementation: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(implementation).cloned()
    }

    pub fn contains(&self, implementation: &str) -> bool {
        self.steps.contains_key(implementation)
    }

    pub fn implementations(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    pub fn descriptors(&self) -> Vec<StepDescriptor> {
        self.steps.values().map(|s| s.describe()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = StepRegistry::with_builtins();
        assert_eq!(
            registry.implementations(),
            vec!["builtin.export", "builtin.filter", "builtin.generate", "builtin.sql"]
        );
        assert!(registry.resolve("builtin.filter").is_some());
        assert!(registry.resolve("builtin.unknown").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = StepRegistry::with_builtins();
        let err = registry.register(GenerateStep).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateImplementation(name) if name == "builtin.generate"));
    }

    #[test]
    fn test_descriptors_have_no_values() {
        let registry = StepRegistry::with_builtins();
        let export = registry
            .descriptors()
            .into_iter()
            .find(|d| d.implementation == "builtin.export")
            .unwrap();
        assert!(!export.produces_table);
        assert!(export.config_fields.iter().any(|f| f.name == "path" && f.required));
    }
}
