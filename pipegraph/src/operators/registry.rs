//! Registry of operator types.

use super::{MaterializeOperator, Operator, OperatorConfig};
use crate::errors::{ConfigurationError, PipegraphError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps operator type ids to their implementations.
#[derive(Default)]
pub struct OperatorRegistry {
    operators: RwLock<HashMap<String, Arc<dyn Operator>>>,
}

impl OperatorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in operators.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry
            .operators
            .write()
            .insert(MaterializeOperator.config().id, Arc::new(MaterializeOperator));
        registry
    }

    /// Registers an operator under its config id.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the id is already taken.
    pub fn register(&self, operator: Arc<dyn Operator>) -> Result<()> {
        let id = operator.config().id;
        let mut operators = self.operators.write();
        if operators.contains_key(&id) {
            let msg = format!("operator {id} is already registered");
            return Err(ConfigurationError::new(msg).into());
        }
        debug!(op = %id, "registered operator");
        operators.insert(id, operator);
        Ok(())
    }

    /// Looks up an operator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown operator types.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Operator>> {
        self.operators
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PipegraphError::config(format!("unknown operator {id}")))
    }

    /// Returns true if the operator type is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.operators.read().contains_key(id)
    }

    /// Configs of every registered operator, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<OperatorConfig> {
        let mut configs: Vec<OperatorConfig> =
            self.operators.read().values().map(|op| op.config()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("operators", &self.operators.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::MATERIALIZE_OP;
    use crate::testing::RecordingOperator;

    #[test]
    fn test_builtins_include_materialize() {
        let registry = OperatorRegistry::with_builtins();
        assert!(registry.contains(MATERIALIZE_OP));
        assert_eq!(registry.get(MATERIALIZE_OP).unwrap().config().id, MATERIALIZE_OP);
    }

    #[test]
    fn test_register_and_list() {
        let registry = OperatorRegistry::with_builtins();
        registry.register(Arc::new(RecordingOperator::new("resize"))).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["materialize", "resize"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = OperatorRegistry::new();
        registry.register(Arc::new(RecordingOperator::new("resize"))).unwrap();
        let err = registry.register(Arc::new(RecordingOperator::new("resize"))).unwrap_err();
        assert!(matches!(err, PipegraphError::Configuration(_)));
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::new();
        assert!(matches!(registry.get("nope"), Err(PipegraphError::Configuration(_))));
    }
}
