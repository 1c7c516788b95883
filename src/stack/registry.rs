//! The set of declared stacks, keyed by identifier.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::StackConfig;
use crate::error::{ConfigError, Result};

/// Holds every declared stack. Pure data: lookup only.
#[derive(Debug, Clone, Default)]
pub struct StackRegistry {
    stacks: BTreeMap<String, StackConfig>,
}

impl StackRegistry {
    /// Builds a registry from declarations.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateStackId` if two declarations share an identifier.
    pub fn new(declarations: impl IntoIterator<Item = StackConfig>) -> Result<Self> {
        let mut stacks = BTreeMap::new();

        for stack in declarations {
            if stacks.contains_key(&stack.id) {
                return Err(ConfigError::DuplicateStackId { stack_id: stack.id }.into());
            }
            stacks.insert(stack.id.clone(), stack);
        }

        debug!(stacks = stacks.len(), "Built stack registry");
        Ok(Self { stacks })
    }

    /// Returns the stack with the given identifier.
    #[must_use]
    pub fn get(&self, stack_id: &str) -> Option<&StackConfig> {
        self.stacks.get(stack_id)
    }

    /// Returns true if a stack with the given identifier is declared.
    #[must_use]
    pub fn contains(&self, stack_id: &str) -> bool {
        self.stacks.contains_key(stack_id)
    }

    /// Iterates over stacks in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &StackConfig> {
        self.stacks.values()
    }

    /// Returns identifiers in lexicographic order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.stacks.keys().map(String::as_str).collect()
    }

    /// Returns the number of declared stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if no stacks are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StackyardError;

    #[test]
    fn test_lookup_and_order() {
        let registry = StackRegistry::new(vec![
            StackConfig::new("Storage"),
            StackConfig::new("Compute"),
        ])
        .expect("registry");

        assert_eq!(registry.ids(), vec!["Compute", "Storage"]);
        assert!(registry.contains("Storage"));
        assert!(registry.get("Missing").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = StackRegistry::new(vec![StackConfig::new("A"), StackConfig::new("A")])
            .expect_err("duplicate");

        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::DuplicateStackId { ref stack_id }) if stack_id == "A"
        ));
    }
}
