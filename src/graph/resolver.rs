//! Reference resolution.
//!
//! Matches each stack's imports against the exports declared in the
//! registry. With an explicit producer the export must exist on that stack;
//! otherwise the export name must be globally unique.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::stack::StackRegistry;

/// A resolved edge from a consuming stack to a producer's export.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Reference {
    /// The importing stack.
    pub consumer: String,
    /// The exporting stack.
    pub producer: String,
    /// The export name.
    pub export: String,
}

/// Pure resolver over a registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceResolver;

impl ReferenceResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Resolves every import in the registry.
    ///
    /// References are returned sorted by consumer, then import declaration
    /// order. A stack importing its own export yields a self-reference, which
    /// the graph builder rejects as a one-node cycle.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedImport` or `AmbiguousImport`.
    pub fn resolve(&self, registry: &StackRegistry) -> Result<Vec<Reference>> {
        let mut exporters: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for stack in registry.iter() {
            for export in stack.exports.keys() {
                exporters.entry(export.as_str()).or_default().push(stack.id.as_str());
            }
        }

        let mut references = Vec::new();

        for stack in registry.iter() {
            for import in &stack.imports {
                let producer = match import.from.as_deref() {
                    Some(from) => {
                        let exported = registry
                            .get(from)
                            .is_some_and(|p| p.exports.contains_key(&import.name));
                        if !exported {
                            return Err(ConfigError::UnresolvedImport {
                                stack_id: stack.id.clone(),
                                import: import.name.clone(),
                                producer: Some(from.to_string()),
                            }
                            .into());
                        }
                        from
                    }
                    None => match exporters.get(import.name.as_str()).map(Vec::as_slice) {
                        Some([only]) => *only,
                        Some(candidates) if !candidates.is_empty() => {
                            return Err(ConfigError::AmbiguousImport {
                                stack_id: stack.id.clone(),
                                import: import.name.clone(),
                                candidates: candidates.iter().map(|c| (*c).to_string()).collect(),
                            }
                            .into());
                        }
                        _ => {
                            return Err(ConfigError::UnresolvedImport {
                                stack_id: stack.id.clone(),
                                import: import.name.clone(),
                                producer: None,
                            }
                            .into());
                        }
                    },
                };

                debug!(
                    consumer = %stack.id,
                    producer = %producer,
                    export = %import.name,
                    "Resolved import"
                );
                references.push(Reference {
                    consumer: stack.id.clone(),
                    producer: producer.to_string(),
                    export: import.name.clone(),
                });
            }
        }

        Ok(references)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::error::StackyardError;

    fn registry(stacks: Vec<StackConfig>) -> StackRegistry {
        StackRegistry::new(stacks).expect("registry")
    }

    #[test]
    fn test_resolve_by_unique_name() {
        let reg = registry(vec![
            StackConfig::new("Storage").with_export("bucketArn", "${bucket.arn}"),
            StackConfig::new("Compute").with_import("bucketArn"),
        ]);

        let refs = ReferenceResolver::new().resolve(&reg).expect("resolves");
        assert_eq!(
            refs,
            vec![Reference {
                consumer: String::from("Compute"),
                producer: String::from("Storage"),
                export: String::from("bucketArn"),
            }]
        );
    }

    #[test]
    fn test_ambiguous_without_producer() {
        let reg = registry(vec![
            StackConfig::new("Blue").with_export("url", "x"),
            StackConfig::new("Green").with_export("url", "y"),
            StackConfig::new("Router").with_import("url"),
        ]);

        let err = ReferenceResolver::new().resolve(&reg).expect_err("ambiguous");
        match err {
            StackyardError::Config(ConfigError::AmbiguousImport { candidates, .. }) => {
                assert_eq!(candidates, vec!["Blue", "Green"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_explicit_producer_disambiguates() {
        let reg = registry(vec![
            StackConfig::new("Blue").with_export("url", "x"),
            StackConfig::new("Green").with_export("url", "y"),
            StackConfig::new("Router").with_import_from("url", "Green"),
        ]);

        let refs = ReferenceResolver::new().resolve(&reg).expect("resolves");
        assert_eq!(refs[0].producer, "Green");
    }

    #[test]
    fn test_unresolved_import() {
        let reg = registry(vec![StackConfig::new("Compute").with_import("tableName")]);

        let err = ReferenceResolver::new().resolve(&reg).expect_err("unresolved");
        assert!(matches!(
            err,
            StackyardError::Config(ConfigError::UnresolvedImport { producer: None, .. })
        ));
    }

    #[test]
    fn test_explicit_producer_missing_export() {
        let reg = registry(vec![
            StackConfig::new("Storage").with_export("bucketArn", "x"),
            StackConfig::new("Compute").with_import_from("bucketName", "Storage"),
        ]);

        let err = ReferenceResolver::new().resolve(&reg).expect_err("unresolved");
        assert!(err.to_string().contains("from 'Storage'"));
    }

    #[test]
    fn test_self_import_resolves_to_self() {
        let reg = registry(vec![
            StackConfig::new("Loop").with_export("x", "1").with_import("x"),
        ]);

        let refs = ReferenceResolver::new().resolve(&reg).expect("resolves");
        assert_eq!(refs[0].consumer, refs[0].producer);
    }
}
