//! Deployment plan types and construction.
//!
//! A plan is an ordered sequence of batches computed with Kahn's algorithm:
//! each batch holds every stack whose predecessors all lie in earlier
//! batches, sorted by identifier. The teardown plan is the same batches in
//! reverse order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::DependencyGraph;

/// Whether a plan provisions or tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanDirection {
    /// Predecessors first.
    Deploy,
    /// Dependents first.
    Destroy,
}

/// A set of mutually independent stacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    /// Position in the plan, starting at 0.
    pub index: usize,
    /// Stack identifiers in lexicographic order.
    pub stacks: Vec<String>,
}

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Execution direction.
    pub direction: PlanDirection,
    /// Batches in execution order.
    pub batches: Vec<Batch>,
}

impl DeploymentPlan {
    /// Computes the deploy plan for an acyclic graph.
    #[must_use]
    pub fn from_graph(graph: &DependencyGraph) -> Self {
        let mut in_degree: BTreeMap<&str, usize> = graph
            .nodes()
            .map(|id| (id, graph.predecessors(id).count()))
            .collect();

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut batches = Vec::new();

        while !ready.is_empty() {
            ready.sort_unstable();
            let mut next = Vec::new();

            for id in &ready {
                for successor in graph.successors(id) {
                    if let Some(degree) = in_degree.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(successor);
                        }
                    }
                }
            }

            batches.push(Batch {
                index: batches.len(),
                stacks: ready.iter().map(|s| (*s).to_string()).collect(),
            });
            ready = next;
        }

        Self {
            created_at: Utc::now(),
            direction: PlanDirection::Deploy,
            batches,
        }
    }

    /// Returns the teardown plan: the same batches in reverse order.
    #[must_use]
    pub fn teardown(&self) -> Self {
        let batches = self
            .batches
            .iter()
            .rev()
            .enumerate()
            .map(|(index, batch)| Batch {
                index,
                stacks: batch.stacks.clone(),
            })
            .collect();

        Self {
            created_at: Utc::now(),
            direction: PlanDirection::Destroy,
            batches,
        }
    }

    /// Inserts `stacks` as a new first batch and renumbers the rest.
    /// An empty list leaves the plan unchanged.
    #[must_use]
    pub fn with_leading_batch(mut self, mut stacks: Vec<String>) -> Self {
        if stacks.is_empty() {
            return self;
        }
        stacks.sort_unstable();
        stacks.dedup();

        self.batches.insert(0, Batch { index: 0, stacks });
        for (index, batch) in self.batches.iter_mut().enumerate() {
            batch.index = index;
        }
        self
    }

    /// Returns the batch index of a stack.
    #[must_use]
    pub fn batch_of(&self, stack_id: &str) -> Option<usize> {
        self.batches
            .iter()
            .find(|b| b.stacks.iter().any(|s| s == stack_id))
            .map(|b| b.index)
    }

    /// Iterates over stack identifiers in execution order.
    pub fn stacks(&self) -> impl Iterator<Item = &str> {
        self.batches
            .iter()
            .flat_map(|b| b.stacks.iter().map(String::as_str))
    }

    /// Returns true if the plan has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Returns the number of stacks across all batches.
    #[must_use]
    pub fn stack_count(&self) -> usize {
        self.batches.iter().map(|b| b.stacks.len()).sum()
    }
}

impl std::fmt::Display for PlanDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.batches.is_empty() {
            return write!(f, "No stacks to {}", self.direction);
        }

        writeln!(
            f,
            "{} plan ({} stacks in {} batches):",
            self.direction,
            self.stack_count(),
            self.batches.len()
        )?;
        for batch in &self.batches {
            writeln!(f, "  batch {}: {}", batch.index + 1, batch.stacks.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::graph::{GraphBuilder, ReferenceResolver};
    use crate::stack::StackRegistry;

    fn plan(stacks: Vec<StackConfig>) -> (DependencyGraph, DeploymentPlan) {
        let registry = StackRegistry::new(stacks).expect("registry");
        let refs = ReferenceResolver::new().resolve(&registry).expect("refs");
        let graph = GraphBuilder::new().build(&registry, refs).expect("graph");
        let plan = DeploymentPlan::from_graph(&graph);
        (graph, plan)
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.stacks.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_storage_then_compute() {
        let (_, plan) = plan(vec![
            StackConfig::new("Compute").with_import_from("bucketArn", "Storage"),
            StackConfig::new("Storage").with_export("bucketArn", "${bucket.arn}"),
        ]);

        assert_eq!(plan.batches.len(), 2);
        assert_eq!(ids(&plan.batches[0]), vec!["Storage"]);
        assert_eq!(ids(&plan.batches[1]), vec!["Compute"]);
    }

    #[test]
    fn test_earliest_batch_and_lexicographic_order() {
        let (graph, plan) = plan(vec![
            StackConfig::new("Storage").with_export("bucketArn", "x"),
            StackConfig::new("Table").with_export("tableName", "t"),
            StackConfig::new("Roles").with_import("bucketArn").with_import("tableName"),
            StackConfig::new("Lambda").with_import("bucketArn").with_depends_on("Roles"),
            StackConfig::new("Events"),
            StackConfig::new("Alarms").with_depends_on("Lambda"),
        ]);

        assert_eq!(ids(&plan.batches[0]), vec!["Events", "Storage", "Table"]);
        assert_eq!(ids(&plan.batches[1]), vec!["Roles"]);
        assert_eq!(ids(&plan.batches[2]), vec!["Lambda"]);
        assert_eq!(ids(&plan.batches[3]), vec!["Alarms"]);
        assert_eq!(plan.stack_count(), 6);

        for (from, to) in graph.edges() {
            assert!(plan.batch_of(from) < plan.batch_of(to), "{from} -> {to}");
        }
    }

    #[test]
    fn test_teardown_reverses_batches() {
        let (graph, plan) = plan(vec![
            StackConfig::new("A"),
            StackConfig::new("B").with_depends_on("A"),
            StackConfig::new("C").with_depends_on("A"),
            StackConfig::new("D").with_depends_on("B"),
        ]);

        let teardown = plan.teardown();
        assert_eq!(teardown.direction, PlanDirection::Destroy);
        assert_eq!(ids(&teardown.batches[0]), vec!["D"]);
        assert_eq!(ids(&teardown.batches[1]), vec!["B", "C"]);
        assert_eq!(ids(&teardown.batches[2]), vec!["A"]);

        for (from, to) in graph.edges() {
            assert!(teardown.batch_of(to) < teardown.batch_of(from));
        }
    }

    #[test]
    fn test_leading_batch_renumbers() {
        let (_, plan) = plan(vec![StackConfig::new("A"), StackConfig::new("B").with_depends_on("A")]);
        let teardown = plan
            .teardown()
            .with_leading_batch(vec![String::from("Legacy"), String::from("Audit")]);

        assert_eq!(ids(&teardown.batches[0]), vec!["Audit", "Legacy"]);
        assert_eq!(ids(&teardown.batches[1]), vec!["B"]);
        assert_eq!(teardown.batch_of("A"), Some(2));
        assert_eq!(teardown.direction, PlanDirection::Destroy);

        let unchanged = teardown.clone().with_leading_batch(Vec::new());
        assert_eq!(unchanged.batches, teardown.batches);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let stacks = || {
            vec![
                StackConfig::new("Zeta"),
                StackConfig::new("Alpha"),
                StackConfig::new("Mid").with_depends_on("Zeta"),
            ]
        };
        let (_, first) = plan(stacks());
        let (_, second) = plan(stacks().into_iter().rev().collect());
        assert_eq!(first.batches, second.batches);
    }

    #[test]
    fn test_empty_graph() {
        let plan = DeploymentPlan::from_graph(&DependencyGraph::default());
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No stacks to deploy");
    }
}
