//! Dependency graph construction and cycle detection.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::stack::StackRegistry;

use super::resolver::Reference;

/// Directed graph over stacks. Edges point from producer to consumer.
///
/// A `DependencyGraph` can only be obtained through [`GraphBuilder::build`]
/// or [`DependencyGraph::subgraph`], so it is always acyclic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    successors: BTreeMap<String, BTreeSet<String>>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
    references: Vec<Reference>,
}

/// Builds dependency graphs from references and explicit predecessors.
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph and rejects cycles.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDependency` for a `depends_on` entry naming an
    /// undeclared stack, or `CyclicDependency` with the cycle's members in
    /// edge order.
    pub fn build(
        &self,
        registry: &StackRegistry,
        references: Vec<Reference>,
    ) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::default();
        for id in registry.ids() {
            graph.add_node(id);
        }

        for reference in &references {
            graph.add_edge(&reference.producer, &reference.consumer);
        }

        for stack in registry.iter() {
            for dependency in &stack.depends_on {
                if !registry.contains(dependency) {
                    return Err(ConfigError::UnknownDependency {
                        stack_id: stack.id.clone(),
                        dependency: dependency.clone(),
                    }
                    .into());
                }
                graph.add_edge(dependency, &stack.id);
            }
        }

        graph.references = references;

        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigError::CyclicDependency { cycle }.into());
        }

        debug!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            "Built dependency graph"
        );
        Ok(graph)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Finished,
}

impl DependencyGraph {
    fn add_node(&mut self, id: &str) {
        self.successors.entry(id.to_string()).or_default();
        self.predecessors.entry(id.to_string()).or_default();
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        if let Some(next) = self.successors.get_mut(from) {
            next.insert(to.to_string());
        }
        if let Some(prev) = self.predecessors.get_mut(to) {
            prev.insert(from.to_string());
        }
    }

    /// Depth-first search over nodes in identifier order. Returns the path
    /// from the back-edge target to the node that closes the loop.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: BTreeMap<&str, Visit> = BTreeMap::new();
        let mut path: Vec<&str> = Vec::new();

        for start in self.successors.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut BTreeMap<&'a str, Visit>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Visit::InProgress);
        path.push(node);

        for next in self.successors.get(node).into_iter().flatten() {
            match marks.get(next.as_str()) {
                Some(Visit::InProgress) => {
                    let start = path.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                    return Some(path[start..].iter().map(|n| (*n).to_string()).collect());
                }
                Some(Visit::Finished) => {}
                None => {
                    if let Some(cycle) = self.visit(next, marks, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        marks.insert(node, Visit::Finished);
        None
    }

    /// Returns all stack identifiers in lexicographic order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.successors.keys().map(String::as_str)
    }

    /// Returns true if the graph contains the stack.
    #[must_use]
    pub fn contains(&self, stack_id: &str) -> bool {
        self.successors.contains_key(stack_id)
    }

    /// Returns the number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.successors.len()
    }

    /// Returns true if the graph has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.successors.is_empty()
    }

    /// Returns the number of distinct edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.successors.values().map(BTreeSet::len).sum()
    }

    /// Returns every edge as `(producer, consumer)`.
    #[must_use]
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.successors
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(move |to| (from.as_str(), to.as_str())))
            .collect()
    }

    /// Direct predecessors of a stack.
    pub fn predecessors(&self, stack_id: &str) -> impl Iterator<Item = &str> {
        self.predecessors
            .get(stack_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct successors of a stack.
    pub fn successors(&self, stack_id: &str) -> impl Iterator<Item = &str> {
        self.successors
            .get(stack_id)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Transitive predecessors of the given stacks, excluding the stacks themselves
    /// unless they are reachable from another member.
    #[must_use]
    pub fn ancestors<'a>(&self, stack_ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        self.reach(stack_ids, &self.predecessors)
    }

    /// Transitive successors of the given stacks.
    #[must_use]
    pub fn descendants<'a>(
        &self,
        stack_ids: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        self.reach(stack_ids, &self.successors)
    }

    fn reach<'a>(
        &self,
        stack_ids: impl IntoIterator<Item = &'a str>,
        adjacency: &BTreeMap<String, BTreeSet<String>>,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<&str> = stack_ids.into_iter().collect();

        while let Some(id) = queue.pop() {
            for next in adjacency.get(id).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push(next);
                }
            }
        }
        seen
    }

    /// Restricts the graph to the given stacks, keeping edges among them.
    #[must_use]
    pub fn subgraph(&self, keep: &BTreeSet<String>) -> Self {
        let mut graph = Self::default();
        for id in keep.iter().filter(|id| self.contains(id)) {
            graph.add_node(id);
            for next in self.successors(id).filter(|n| keep.contains(*n)) {
                graph.add_edge(id, next);
            }
        }
        graph.references = self
            .references
            .iter()
            .filter(|r| keep.contains(&r.consumer) && keep.contains(&r.producer))
            .cloned()
            .collect();
        graph
    }

    /// References whose consumer is the given stack.
    pub fn references_for<'a>(&'a self, consumer: &'a str) -> impl Iterator<Item = &'a Reference> {
        self.references.iter().filter(move |r| r.consumer == consumer)
    }

    /// All references in the graph.
    #[must_use]
    pub fn references(&self) -> &[Reference] {
        &self.references
    }
}
