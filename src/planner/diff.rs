//! Diff engine for comparing declared stacks against recorded state.
//!
//! The diff is computed without calling the backend. A stack whose imports
//! come from a producer that is about to change cannot be fingerprinted
//! yet, so it is reported as deferred.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::config::StackHasher;
use crate::graph::DependencyGraph;
use crate::stack::{StackRegistry, render_stack};
use crate::state::{DeploymentRecord, RecordStatus};

use super::plan::DeploymentPlan;

/// Engine for computing diffs between declared and recorded stacks.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: StackHasher,
    production: bool,
}

/// Type of change a deploy would make to one stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// No live deployment is recorded.
    Create,
    /// Deployed with a different fingerprint.
    Update,
    /// Deployed with the same fingerprint; deploy is a no-op.
    Unchanged,
    /// The last run left the stack failed or pending.
    Recover,
    /// Depends on an upstream stack that will change first.
    Deferred,
}

/// Difference for a single stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackDiff {
    /// Stack identifier.
    pub stack_id: String,
    /// Batch index in the deploy plan.
    pub batch: usize,
    /// Planned change; `None` when state could not be read.
    pub change: Option<ChangeKind>,
    /// Recorded fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_fingerprint: Option<String>,
    /// Fingerprint the deploy would produce, when computable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_fingerprint: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// The plan the diff annotates.
    pub plan: DeploymentPlan,
    /// Per-stack differences in plan order.
    pub stacks: Vec<StackDiff>,
    /// Recorded stacks that are no longer declared.
    pub orphans: Vec<String>,
    /// False when state was unavailable and no change could be computed.
    pub annotated: bool,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: StackHasher::new(),
            production: false,
        }
    }

    /// Sets whether removal policies resolve for production.
    #[must_use]
    pub const fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    /// Computes the diff of `plan` against recorded state.
    #[must_use]
    pub fn compute_diff(
        &self,
        registry: &StackRegistry,
        graph: &DependencyGraph,
        plan: &DeploymentPlan,
        records: &[DeploymentRecord],
    ) -> DiffResult {
        let by_id: BTreeMap<&str, &DeploymentRecord> =
            records.iter().map(|r| (r.stack_id.as_str(), r)).collect();
        let mut changes: BTreeMap<&str, ChangeKind> = BTreeMap::new();
        let mut stacks = Vec::with_capacity(plan.stack_count());

        for batch in &plan.batches {
            for id in &batch.stacks {
                let record = by_id.get(id.as_str()).copied();
                let (change, new_fingerprint) =
                    self.stack_change(registry, graph, id, record, &by_id, &changes);

                debug!(stack = %id, %change, "Computed stack change");
                changes.insert(id.as_str(), change);
                stacks.push(StackDiff {
                    stack_id: id.clone(),
                    batch: batch.index,
                    change: Some(change),
                    old_fingerprint: record.map(|r| r.fingerprint.clone()),
                    new_fingerprint,
                });
            }
        }

        let orphans = records
            .iter()
            .filter(|r| !registry.contains(&r.stack_id) && !r.is_absent())
            .map(|r| r.stack_id.clone())
            .collect();

        DiffResult {
            plan: plan.clone(),
            stacks,
            orphans,
            annotated: true,
        }
    }

    fn stack_change(
        &self,
        registry: &StackRegistry,
        graph: &DependencyGraph,
        stack_id: &str,
        record: Option<&DeploymentRecord>,
        records: &BTreeMap<&str, &DeploymentRecord>,
        changes: &BTreeMap<&str, ChangeKind>,
    ) -> (ChangeKind, Option<String>) {
        let Some(record) = record.filter(|r| !r.is_absent()) else {
            return (ChangeKind::Create, None);
        };
        if matches!(record.status, RecordStatus::Failed | RecordStatus::Pending) {
            return (ChangeKind::Recover, None);
        }

        let mut imports = BTreeMap::new();
        for reference in graph.references_for(stack_id) {
            if changes.get(reference.producer.as_str()) != Some(&ChangeKind::Unchanged) {
                return (ChangeKind::Deferred, None);
            }
            let value = records
                .get(reference.producer.as_str())
                .and_then(|r| r.exports.get(&reference.export));
            match value {
                Some(value) => {
                    imports.insert(reference.export.clone(), value.clone());
                }
                None => return (ChangeKind::Deferred, None),
            }
        }

        let Some(stack) = registry.get(stack_id) else {
            return (ChangeKind::Deferred, None);
        };
        let removal = stack.removal_policy.resolve(self.production);
        let Ok(resolved) = render_stack(stack, &imports, removal) else {
            return (ChangeKind::Deferred, None);
        };
        let fingerprint = self.hasher.fingerprint(&resolved);

        let change = if StackHasher::hashes_match(&record.fingerprint, &fingerprint) {
            ChangeKind::Unchanged
        } else {
            ChangeKind::Update
        };
        (change, Some(fingerprint))
    }
}

impl DiffResult {
    /// Wraps a plan whose stacks could not be compared against state.
    #[must_use]
    pub fn unannotated(plan: &DeploymentPlan) -> Self {
        let stacks = plan
            .batches
            .iter()
            .flat_map(|batch| {
                batch.stacks.iter().map(|id| StackDiff {
                    stack_id: id.clone(),
                    batch: batch.index,
                    change: None,
                    old_fingerprint: None,
                    new_fingerprint: None,
                })
            })
            .collect();

        Self {
            plan: plan.clone(),
            stacks,
            orphans: Vec::new(),
            annotated: false,
        }
    }

    /// Counts stacks with the given change.
    #[must_use]
    pub fn count(&self, change: ChangeKind) -> usize {
        self.stacks
            .iter()
            .filter(|s| s.change == Some(change))
            .count()
    }

    /// Returns the change planned for one stack.
    #[must_use]
    pub fn change_of(&self, stack_id: &str) -> Option<ChangeKind> {
        self.stacks
            .iter()
            .find(|s| s.stack_id == stack_id)
            .and_then(|s| s.change)
    }

    /// Returns true if a deploy would do anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.annotated
            || !self.orphans.is_empty()
            || self
                .stacks
                .iter()
                .any(|s| s.change != Some(ChangeKind::Unchanged))
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Unchanged => "unchanged",
            Self::Recover => "recover",
            Self::Deferred => "deferred",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for StackDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.change {
            Some(change) => write!(f, "{}: {change}", self.stack_id),
            None => write!(f, "{}", self.stack_id),
        }
    }
}
