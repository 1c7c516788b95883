//! Rollback scope.
//!
//! Rollback tears down stacks created by the failed run. A candidate is kept
//! if anything still alive outside the rollback set depends on it; keeping a
//! candidate makes it alive in turn, so the check runs to a fixpoint.

use std::collections::BTreeSet;

use crate::graph::DependencyGraph;

/// Shrinks `candidates` until no member has a live dependent outside the set.
///
/// `live` holds every non-candidate stack whose deployment must survive.
/// A candidate dropped from the scope counts as live from then on.
#[must_use]
pub fn rollback_scope(
    graph: &DependencyGraph,
    candidates: BTreeSet<String>,
    live: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut scope = candidates.clone();

    loop {
        let kept: Vec<String> = scope
            .iter()
            .filter(|id| {
                graph
                    .successors(id)
                    .any(|s| !scope.contains(s) && (live.contains(s) || candidates.contains(s)))
            })
            .cloned()
            .collect();

        if kept.is_empty() {
            return scope;
        }
        for id in kept {
            scope.remove(&id);
        }
    }
}
