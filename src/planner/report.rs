//! Run reports.
//!
//! Every stack in a plan ends a run with exactly one terminal status; the
//! run outcome aggregates them.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The kind of run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create or update stacks.
    Deploy,
    /// Tear stacks down.
    Destroy,
}

/// Terminal status of a stack within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Provisioned by this run.
    Deployed,
    /// Fingerprint matched a deployed record; no backend call.
    Unchanged,
    /// Provisioning or teardown failed.
    Failed,
    /// Not started because a sibling in the same batch failed.
    Cancelled,
    /// Its batch was never reached.
    NotStarted,
    /// Deployed by this run, then torn down by rollback.
    RolledBack,
    /// Rollback teardown failed; needs operator attention.
    RollbackFailed,
    /// Torn down by destroy.
    Destroyed,
    /// Nothing recorded to tear down.
    AlreadyAbsent,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stack reached its goal.
    Succeeded,
    /// Stacks failed and this run's affected deployments were rolled back.
    RolledBack {
        /// Stacks whose provisioning failed.
        failed: Vec<String>,
    },
    /// Rollback itself failed for some stacks.
    PartialRollbackFailure {
        /// Stacks left in an indeterminate state.
        stacks: Vec<String>,
    },
    /// The run was cancelled before finishing.
    Cancelled {
        /// Why the run was cancelled.
        reason: String,
    },
    /// Teardown failed for some stacks.
    DestroyFailed {
        /// Stacks that could not be torn down.
        stacks: Vec<String>,
    },
}

/// Per-stack entry of a run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackReport {
    /// Stack identifier.
    pub stack_id: String,
    /// Batch index in the executed plan.
    pub batch: usize,
    /// Terminal status.
    pub status: StackStatus,
    /// Backend calls made, including retries.
    pub attempts: u32,
    /// Error message, if the stack failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a deploy or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,
    /// What the run did.
    pub operation: Operation,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Aggregate outcome.
    pub outcome: RunOutcome,
    /// Per-stack results in plan order.
    pub stacks: Vec<StackReport>,
}

impl StackStatus {
    /// Returns true for statuses that make a run unsuccessful.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::RollbackFailed)
    }
}

impl RunReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Returns the report for one stack.
    #[must_use]
    pub fn stack(&self, stack_id: &str) -> Option<&StackReport> {
        self.stacks.iter().find(|s| s.stack_id == stack_id)
    }

    /// Returns the status of one stack.
    #[must_use]
    pub fn status_of(&self, stack_id: &str) -> Option<StackStatus> {
        self.stack(stack_id).map(|s| s.status)
    }

    /// Counts stacks with the given status.
    #[must_use]
    pub fn count(&self, status: StackStatus) -> usize {
        self.stacks.iter().filter(|s| s.status == status).count()
    }

    /// Total backend attempts across the run.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.stacks.iter().map(|s| s.attempts).sum()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deployed => "deployed",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::NotStarted => "not started",
            Self::RolledBack => "rolled back",
            Self::RollbackFailed => "rollback failed",
            Self::Destroyed => "destroyed",
            Self::AlreadyAbsent => "already absent",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::RolledBack { failed } => {
                write!(f, "failed ({}), rolled back", failed.join(", "))
            }
            Self::PartialRollbackFailure { stacks } => write!(
                f,
                "partial rollback failure; operator intervention required for: {}",
                stacks.join(", ")
            ),
            Self::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            Self::DestroyFailed { stacks } => {
                write!(f, "destroy failed for: {}", stacks.join(", "))
            }
        }
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} stacks ({} deployed, {} unchanged, {} destroyed, {} rolled back, {} failed)",
            self.operation,
            self.outcome,
            self.stacks.len(),
            self.count(StackStatus::Deployed),
            self.count(StackStatus::Unchanged),
            self.count(StackStatus::Destroyed),
            self.count(StackStatus::RolledBack),
            self.stacks.iter().filter(|s| s.status.is_failure()).count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_serialization() {
        let outcome = RunOutcome::PartialRollbackFailure {
            stacks: vec![String::from("Storage")],
        };
        assert_eq!(
            serde_json::to_value(&outcome).expect("serialize"),
            json!({ "kind": "partial_rollback_failure", "stacks": ["Storage"] })
        );
        assert_eq!(
            serde_json::to_value(RunOutcome::Succeeded).expect("serialize"),
            json!({ "kind": "succeeded" })
        );
    }

    #[test]
    fn test_failure_statuses() {
        assert!(StackStatus::Failed.is_failure());
        assert!(StackStatus::RollbackFailed.is_failure());
        assert!(!StackStatus::Cancelled.is_failure());
        assert!(!StackStatus::RolledBack.is_failure());
    }
}
