//! Planning and execution of deployment runs.
//!
//! This module turns a dependency graph into batched plans, compares them
//! against recorded state, and executes them against a provisioning backend.

mod diff;
mod executor;
mod plan;
mod report;
mod rollback;
mod signal;

pub use diff::{ChangeKind, DiffEngine, DiffResult, StackDiff};
pub use executor::DeploymentExecutor;
pub use plan::{Batch, DeploymentPlan, PlanDirection};
pub use report::{Operation, RunOutcome, RunReport, StackReport, StackStatus};
pub use rollback::rollback_scope;
pub use signal::RunSignal;
