// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackyard
//!
//! Cross-stack dependency resolution and deployment ordering for
//! interdependent infrastructure stacks.
//!
//! ## Overview
//!
//! Stacks are declared as plain data: resources, named exports, and imports
//! of other stacks' exports. Stackyard wires them together and deploys them:
//!
//! - Resolve every import to exactly one producer export
//! - Build the dependency graph and reject cycles before any backend call
//! - Plan deterministic batches (Kahn's algorithm, lexicographic within a batch)
//! - Execute batches in order, stacks within a batch concurrently
//! - Skip stacks whose fingerprint matches a deployed record
//! - Roll back stacks created by a failed run when nothing live needs them
//!
//! ## Architecture
//!
//! 1. **Registry**: declared stacks keyed by identifier
//! 2. **Resolver / Graph Builder**: references and the acyclic dependency graph
//! 3. **Planner**: deploy plan and reverse teardown plan
//! 4. **Executor**: provisioning through a [`backend::ProvisioningBackend`],
//!    with results persisted to a [`state::StateStore`]
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, validation, fingerprints
//! - [`stack`]: Stack registry and import rendering
//! - [`graph`]: Reference resolution and dependency graph
//! - [`planner`]: Plans, diffs, execution, rollback, run reports
//! - [`backend`]: Provisioning backends (HTTP, local simulation)
//! - [`state`]: Deployment record stores (local, S3, memory)
//! - [`orchestrator`]: End-to-end diff, deploy and destroy
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: size-tracker
//!   environment: prod
//!
//! stacks:
//!   - id: Storage
//!     resources:
//!       - name: bucket
//!         kind: object-store
//!     exports:
//!       bucketArn: "${bucket.arn}"
//!     removal_policy: retain_in_production
//!
//!   - id: Compute
//!     imports:
//!       - name: bucketArn
//!     resources:
//!       - name: tracker
//!         kind: function
//!         properties:
//!           bucket: "${imports.bucketArn}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod planner;
pub mod stack;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{HttpBackend, LocalBackend, ProvisioningBackend, RetryPolicy};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, StackHasher, StackyardConfig};
pub use error::{Result, StackyardError};
pub use graph::{DependencyGraph, GraphBuilder, ReferenceResolver};
pub use orchestrator::{Orchestrator, Prepared};
pub use planner::{DeploymentExecutor, DeploymentPlan, DiffEngine, RunReport, RunSignal};
pub use stack::StackRegistry;
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
