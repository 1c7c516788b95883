//! Dependency discovery.
//!
//! The resolver turns imports into typed references, and the builder turns
//! references plus explicit `depends_on` declarations into an acyclic graph.
//! Both passes are pure and run before any backend call.

mod builder;
mod resolver;

pub use builder::{DependencyGraph, GraphBuilder};
pub use resolver::{Reference, ReferenceResolver};
