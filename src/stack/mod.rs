//! Stack registry and rendering.
//!
//! Declarations are immutable once loaded. The registry answers lookups and
//! rendering binds resolved import values into a stack's resource specs.

mod registry;
mod render;

pub use registry::StackRegistry;
pub use render::{ResolvedStack, import_placeholders, render_stack};
