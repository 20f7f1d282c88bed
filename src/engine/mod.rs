//! Execution engine for forma
//!
//! The engine ties the reconciler to the command line:
//! 1. Loading - Read settings and declarations, resolve the state directory
//! 2. Validating - Check declarations against the built-in kinds, build the graph
//! 3. Displaying - Render plans, apply reports and state

pub mod display;
pub mod project;

pub use project::{Project, Validated};
