//! Task graph: typed nodes, precedence edges, and the compiler that
//! lowers a collection tree into them

pub mod compiler;
pub mod node;

pub use compiler::compile;
pub use node::{NodeKind, ScriptNode, TaskGraph, TaskNode};
