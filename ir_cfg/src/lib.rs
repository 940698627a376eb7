//! Structured control-flow graph IR.
//!
//! A [`Function`] is an arena of nodes linked by `next`/`prev` edges.
//! Structured constructs (`block`, `loop`, `if` and the function body) are
//! paired with their `end`. Graphs are created with [`FunctionBuilder`] and
//! rewritten in place by the passes.
mod builder;
mod counts;
mod error;
mod graph;
mod pretty;
mod syntax;
mod verify;

pub use builder::FunctionBuilder;
pub use counts::{node_accesses, Access};
pub use error::IrError;
pub use pretty::NodeDisplay;
pub use syntax::*;
