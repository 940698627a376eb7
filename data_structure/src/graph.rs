//! Minimal directed-graph interface over typed node indices.
//!
//! Both the IR itself (structural edges) and analysis views over it (flow
//! edges) implement these traits, so the traversals in [`traversal`] work on
//! either.
pub mod traversal;

use crate::index;

pub trait DirectedGraph {
    type Node: index::vec::Idx;

    /// Upper bound of node indices, including removed nodes.
    fn num_nodes(&self) -> usize;
}

pub trait StartNode: DirectedGraph {
    fn start_node(&self) -> Self::Node;
}

pub trait Successors: DirectedGraph {
    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node>;
}

pub trait Predecessors: DirectedGraph {
    fn predecessors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node>;
}
