use crate::{index::vec::Idx, BitVec, SetLikeVec};

use super::{DirectedGraph, StartNode, Successors};

pub struct DepthFirstSearch<'graph, G>
where
    G: DirectedGraph + Successors,
{
    graph: &'graph G,
    stack: SetLikeVec<G::Node>,
    visited: BitVec<usize>,
}

impl<'graph, G> DepthFirstSearch<'graph, G>
where
    G: DirectedGraph + Successors,
{
    pub fn new(graph: &'graph G) -> Self {
        Self {
            graph,
            stack: SetLikeVec::new(),
            visited: BitVec::repeat(false, graph.num_nodes()),
        }
    }

    pub fn run_from(&mut self, start: G::Node, visitor: &mut impl DepthFirstSearchVisitor<G>) {
        if self.visited[start.index()] {
            return;
        }
        self.visit(start);
        visitor.visit_node(self, start, None);

        while let Some(node) = self.stack.pop() {
            for succ in self.graph.successors(node) {
                if !self.visited[succ.index()] {
                    self.visit(succ);
                    visitor.visit_node(self, succ, Some(node));
                }
            }
        }
    }

    fn visit(&mut self, node: G::Node) {
        self.stack.push(node);
        self.visited.set(node.index(), true);
    }

    pub fn stack(&self) -> &SetLikeVec<G::Node> {
        &self.stack
    }

    /// Nodes seen so far, indexed by `Idx::index`.
    pub fn visited(&self) -> &BitVec<usize> {
        &self.visited
    }

    pub fn is_visited(&self, node: G::Node) -> bool {
        self.visited[node.index()]
    }
}

impl<G> DepthFirstSearch<'_, G>
where
    G: DirectedGraph + Successors + StartNode,
{
    pub fn run(&mut self, visitor: &mut impl DepthFirstSearchVisitor<G>) {
        self.run_from(self.graph.start_node(), visitor);
    }
}

pub trait DepthFirstSearchVisitor<G: DirectedGraph + Successors> {
    fn visit_node(&mut self, search: &DepthFirstSearch<G>, node: G::Node, pred: Option<G::Node>);
}

/// A visitor that only records the order in which nodes are discovered.
#[derive(Default)]
pub struct DiscoveryOrder<N> {
    pub order: Vec<N>,
}

impl<G: DirectedGraph + Successors> DepthFirstSearchVisitor<G> for DiscoveryOrder<G::Node> {
    fn visit_node(&mut self, _search: &DepthFirstSearch<G>, node: G::Node, _pred: Option<G::Node>) {
        self.order.push(node);
    }
}

/// All nodes reachable from the start node, in discovery order.
pub fn reachable<G>(graph: &G) -> Vec<G::Node>
where
    G: DirectedGraph + Successors + StartNode,
{
    let mut order = DiscoveryOrder { order: Vec::new() };
    DepthFirstSearch::new(graph).run(&mut order);
    order.order
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Adjacency(Vec<Vec<usize>>);

    impl DirectedGraph for Adjacency {
        type Node = usize;

        fn num_nodes(&self) -> usize {
            self.0.len()
        }
    }

    impl StartNode for Adjacency {
        fn start_node(&self) -> usize {
            0
        }
    }

    impl Successors for Adjacency {
        fn successors(&self, node: usize) -> impl Iterator<Item = usize> {
            self.0[node].iter().copied()
        }
    }

    #[test]
    fn reachable_ignores_disconnected_nodes() {
        let graph = Adjacency(vec![vec![1, 2], vec![2], vec![0], vec![1]]);
        let mut nodes = reachable(&graph);
        nodes.sort();
        assert_eq!(nodes, vec![0, 1, 2]);
    }
}
