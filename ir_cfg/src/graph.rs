//! Graph view of a [`Function`] and edge surgery.
//!
//! Edges are kept symmetric: the k-th occurrence of `b` in `a.next`
//! corresponds to the k-th occurrence of `a` in `b.prev`. An `if` with two
//! empty branches is linked to its `end` twice.
use data_structure::graph::{self, traversal};

use crate::{Function, IrError, NodeId, NodeKind};

impl graph::DirectedGraph for Function {
    type Node = NodeId;

    fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

impl graph::StartNode for Function {
    fn start_node(&self) -> Self::Node {
        self.entry
    }
}

impl graph::Successors for Function {
    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> {
        self.nodes[node].next().iter().copied()
    }
}

impl graph::Predecessors for Function {
    fn predecessors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> {
        self.nodes[node].prev().iter().copied()
    }
}

fn nth_position(edges: &[NodeId], target: NodeId, nth: usize) -> Option<usize> {
    edges
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == target)
        .nth(nth)
        .map(|(i, _)| i)
}

fn occurrences_before(edges: &[NodeId], target: NodeId, slot: usize) -> usize {
    edges[..slot].iter().filter(|n| **n == target).count()
}

impl Function {
    /// Nodes of the instruction stream in discovery order, starting at `define`.
    /// Sub-expressions are not included.
    pub fn live_nodes(&self) -> Vec<NodeId> {
        traversal::reachable(self)
    }

    /// The depth every live `br`/`br_if` must carry, derived from the
    /// constructs enclosing it. `None` if the target does not enclose it.
    pub fn branch_depths(&self) -> Vec<(NodeId, Option<usize>)> {
        let mut out = Vec::new();
        let mut open = vec![self.entry];
        self.collect_branch_depths(self.nodes[self.entry].first_next(), self.exit(), &mut open, &mut out);
        out
    }

    fn collect_branch_depths(
        &self,
        start: Option<NodeId>,
        stop: NodeId,
        open: &mut Vec<NodeId>,
        out: &mut Vec<(NodeId, Option<usize>)>,
    ) {
        let mut n = start;
        while let Some(node) = n.filter(|n| *n != stop) {
            let data = &self.nodes[node];
            if let NodeKind::Br(b) | NodeKind::BrIf(b) = &data.kind {
                out.push((node, open.iter().rev().position(|o| *o == b.target)));
            }
            n = match data.kind.construct() {
                Some(c) => {
                    open.push(node);
                    for &first in data.next() {
                        self.collect_branch_depths(Some(first), c.end, open, out);
                    }
                    open.pop();
                    self.nodes[c.end].first_next()
                }
                None => data.first_next(),
            };
        }
    }

    /// Re-encodes branch depths after enclosing constructs were removed.
    pub fn renumber_branches(&mut self) -> Result<(), IrError> {
        for (node, depth) in self.branch_depths() {
            let (NodeKind::Br(b) | NodeKind::BrIf(b)) = &mut self.nodes[node].kind else {
                continue;
            };
            b.depth = depth.ok_or(IrError::BranchTargetUnreachable { target: b.target })?;
        }
        Ok(())
    }

    pub(crate) fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].next_mut().push(to);
        self.nodes[to].prev_mut().push(from);
    }

    /// Splices the detached node `new` onto the edge `from.next[next_slot]`.
    pub fn insert_after_slot(
        &mut self,
        from: NodeId,
        next_slot: usize,
        new: NodeId,
    ) -> Result<(), IrError> {
        let to = *self.nodes[from]
            .next()
            .get(next_slot)
            .ok_or_else(|| IrError::malformed(from, format!("no successor {next_slot}")))?;
        let nth = occurrences_before(self.nodes[from].next(), to, next_slot);
        let prev_slot = nth_position(self.nodes[to].prev(), from, nth)
            .ok_or_else(|| IrError::malformed(to, "asymmetric edge"))?;
        self.splice(from, next_slot, to, prev_slot, new);
        Ok(())
    }

    /// Splices the detached node `new` onto the edge `to.prev[prev_slot]`.
    pub fn insert_before_slot(
        &mut self,
        to: NodeId,
        prev_slot: usize,
        new: NodeId,
    ) -> Result<(), IrError> {
        let from = *self.nodes[to]
            .prev()
            .get(prev_slot)
            .ok_or_else(|| IrError::malformed(to, format!("no predecessor {prev_slot}")))?;
        let nth = occurrences_before(self.nodes[to].prev(), from, prev_slot);
        let next_slot = nth_position(self.nodes[from].next(), to, nth)
            .ok_or_else(|| IrError::malformed(from, "asymmetric edge"))?;
        self.splice(from, next_slot, to, prev_slot, new);
        Ok(())
    }

    /// Splices `new` onto the first edge from `from` to `to`.
    pub fn insert_between(&mut self, from: NodeId, to: NodeId, new: NodeId) -> Result<(), IrError> {
        let next_slot = nth_position(self.nodes[from].next(), to, 0)
            .ok_or_else(|| IrError::malformed(from, format!("no edge to {to:?}")))?;
        self.insert_after_slot(from, next_slot, new)
    }

    /// Splices `new` between `node` and its first predecessor.
    pub fn insert_before(&mut self, node: NodeId, new: NodeId) -> Result<(), IrError> {
        self.insert_before_slot(node, 0, new)
    }

    /// Splices `new` between `node` and its first successor.
    pub fn insert_after(&mut self, node: NodeId, new: NodeId) -> Result<(), IrError> {
        self.insert_after_slot(node, 0, new)
    }

    fn splice(&mut self, from: NodeId, next_slot: usize, to: NodeId, prev_slot: usize, new: NodeId) {
        self.nodes[from].next_mut()[next_slot] = new;
        self.nodes[to].prev_mut()[prev_slot] = new;
        let data = &mut self.nodes[new];
        data.prev_mut().push(from);
        data.next_mut().push(to);
    }

    /// Unlinks a node with at most one predecessor and one successor and
    /// connects them directly. Counts are left untouched.
    pub fn remove_node(&mut self, node: NodeId) -> Result<(), IrError> {
        let (preds, succs) = (self.nodes[node].prev().len(), self.nodes[node].next().len());
        if preds > 1 || succs > 1 {
            return Err(IrError::IllegalRemoval { node, preds, succs });
        }
        let pred = self.nodes[node].first_prev();
        let succ = self.nodes[node].first_next();
        if let Some(succ) = succ {
            let prev = self.nodes[succ].prev_mut();
            match pred {
                Some(pred) => prev.iter_mut().filter(|n| **n == node).for_each(|n| *n = pred),
                None => prev.retain(|n| *n != node),
            }
        }
        if let Some(pred) = pred {
            let next = self.nodes[pred].next_mut();
            match succ {
                Some(succ) => next.iter_mut().filter(|n| **n == node).for_each(|n| *n = succ),
                None => next.retain(|n| *n != node),
            }
        }
        let data = &mut self.nodes[node];
        data.prev_mut().clear();
        data.next_mut().clear();
        Ok(())
    }

    /// Unlinks the strain `first..=last` and connects its single predecessor
    /// to its single successor. Counts are left untouched.
    pub fn unlink_range(&mut self, first: NodeId, last: NodeId) -> Result<(), IrError> {
        let pred = match self.nodes[first].prev() {
            [pred] => *pred,
            prev => {
                return Err(IrError::IllegalRemoval {
                    node: first,
                    preds: prev.len(),
                    succs: self.nodes[first].next().len(),
                })
            }
        };
        let succ = match self.nodes[last].next() {
            [succ] => *succ,
            next => {
                return Err(IrError::IllegalRemoval {
                    node: last,
                    preds: self.nodes[last].prev().len(),
                    succs: next.len(),
                })
            }
        };
        let next_slot = nth_position(self.nodes[pred].next(), first, 0)
            .ok_or_else(|| IrError::malformed(pred, "asymmetric edge"))?;
        let prev_slot = nth_position(self.nodes[succ].prev(), last, 0)
            .ok_or_else(|| IrError::malformed(succ, "asymmetric edge"))?;
        self.nodes[pred].next_mut()[next_slot] = succ;
        self.nodes[succ].prev_mut()[prev_slot] = pred;
        self.nodes[first].prev_mut().clear();
        self.nodes[last].next_mut().clear();
        Ok(())
    }

    /// Exchanges the then and else branch of an `if`.
    pub fn swap_branches(&mut self, if_node: NodeId) -> Result<(), IrError> {
        let end = self.two_armed_end(if_node)?;
        self.nodes[if_node].next_mut().swap(0, 1);
        self.nodes[end].prev_mut().swap(0, 1);
        Ok(())
    }

    /// Disconnects the else branch of an `if`. The branch's nodes become
    /// unreachable; their counts must have been released by the caller.
    pub fn drop_else(&mut self, if_node: NodeId) -> Result<(), IrError> {
        let end = self.two_armed_end(if_node)?;
        self.nodes[if_node].next_mut().truncate(1);
        self.nodes[end].prev_mut().truncate(1);
        Ok(())
    }

    fn two_armed_end(&self, if_node: NodeId) -> Result<NodeId, IrError> {
        let data = &self.nodes[if_node];
        let end = data
            .partner()
            .filter(|_| data.kind.is_if())
            .ok_or_else(|| IrError::malformed(if_node, "not an if"))?;
        if data.next().len() != 2 || self.nodes[end].prev().len() != 2 {
            return Err(IrError::malformed(if_node, "if without else branch"));
        }
        Ok(end)
    }
}
