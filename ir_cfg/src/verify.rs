use data_structure::{
    graph::{Predecessors, Successors},
    index::vec::Idx,
    BitVec,
};

use crate::{Access, Function, IrError, Jump, NodeId, NodeKind};

impl Function {
    /// Checks the structural invariants of the graph and that the cached
    /// read/write counts match the live nodes.
    pub fn verify(&self) -> Result<(), IrError> {
        let live = self.live_nodes();
        let mut is_live: BitVec = BitVec::repeat(false, self.nodes.len());
        for &n in &live {
            is_live.set(n.index(), true);
        }

        let mut reads = vec![0usize; self.vars.len()];
        let mut writes = vec![0usize; self.vars.len()];
        reads[self.mem.index()] = 2;
        writes[self.mem.index()] = 2;

        for &n in &live {
            self.verify_edges(n)?;
            self.verify_shape(n, &is_live)?;
            for inner in self.nested(n) {
                let data = &self.nodes[inner];
                if !data.next().is_empty() || !data.prev().is_empty() {
                    return Err(IrError::malformed(inner, "sub-expression linked into the stream"));
                }
            }
            for (v, access) in self.accesses(n) {
                match access {
                    Access::Read => reads[v.index()] += 1,
                    Access::Write => writes[v.index()] += 1,
                }
            }
        }
        self.verify_acyclic(&live, &is_live)?;
        self.verify_branch_depths()?;

        for (v, decl) in self.vars() {
            let cached = (decl.read_count(), decl.write_count());
            let actual = (reads[v.index()], writes[v.index()]);
            if cached != actual {
                return Err(IrError::CountMismatch {
                    var: decl.name.clone(),
                    cached,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn nested(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.walk_nested(node, &mut |n, _| out.push(n));
        out.retain(|n| *n != node);
        out
    }

    fn verify_edges(&self, a: NodeId) -> Result<(), IrError> {
        let count = |edges: &[NodeId], n: NodeId| edges.iter().filter(|e| **e == n).count();
        for b in self.successors(a) {
            if count(self.nodes[a].next(), b) != count(self.nodes[b].prev(), a) {
                return Err(IrError::malformed(a, format!("asymmetric edge to {b:?}")));
            }
        }
        for p in self.predecessors(a) {
            if count(self.nodes[a].prev(), p) != count(self.nodes[p].next(), a) {
                return Err(IrError::malformed(a, format!("asymmetric edge from {p:?}")));
            }
        }
        Ok(())
    }

    fn verify_shape(&self, n: NodeId, is_live: &BitVec) -> Result<(), IrError> {
        let data = &self.nodes[n];
        let succs = data.next().len();
        match &data.kind {
            NodeKind::If(_) if !(1..=2).contains(&succs) => {
                return Err(IrError::malformed(n, "if needs one or two successors"));
            }
            NodeKind::If(_) => {}
            _ if n == self.exit() => {
                if succs != 0 {
                    return Err(IrError::malformed(n, "function end has successors"));
                }
            }
            _ if succs != 1 => {
                return Err(IrError::malformed(n, format!("{succs} successors")));
            }
            _ => {}
        }

        if let Some(c) = data.kind.construct() {
            match self.nodes[c.end].kind {
                NodeKind::End { opener } if opener == n => {}
                _ => return Err(IrError::malformed(n, "opener and end are not partners")),
            }
        }
        match &data.kind {
            NodeKind::End { opener } => {
                if self.nodes[*opener].partner() != Some(n) {
                    return Err(IrError::malformed(n, "end does not belong to its opener"));
                }
            }
            NodeKind::Br(branch) | NodeKind::BrIf(branch) => {
                let target = &self.nodes[branch.target].kind;
                if !is_live[branch.target.index()] || target.construct().is_none() {
                    return Err(IrError::BranchTargetUnreachable {
                        target: branch.target,
                    });
                }
            }
            NodeKind::GotoStep(jump) | NodeKind::GotoStepIf(jump) => match jump {
                Jump::Pending(_) => return Err(IrError::UnresolvedJump { node: n }),
                Jump::Step(step) if !is_live[step.index()] || !self.nodes[*step].kind.is_step() => {
                    return Err(IrError::malformed(n, format!("jump to {step:?} which is not a step")));
                }
                _ => {}
            },
            _ => {}
        }
        if matches!(
            data.kind,
            NodeKind::BrIf(_) | NodeKind::GotoStepIf(_) | NodeKind::If(_)
        ) && data.args().len() != 1
        {
            return Err(IrError::malformed(n, "branch without condition"));
        }
        Ok(())
    }

    fn verify_branch_depths(&self) -> Result<(), IrError> {
        for (node, actual) in self.branch_depths() {
            let (NodeKind::Br(b) | NodeKind::BrIf(b)) = &self.nodes[node].kind else {
                continue;
            };
            let actual = actual.ok_or(IrError::BranchTargetUnreachable { target: b.target })?;
            if actual != b.depth {
                return Err(IrError::BranchDepthMismatch {
                    node,
                    cached: b.depth,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// The stream has no cycles; loops are closed by branches, not edges.
    fn verify_acyclic(&self, live: &[NodeId], is_live: &BitVec) -> Result<(), IrError> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for &n in live {
            for succ in self.successors(n) {
                in_degree[succ.index()] += 1;
            }
        }
        let mut ready: Vec<NodeId> = live
            .iter()
            .copied()
            .filter(|n| in_degree[n.index()] == 0)
            .collect();
        let mut visited = 0;
        while let Some(n) = ready.pop() {
            visited += 1;
            for succ in self.successors(n) {
                in_degree[succ.index()] -= 1;
                if in_degree[succ.index()] == 0 && is_live[succ.index()] {
                    ready.push(succ);
                }
            }
        }
        if visited != live.len() {
            let stuck = live
                .iter()
                .copied()
                .find(|n| in_degree[n.index()] > 0)
                .unwrap_or(self.entry);
            return Err(IrError::malformed(stuck, "cycle in the instruction stream"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ty::{CallingConv, FunctionTy, TargetLayout, Ty, TypeContext};

    use crate::{Arg, FunctionBuilder, NodeData, Opcode};

    use super::*;

    #[test]
    fn detects_stale_counts() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let x = b.tmp(None);
        b.assign(Some(x), Opcode::Const, Ty::I32, [Arg::int(1)]);
        b.ret([x.into()]);
        let mut f = b.finish().unwrap();
        f.verify().unwrap();

        f.add_read(x);
        assert!(matches!(f.verify(), Err(IrError::CountMismatch { .. })));
    }

    #[test]
    fn detects_stale_branch_depths() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![Ty::I32], None, CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let outer = b.block();
        b.br_if(p.into(), outer).unwrap();
        b.end().unwrap();
        let mut f = b.finish().unwrap();
        f.verify().unwrap();

        let br = f
            .live_nodes()
            .into_iter()
            .find(|n| matches!(f.kind(*n), NodeKind::BrIf(_)))
            .unwrap();
        if let NodeKind::BrIf(branch) = f.kind_mut(br) {
            branch.depth = 1;
        }
        assert_eq!(
            f.verify(),
            Err(IrError::BranchDepthMismatch {
                node: br,
                cached: 1,
                actual: 0,
            })
        );
        f.renumber_branches().unwrap();
        f.verify().unwrap();
    }

    #[test]
    fn detects_unresolved_jumps() {
        let types = TypeContext::new(TargetLayout::default());
        let b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let mut f = b.finish().unwrap();
        let goto = f.new_node(NodeData::new(
            NodeKind::GotoStep(Jump::Pending(None)),
            None,
            None,
            Vec::new(),
        ));
        f.insert_after(f.entry(), goto).unwrap();
        assert_eq!(f.verify(), Err(IrError::UnresolvedJump { node: goto }));
        *f.kind_mut(goto) = NodeKind::GotoStep(Jump::Terminal);
        f.verify().unwrap();
    }
}
