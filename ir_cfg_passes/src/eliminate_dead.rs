use ir_cfg::{Arg, Function, IrError, NodeId, NodeKind, Opcode, Var};
use log::{debug, trace};
use middleware::GlobalContext;

use crate::CfgPass;

/// Removes code whose result is never used and code that can never run.
///
/// The first sweep runs backwards and drops unread definitions, unused
/// declarations and single-use copies. The second sweep runs forwards and
/// drops everything after `return`/`br` as well as the untaken branch of an
/// `if` on a literal condition.
pub struct EliminateDead;

impl<'ctx> CfgPass<'ctx> for EliminateDead {
    fn run_pass(&mut self, _ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError> {
        let mut sweep = Sweep {
            function,
            removed: 0,
            resolved: 0,
        };
        let (entry, exit) = (sweep.function.entry(), sweep.function.exit());
        // unreachable code may hold the last uses of a variable
        loop {
            if let Some(last) = sweep.function.node(exit).first_prev() {
                sweep.backward(last, entry)?;
            }
            let before = sweep.removed;
            if let Some(first) = sweep.function.node(entry).first_next() {
                sweep.forward(first, exit)?;
            }
            if sweep.removed == before {
                break;
            }
        }
        // resolved `if`s no longer count towards the depth of branches they held
        if sweep.resolved > 0 {
            sweep.function.renumber_branches()?;
        }
        debug!("{}: removed {} nodes", sweep.function.name(), sweep.removed);
        Ok(())
    }
}

enum Action {
    Keep,
    /// The call stays, its unread destination goes.
    DropResult,
    /// Sweep the else branch ending at this `end` up to its `if`.
    Descend(NodeId, NodeId),
    /// Unlink a node that accesses nothing.
    Unlink,
    /// `dest = copy src` where `src` is used nowhere else.
    Rename {
        src: Var,
        dest: Var,
    },
    ToConst,
    /// Release the node's accesses and unlink it.
    Remove,
}

struct Sweep<'a> {
    function: &'a mut Function,
    removed: usize,
    resolved: usize,
}

impl Sweep<'_> {
    fn unlink(&mut self, node: NodeId) -> Result<(), IrError> {
        trace!("removing {}", self.function.display_node(node));
        self.function.remove_node(node)?;
        self.removed += 1;
        Ok(())
    }

    /// Decides what the backward sweep does with `node`.
    fn classify(&self, node: NodeId) -> Result<Action, IrError> {
        let f = &*self.function;
        let data = f.node(node);
        let assign = data.assign();
        let unread = assign.is_some_and(|v| f.var(v).read_count() == 0);
        Ok(match (&data.kind, data.args()) {
            (kind, _) if kind.is_plain_call() => {
                if unread {
                    Action::DropResult
                } else {
                    Action::Keep
                }
            }
            (NodeKind::End { opener }, _) => match data.prev().get(1) {
                Some(&else_last) => Action::Descend(else_last, *opener),
                None => Action::Keep,
            },
            (NodeKind::DeclVar, _) => {
                let v = assign.ok_or_else(|| IrError::malformed(node, "declaration without variable"))?;
                let decl = f.var(v);
                if decl.read_count() == 0 && decl.write_count() == 0 {
                    Action::Unlink
                } else {
                    Action::Keep
                }
            }
            (NodeKind::DeclParam | NodeKind::DeclResult | NodeKind::Return, _) => Action::Keep,
            (NodeKind::Op(Opcode::Copy), [Arg::Var(src)]) if !unread => {
                let (src, dest) = (*src, assign.ok_or_else(|| IrError::malformed(node, "copy without destination"))?);
                let from = f.var(src);
                if f.var(dest).write_count() == 1
                    && from.write_count() == 1
                    && from.read_count() == 1
                    && !from.addressable
                {
                    Action::Rename { src, dest }
                } else {
                    Action::Keep
                }
            }
            (NodeKind::Op(Opcode::Copy), [Arg::Lit(lit)]) if !unread && lit.is_numeric() => Action::ToConst,
            (kind, _) if !kind.has_side_effect() && unread => Action::Remove,
            _ => Action::Keep,
        })
    }

    /// Walks `prev[0]` from `start` until `stop`.
    fn backward(&mut self, start: NodeId, stop: NodeId) -> Result<(), IrError> {
        let mut n = Some(start);
        while let Some(node) = n.filter(|n| *n != stop) {
            // the variable was folded into the copy that read it
            let f = &mut *self.function;
            let data = f.node(node);
            if let Some(target) = data
                .assign()
                .filter(|_| !data.kind.is_declaration())
                .and_then(|v| f.var(v).copied_value)
            {
                f.set_assign(node, Some(target))?;
            }
            n = f.node(node).first_prev();

            match self.classify(node)? {
                Action::Keep => {}
                Action::DropResult => self.function.set_assign(node, None)?,
                Action::Descend(else_last, opener) => self.backward(else_last, opener)?,
                Action::Unlink => self.unlink(node)?,
                Action::Rename { src, dest } => {
                    let f = &mut *self.function;
                    trace!("{} renamed to {}", f.var(src).name, f.var(dest).name);
                    f.var_mut(src).copied_value = Some(dest);
                    f.release_write(dest)?;
                    f.release_read(src)?;
                    self.unlink(node)?;
                }
                Action::ToConst => *self.function.kind_mut(node) = NodeKind::Op(Opcode::Const),
                Action::Remove => {
                    self.function.uncount_node(node)?;
                    self.unlink(node)?;
                }
            }
        }
        Ok(())
    }

    /// Walks `next[0]` from `start` until `stop`, descending into constructs.
    fn forward(&mut self, start: NodeId, stop: NodeId) -> Result<(), IrError> {
        let mut dead = false;
        let mut n = Some(start);
        while let Some(node) = n.filter(|n| *n != stop) {
            let f = &mut *self.function;
            let data = f.node(node);
            if dead {
                n = match data.kind.construct() {
                    Some(c) => {
                        let end = c.end;
                        let after = f.node(end).first_next();
                        let body = data.first_next();
                        f.retire_node(node)?;
                        if let Some(body) = body {
                            f.retire_strain(body, end)?;
                        }
                        trace!("removing unreachable construct {}", f.display_node(node));
                        f.unlink_range(node, end)?;
                        self.removed += 1;
                        after
                    }
                    None => {
                        let next = data.first_next();
                        f.retire_node(node)?;
                        self.unlink(node)?;
                        next
                    }
                };
                continue;
            }
            n = match &data.kind {
                NodeKind::Return | NodeKind::Br(_) => {
                    dead = true;
                    data.first_next()
                }
                NodeKind::If(c) => {
                    let end = c.end;
                    match data.args().first().and_then(Arg::as_lit).and_then(|lit| lit.truthiness()) {
                        Some(taken) => self.resolve_if(node, end, taken)?,
                        None => {
                            let branches = data.next().to_vec();
                            for first in branches {
                                self.forward(first, end)?;
                            }
                            self.function.node(end).first_next()
                        }
                    }
                }
                NodeKind::Block(c) | NodeKind::Loop(c) => {
                    let end = c.end;
                    if let Some(body) = data.first_next() {
                        self.forward(body, end)?;
                    }
                    self.function.node(end).first_next()
                }
                _ => data.first_next(),
            };
        }
        Ok(())
    }

    /// Replaces an `if` on a literal by its taken branch and returns the node
    /// to continue with.
    fn resolve_if(&mut self, node: NodeId, end: NodeId, taken: bool) -> Result<Option<NodeId>, IrError> {
        let f = &mut *self.function;
        trace!("resolving {} to {taken}", f.display_node(node));
        if f.node(node).next().len() == 2 {
            if !taken {
                f.swap_branches(node)?;
            }
            let untaken = f.node(node).next()[1];
            f.retire_strain(untaken, end)?;
            f.drop_else(node)?;
        } else if !taken {
            let after = f.node(end).first_next();
            let body = f.node(node).first_next();
            f.retire_node(node)?;
            if let Some(body) = body {
                f.retire_strain(body, end)?;
            }
            f.unlink_range(node, end)?;
            self.removed += 1;
            return Ok(after);
        }

        self.resolved += 1;
        let branched_to = f.live_nodes().into_iter().any(|n| {
            matches!(f.kind(n), NodeKind::Br(b) | NodeKind::BrIf(b) if b.target == node)
        });
        if branched_to {
            // the construct is still a branch target, keep it as a block
            let construct = *f
                .kind(node)
                .construct()
                .ok_or_else(|| IrError::malformed(node, "if without end"))?;
            *f.kind_mut(node) = NodeKind::Block(construct);
            f.set_args(node, Vec::new())?;
            return Ok(Some(node));
        }

        f.uncount_node(node)?;
        let first = f.node(node).first_next();
        let resume = if first == Some(end) {
            f.node(end).first_next()
        } else {
            first
        };
        self.unlink(end)?;
        self.unlink(node)?;
        Ok(resume)
    }
}

#[cfg(test)]
mod tests {
    use ir_cfg::{FunctionBuilder, Literal};
    use session::CompilerOption;
    use ty::{CallingConv, FunctionTy, Ty};

    use super::*;
    use crate::{testing, ConstantFold};

    fn i32_fn() -> FunctionTy {
        FunctionTy::new(vec![], Some(Ty::I32), CallingConv::Default)
    }

    fn callee() -> FunctionTy {
        FunctionTy::new(vec![], Some(Ty::I32), CallingConv::Default)
    }

    fn optimize(f: &mut Function) {
        let types = testing::types();
        let ctx = testing::context(&types, CompilerOption::default());
        ConstantFold.run_pass(&ctx, f).unwrap();
        EliminateDead.run_pass(&ctx, f).unwrap();
        f.verify().unwrap();
    }

    fn has_decl(f: &Function, v: Var) -> bool {
        f.live_nodes()
            .into_iter()
            .any(|n| f.node(n).kind.is_declaration() && f.node(n).assign() == Some(v))
    }

    #[test]
    fn removes_unused_constant() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let x = b.declare_var(Ty::I32, "x", false);
        b.assign(Some(x), Opcode::Const, Ty::I32, [Arg::int(5)]);
        b.ret([Arg::int(1)]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        assert!(!has_decl(&f, x));
        assert_eq!(f.to_string(), "define f () => (i32)\n    return 1\nend\n");
    }

    #[test]
    fn drops_unread_results_but_keeps_calls() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let a = b.declare_var(Ty::I32, "a", false);
        let t = b.declare_var(Ty::I32, "t", false);
        b.call(Some(a), callee(), []).unwrap();
        b.assign(Some(t), Opcode::Add, Ty::I32, [a.into(), Arg::int(1)]);
        b.ret([Arg::int(0)]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        let text = f.to_string();
        assert!(text.contains("    call () => (i32)\n"), "{text}");
        assert!(!text.contains("add"));
        assert!(!has_decl(&f, a));
        assert!(!has_decl(&f, t));
    }

    #[test]
    fn folds_single_use_copy_into_its_source() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let p = b.declare_param(Ty::I32, "p");
        let t = b.declare_var(Ty::I32, "t", false);
        let u = b.declare_var(Ty::I32, "u", false);
        b.assign(Some(t), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.assign(Some(u), Opcode::Copy, Ty::I32, [t.into()]);
        b.ret([u.into()]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        assert_eq!(f.var(t).copied_value, Some(u));
        assert!(!has_decl(&f, t));
        assert!(f.to_string().contains("u = add i32 p, 1\n    return u\n"));
    }

    #[test]
    fn removes_code_after_return() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let p = b.declare_param(Ty::I32, "p");
        let r = b.declare_var(Ty::I32, "r", false);
        b.ret([p.into()]);
        let blk = b.block();
        b.assign(Some(r), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.br(blk).unwrap();
        b.end().unwrap();
        b.ret([r.into()]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        assert_eq!(f.to_string(), "define f () => (i32)\n    p = decl_param i32\n    return p\nend\n");
        assert_eq!(f.var(p).read_count(), 2);
    }

    #[test]
    fn resolves_constant_conditions() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let p = b.declare_param(Ty::I32, "p");
        let c = b.declare_var(Ty::I32, "c", false);
        b.assign(Some(c), Opcode::Const, Ty::I32, [Arg::int(0)]);
        b.if_block(c.into());
        b.ret([Arg::int(1)]);
        b.end().unwrap();
        b.if_block(Arg::int(0));
        b.ret([Arg::int(2)]);
        b.else_block().unwrap();
        b.if_block(Arg::int(3));
        b.ret([p.into()]);
        b.end().unwrap();
        b.end().unwrap();
        b.ret([Arg::int(4)]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        assert_eq!(f.var(c).constant, Some(Literal::Int(0)));
        assert_eq!(
            f.to_string(),
            "define f () => (i32)\n    p = decl_param i32\n    return p\nend\n"
        );
    }

    fn branch_depth(f: &Function) -> usize {
        f.live_nodes()
            .into_iter()
            .find_map(|n| match f.kind(n) {
                NodeKind::Br(b) | NodeKind::BrIf(b) => Some(b.depth),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn renumbers_branches_out_of_resolved_if() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![Ty::I32], None, CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let outer = b.block();
        b.if_block(Arg::int(1));
        b.br_if(p.into(), outer).unwrap();
        b.end().unwrap();
        b.end().unwrap();
        b.ret([]);
        let mut f = b.finish().unwrap();
        assert_eq!(branch_depth(&f), 1);

        optimize(&mut f);
        assert_eq!(branch_depth(&f), 0);
        let text = f.to_string();
        assert!(text.contains("br_if p, 0\n"), "{text}");
        assert!(!text.contains("if 1"), "{text}");
    }

    #[test]
    fn keeps_resolved_if_that_is_branched_to() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![Ty::I32], None, CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let target = b.if_block(Arg::int(1));
        b.br_if(p.into(), target).unwrap();
        b.call(None, FunctionTy::new(vec![], None, CallingConv::Default), [])
            .unwrap();
        b.end().unwrap();
        b.ret([]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        assert!(matches!(f.kind(target), NodeKind::Block(_)));
        assert_eq!(branch_depth(&f), 0);
        assert!(f.to_string().contains("    block\n"));
    }

    #[test]
    fn leaves_only_variables_that_are_read() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![Ty::I32], Some(Ty::I32), CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let k = b.declare_var(Ty::I32, "k", false);
        let a = b.declare_var(Ty::I32, "a", false);
        let c = b.declare_var(Ty::I32, "c", false);
        let h = b.declare_var(Ty::I32, "h", false);
        let g = b.declare_var(Ty::I32, "g", false);
        b.assign(Some(k), Opcode::Const, Ty::I32, [Arg::int(3)]);
        b.assign(Some(a), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.call(Some(c), callee(), []).unwrap();
        b.assign(Some(h), Opcode::Add, Ty::I32, [p.into(), k.into()]);
        b.assign(Some(g), Opcode::Copy, Ty::I32, [h.into()]);
        b.ret([g.into()]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        for (v, decl) in f.vars().filter(|(_, d)| d.name != "$mem") {
            if decl.write_count() > 0 {
                assert!(decl.read_count() > 0, "{} is written but never read", decl.name);
            }
            if has_decl(&f, v) {
                assert!(decl.read_count() > 0, "{} is declared but never read", decl.name);
            }
        }
        for v in [k, a, c, h] {
            assert!(!has_decl(&f, v), "{}", f.var(v).name);
        }
        assert!(has_decl(&f, p));
        assert!(f.to_string().contains("    g = add i32 p, 3\n    return g\n"));
    }

    #[test]
    fn keeps_branches_on_variables() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn());
        let p = b.declare_param(Ty::I32, "p");
        b.if_block(p.into());
        b.ret([Arg::int(1)]);
        b.assign(None, Opcode::Trap, Ty::I32, []);
        b.else_block().unwrap();
        b.end().unwrap();
        b.ret([Arg::int(0)]);
        let mut f = b.finish().unwrap();

        optimize(&mut f);
        let text = f.to_string();
        assert!(text.contains("if p"));
        assert!(!text.contains("trap"));
    }
}
