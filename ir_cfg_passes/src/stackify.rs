use ir_cfg::{Arg, Function, IrError, NodeId, NodeKind, Opcode, Var};
use log::{debug, trace};
use middleware::{FxHashSet, GlobalContext};

use crate::CfgPass;

/// Moves single-use definitions into the operand that reads them, turning
/// the instruction stream into expression trees for a stack machine.
///
/// A definition is only moved if nothing between it and its use writes one
/// of its inputs, reads or writes memory, or marks a step boundary. Literal
/// definitions are replaced by the literal itself.
///
/// Lowered coroutines are processed one step at a time.
pub struct Stackify;

impl<'ctx> CfgPass<'ctx> for Stackify {
    fn run_pass(&mut self, _ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError> {
        let steps: Vec<_> = function
            .live_nodes()
            .into_iter()
            .filter(|n| function.kind(*n).is_step())
            .collect();
        let starts = if steps.is_empty() {
            vec![function.entry()]
        } else {
            steps
        };
        let mut stackifier = Stackifier {
            function: &mut *function,
            inlined: 0,
        };
        for start in starts {
            let first = stackifier.function.node(start).first_next();
            stackifier.stackify(first, None)?;
        }
        let inlined = stackifier.inlined;
        debug!("{}: inlined {inlined} definitions", function.name());
        Ok(())
    }
}

struct Stackifier<'a> {
    function: &'a mut Function,
    inlined: usize,
}

impl Stackifier<'_> {
    /// Processes `first` up to `stop`, or up to the end of the current step.
    fn stackify(&mut self, first: Option<NodeId>, stop: Option<NodeId>) -> Result<(), IrError> {
        let mut n = first;
        while let Some(node) = n.filter(|n| Some(*n) != stop) {
            let data = self.function.node(node);
            if data.kind.is_op(Opcode::AddrOf) {
                n = data.first_next();
                continue;
            }
            if let (NodeKind::If(c), [_, else_first]) = (&data.kind, data.next()) {
                let (else_first, end) = (*else_first, c.end);
                self.stackify(Some(else_first), Some(end))?;
            }

            // operands evaluated before the one being filled
            let mut evaluated: Vec<Var> = Vec::new();
            let mut assigned = FxHashSet::default();
            for i in 0..self.function.node(node).args().len() {
                let arg = self.function.node(node).args()[i].clone();
                match arg {
                    Arg::Var(v) => {
                        if self.function.var(v).read_count() == 1 {
                            let def = self
                                .function
                                .node(node)
                                .first_prev()
                                .and_then(|prev| self.find_inline(prev, v, &evaluated, &mut assigned));
                            if let Some(def) = def {
                                self.inline(node, i, def)?;
                            }
                        }
                        evaluated.push(v);
                    }
                    Arg::Node(inner) => {
                        self.collect_assignments(inner, None, &mut assigned);
                    }
                    Arg::Lit(_) => {}
                }
            }

            if matches!(
                self.function.kind(node),
                NodeKind::Step(_) | NodeKind::GotoStep(_)
            ) {
                break;
            }
            n = self.function.node(node).first_next();
        }
        Ok(())
    }

    /// Moves `def` into argument `index` of `node`.
    fn inline(&mut self, node: NodeId, index: usize, def: NodeId) -> Result<(), IrError> {
        let data = self.function.node(def);
        let replacement = match (&data.kind, data.args()) {
            (NodeKind::Op(Opcode::Const), [Arg::Lit(lit)]) => Arg::Lit(lit.clone()),
            _ => Arg::Node(def),
        };
        self.function.set_assign(def, None)?;
        self.function.remove_node(def)?;
        self.function.replace_arg(node, index, replacement)?;
        trace!("{}", self.function.display_node(node));
        self.inlined += 1;
        Ok(())
    }

    /// Searches backwards from `from` for the definition of `v` that can be
    /// moved to the current operand.
    fn find_inline(
        &self,
        from: NodeId,
        v: Var,
        evaluated: &[Var],
        assigned: &mut FxHashSet<Var>,
    ) -> Option<NodeId> {
        let mut n = Some(from);
        while let Some(node) = n {
            let data = self.function.node(node);
            if matches!(
                data.kind,
                NodeKind::Define { .. }
                    | NodeKind::Step(_)
                    | NodeKind::GotoStep(_)
                    | NodeKind::GotoStepIf(_)
                    | NodeKind::Br(_)
                    | NodeKind::BrIf(_)
                    | NodeKind::If(_)
                    | NodeKind::Block(_)
                    | NodeKind::Loop(_)
                    | NodeKind::End { .. }
                    | NodeKind::Return
            ) {
                return None;
            }
            match data.assign() {
                Some(a) if a == v => {
                    let blocked = data.kind.is_declaration()
                        || matches!(data.kind, NodeKind::CallEnd(_))
                        || self.assigns_any(node, evaluated)
                        || self.reads_any(node, assigned);
                    return (!blocked).then_some(node);
                }
                Some(_) => {
                    if self.collect_assignments(node, Some(v), assigned) {
                        return None;
                    }
                }
                None => {}
            }
            if self
                .function
                .any_nested(node, &mut |d| d.kind.blocks_reordering())
            {
                return None;
            }
            n = data.first_prev();
        }
        None
    }

    /// Adds every variable `node` assigns to `assigned`. Returns `true` if
    /// one of them is `v`.
    fn collect_assignments(&self, node: NodeId, v: Option<Var>, assigned: &mut FxHashSet<Var>) -> bool {
        let mut hit = false;
        self.function.walk_nested(node, &mut |_, d| {
            if let Some(a) = d.assign() {
                hit |= Some(a) == v;
                assigned.insert(a);
            }
        });
        hit
    }

    fn assigns_any(&self, node: NodeId, vars: &[Var]) -> bool {
        self.function
            .any_nested(node, &mut |d| d.assign().is_some_and(|a| vars.contains(&a)))
    }

    fn reads_any(&self, node: NodeId, vars: &FxHashSet<Var>) -> bool {
        self.function.any_nested(node, &mut |d| {
            d.args()
                .iter()
                .filter_map(Arg::as_var)
                .any(|v| vars.contains(&v))
        })
    }
}

#[cfg(test)]
mod tests {
    use ir_cfg::{FunctionBuilder, NodeData};
    use session::CompilerOption;
    use ty::{CallingConv, FunctionTy, Ty};

    use super::*;
    use crate::{testing, StateMachine};

    fn i32_fn(conv: CallingConv) -> FunctionTy {
        FunctionTy::new(vec![Ty::I32], Some(Ty::I32), conv)
    }

    fn stackify(f: &mut Function) {
        let types = testing::types();
        let ctx = testing::context(&types, CompilerOption::default());
        Stackify.run_pass(&ctx, f).unwrap();
        f.verify().unwrap();
    }

    #[test]
    fn builds_expression_trees() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn(CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let x = b.declare_var(Ty::I32, "x", false);
        let y = b.declare_var(Ty::I32, "y", false);
        let k = b.declare_var(Ty::I32, "k", false);
        b.assign(Some(k), Opcode::Const, Ty::I32, [Arg::int(2)]);
        b.assign(Some(x), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.assign(Some(y), Opcode::Mul, Ty::I32, [x.into(), k.into()]);
        b.ret([y.into()]);
        let mut f = b.finish().unwrap();

        stackify(&mut f);
        let text = f.to_string();
        assert!(text.ends_with("    return (mul i32 (add i32 p, 1), 2)\nend\n"), "{text}");
        assert_eq!(f.var(x).read_count(), 0);
        assert_eq!(f.var(x).write_count(), 0);
        assert_eq!(f.var(p).read_count(), 2);
    }

    #[test]
    fn does_not_move_across_calls() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn(CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let x = b.declare_var(Ty::I32, "x", false);
        b.assign(Some(x), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.call(None, FunctionTy::new(vec![], None, CallingConv::Default), [])
            .unwrap();
        b.ret([x.into()]);
        let mut f = b.finish().unwrap();

        stackify(&mut f);
        assert!(f.to_string().contains("    x = add i32 p, 1\n    call () => ()\n    return x\n"));
    }

    #[test]
    fn does_not_move_past_writes_of_inputs() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn(CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let q = b.declare_var(Ty::I32, "q", false);
        let x = b.declare_var(Ty::I32, "x", false);
        b.assign(Some(q), Opcode::Add, Ty::I32, [p.into(), p.into()]);
        b.assign(Some(x), Opcode::Sub, Ty::I32, [q.into(), Arg::int(1)]);
        b.assign(Some(q), Opcode::Const, Ty::I32, [Arg::int(5)]);
        b.ret([x.into(), q.into()]);
        let mut f = b.finish().unwrap();

        stackify(&mut f);
        let text = f.to_string();
        assert!(text.contains("    x = sub i32 q, 1\n"), "{text}");
        assert!(text.contains("    return x, q\n"), "{text}");
    }

    #[test]
    fn does_not_move_reads_past_nested_assignments() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", i32_fn(CallingConv::Default));
        let p = b.declare_param(Ty::I32, "p");
        let y = b.declare_var(Ty::I32, "y", false);
        let x = b.declare_var(Ty::I32, "x", false);
        let r = b.declare_var(Ty::I32, "r", false);
        b.assign(Some(y), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.assign(Some(x), Opcode::Add, Ty::I32, [y.into(), Arg::int(1)]);
        b.assign(Some(r), Opcode::Add, Ty::I32, [Arg::int(0), x.into()]);
        b.ret([r.into()]);
        let mut f = b.finish().unwrap();

        // r = add (y = mul p, 3), x
        let r_node = f
            .live_nodes()
            .into_iter()
            .find(|n| f.kind(*n).is_op(Opcode::Add) && f.node(*n).assign() == Some(r))
            .unwrap();
        let inner = f.new_node(NodeData::new(
            NodeKind::Op(Opcode::Mul),
            Some(y),
            Some(Ty::I32),
            vec![p.into(), Arg::int(3)],
        ));
        f.replace_arg(r_node, 0, Arg::Node(inner)).unwrap();
        f.count_node(inner);
        f.add_read(y);
        f.verify().unwrap();

        stackify(&mut f);
        let text = f.to_string();
        // x must read y before the nested operand overwrites it
        assert!(text.contains("    x = add i32 y, 1\n"), "{text}");
        assert!(text.contains("(y = mul i32 p, 3), x)\n"), "{text}");
        assert_eq!(f.var(x).read_count(), 1);
    }

    #[test]
    fn stays_within_steps() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "g", i32_fn(CallingConv::Coroutine));
        let p = b.declare_param(Ty::I32, "p");
        let x = b.declare_var(Ty::I32, "x", false);
        let y = b.declare_var(Ty::I32, "y", false);
        b.assign(Some(y), Opcode::Add, Ty::I32, [p.into(), Arg::int(1)]);
        b.call(Some(x), i32_fn(CallingConv::Coroutine), [y.into()]).unwrap();
        b.ret([x.into()]);
        let mut f = b.finish().unwrap();

        let ctx_types = testing::types();
        let ctx = testing::context(&ctx_types, CompilerOption::default());
        StateMachine::new().run_pass(&ctx, &mut f).unwrap();
        stackify(&mut f);
        let text = f.to_string();
        assert!(text.contains("    call_begin (i32) => (i32) (add i32 p, 1)\n"), "{text}");
        assert!(text.contains("    x = call_end (i32) => (i32)\n"), "{text}");
        assert!(text.contains("    return x\n"), "{text}");
    }
}
