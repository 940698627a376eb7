//! Finds the pointer values the garbage collector must be able to see.
//!
//! A variable holding a pointer is marked `gc_discoverable` if its value is
//! still needed after a node during which a collection may happen. Pointers
//! that only live on the operand stack of a nested expression are spilled
//! into a fresh variable first.
use data_structure::{
    graph::{self, traversal, Predecessors, Successors},
    index::vec::Idx,
    BitVec, SetLikeVec,
};
use ir_cfg::{Arg, Branch, Function, IrError, Jump, NodeId, NodeKind, Var};
use log::{debug, trace};
use middleware::{FxHashSet, GlobalContext};
use ty::TypeContext;

use crate::CfgPass;

pub struct GcDiscover;

impl<'ctx> CfgPass<'ctx> for GcDiscover {
    fn run_pass(&mut self, ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError> {
        let (marked, spilled) = {
            let liveness = Liveness::new(function, ctx.types());
            (liveness.solve(), liveness.stack_pointers())
        };

        for v in marked.iter_ones().map(Var::new) {
            trace!("{} is discoverable", function.var(v).name);
            function.var_mut(v).gc_discoverable = true;
        }
        for &node in &spilled {
            match function.node(node).assign() {
                Some(v) => function.var_mut(v).gc_discoverable = true,
                None => {
                    let tmp = function.new_tmp(function.node(node).ty.clone());
                    function.var_mut(tmp).gc_discoverable = true;
                    function.set_assign(node, Some(tmp))?;
                    function.add_read(tmp);
                }
            }
        }
        debug!(
            "{}: {} discoverable variables, {} spilled operands",
            function.name(),
            marked.count_ones(),
            spilled.len()
        );
        Ok(())
    }
}

/// The function as it executes: branches and step jumps are edges, the
/// fall-through edge of an unconditional jump is not.
struct FlowGraph<'a> {
    function: &'a Function,
    predecessors: Vec<Vec<NodeId>>,
}

impl<'a> FlowGraph<'a> {
    fn new(function: &'a Function) -> Self {
        let mut flow = Self {
            function,
            predecessors: vec![Vec::new(); graph::DirectedGraph::num_nodes(function)],
        };
        for node in function.live_nodes() {
            for succ in flow.flow_successors(node) {
                flow.predecessors[succ.index()].push(node);
            }
        }
        flow
    }

    fn branch_target(&self, branch: &Branch) -> NodeId {
        let kind = self.function.kind(branch.target);
        match kind.partner() {
            Some(end) if !kind.is_loop() => end,
            _ => branch.target,
        }
    }

    fn jump_target(&self, node: NodeId, jump: &Jump) -> Option<NodeId> {
        match jump {
            Jump::Step(step) => Some(*step),
            Jump::Terminal => None,
            Jump::Pending(_) => self.function.node(node).first_next(),
        }
    }

    fn flow_successors(&self, node: NodeId) -> Vec<NodeId> {
        let data = self.function.node(node);
        let fallthrough = data.first_next();
        let mut succs: Vec<NodeId> = match &data.kind {
            NodeKind::Return => Vec::new(),
            NodeKind::Br(b) => vec![self.branch_target(b)],
            NodeKind::BrIf(b) => fallthrough.into_iter().chain([self.branch_target(b)]).collect(),
            NodeKind::GotoStep(j) => self.jump_target(node, j).into_iter().collect(),
            NodeKind::GotoStepIf(j) => fallthrough.into_iter().chain(self.jump_target(node, j)).collect(),
            NodeKind::If(c) => match data.next() {
                [then_first] => vec![*then_first, c.end],
                next => next.to_vec(),
            },
            _ => data.next().to_vec(),
        };
        succs.dedup();
        succs
    }
}

impl graph::DirectedGraph for FlowGraph<'_> {
    type Node = NodeId;

    fn num_nodes(&self) -> usize {
        self.predecessors.len()
    }
}

impl graph::StartNode for FlowGraph<'_> {
    fn start_node(&self) -> Self::Node {
        self.function.entry()
    }
}

impl graph::Successors for FlowGraph<'_> {
    fn successors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> {
        self.flow_successors(node).into_iter()
    }
}

impl graph::Predecessors for FlowGraph<'_> {
    fn predecessors(&self, node: Self::Node) -> impl Iterator<Item = Self::Node> {
        self.predecessors[node.index()].iter().copied()
    }
}

/// An entry of the operand stack while a node is evaluated.
#[derive(Debug, Clone, Copy)]
enum Operand {
    Lit,
    /// Loaded from a variable.
    Var(Var),
    /// Result of a nested expression.
    Temp(NodeId),
}

/// What a node does, in evaluation order.
#[derive(Debug)]
enum Event {
    Read(Var),
    Write(Var),
    /// A collection may happen while these operands wait on the stack.
    Collect(Vec<Operand>),
}

struct Liveness<'a> {
    flow: FlowGraph<'a>,
    types: &'a TypeContext,
    /// Variables that may hold a pointer.
    tracked: BitVec,
    results: Vec<Var>,
}

impl<'a> Liveness<'a> {
    fn new(function: &'a Function, types: &'a TypeContext) -> Self {
        let mut tracked: BitVec = BitVec::repeat(false, function.num_vars());
        for (v, decl) in function.vars() {
            if v != function.mem() && decl.ty.as_ref().is_some_and(|ty| types.has_pointers(ty)) {
                tracked.set(v.index(), true);
            }
        }
        let results = function
            .live_nodes()
            .into_iter()
            .filter(|n| matches!(function.kind(*n), NodeKind::DeclResult))
            .filter_map(|n| function.node(n).assign())
            .filter(|v| tracked[v.index()])
            .collect();
        Self {
            flow: FlowGraph::new(function),
            types,
            tracked,
            results,
        }
    }

    fn function(&self) -> &'a Function {
        self.flow.function
    }

    fn events(&self, node: NodeId) -> Vec<Event> {
        let function = self.function();
        let mut events = Vec::new();
        evaluate(function, node, &mut Vec::new(), &mut events);
        // results are read by the caller once the function returns
        if matches!(function.kind(node), NodeKind::Return) || node == function.exit() {
            events.extend(self.results.iter().map(|v| Event::Read(*v)));
        }
        events
    }

    /// Backward dataflow to a fixpoint. Returns the variables live across a
    /// collection point.
    fn solve(&self) -> BitVec {
        let num_vars = self.tracked.len();
        let nodes = traversal::reachable(&self.flow);
        let mut live_in: Vec<BitVec> = vec![BitVec::repeat(false, num_vars); self.flow.predecessors.len()];
        let mut marked: BitVec = BitVec::repeat(false, num_vars);
        let mut worklist: SetLikeVec<NodeId> = nodes.into_iter().collect();

        while let Some(node) = worklist.pop() {
            let mut live: BitVec = BitVec::repeat(false, num_vars);
            for succ in self.flow.successors(node) {
                for v in live_in[succ.index()].iter_ones() {
                    live.set(v, true);
                }
            }
            for event in self.events(node).iter().rev() {
                match event {
                    Event::Write(v) => live.set(v.index(), false),
                    Event::Read(v) => {
                        if self.tracked[v.index()] {
                            live.set(v.index(), true);
                        }
                    }
                    Event::Collect(stack) => {
                        for v in live.iter_ones() {
                            marked.set(v, true);
                        }
                        for operand in stack {
                            if let Operand::Var(v) = operand {
                                if self.tracked[v.index()] {
                                    marked.set(v.index(), true);
                                }
                            }
                        }
                    }
                }
            }
            if live != live_in[node.index()] {
                live_in[node.index()] = live;
                worklist.extend(self.flow.predecessors(node));
            }
        }
        marked
    }

    /// Nested expressions whose pointer result waits on the operand stack
    /// across a collection point.
    fn stack_pointers(&self) -> Vec<NodeId> {
        let function = self.function();
        let mut seen = FxHashSet::default();
        let mut spilled = Vec::new();
        for node in function.live_nodes() {
            for event in self.events(node) {
                let Event::Collect(stack) = event else {
                    continue;
                };
                for operand in stack {
                    if let Operand::Temp(temp) = operand {
                        let holds_pointer = function
                            .node(temp)
                            .ty
                            .as_ref()
                            .is_some_and(|ty| self.types.has_pointers(ty));
                        if holds_pointer && seen.insert(temp) {
                            spilled.push(temp);
                        }
                    }
                }
            }
        }
        spilled
    }
}

/// Appends the events of evaluating `node` after its operands.
fn evaluate(function: &Function, node: NodeId, stack: &mut Vec<Operand>, events: &mut Vec<Event>) {
    let data = function.node(node);
    let base = stack.len();
    for arg in data.args() {
        match arg {
            Arg::Lit(_) => stack.push(Operand::Lit),
            Arg::Var(v) => {
                events.push(Event::Read(*v));
                stack.push(Operand::Var(*v));
            }
            Arg::Node(inner) => {
                evaluate(function, *inner, stack, events);
                stack.push(Operand::Temp(*inner));
            }
        }
    }
    // the operands are consumed before the node runs
    stack.truncate(base);
    if data.kind.may_collect() {
        events.push(Event::Collect(stack.clone()));
    }
    if let Some(v) = data.assign().filter(|_| !matches!(data.kind, NodeKind::DeclVar)) {
        events.push(Event::Write(v));
    }
}

#[cfg(test)]
mod tests {
    use ir_cfg::{FunctionBuilder, Opcode};
    use session::CompilerOption;
    use ty::{CallingConv, FunctionTy, Ty};

    use super::*;
    use crate::{testing, Stackify};

    fn sync(params: Vec<Ty>, result: Option<Ty>) -> FunctionTy {
        FunctionTy::new(params, result, CallingConv::Default)
    }

    fn analyze(types: &TypeContext, f: &mut Function) {
        let ctx = testing::context(types, CompilerOption::default());
        GcDiscover.run_pass(&ctx, f).unwrap();
        f.verify().unwrap();
    }

    #[test]
    fn marks_pointers_live_across_calls() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", sync(vec![], Some(Ty::PTR)));
        let q = b.declare_var(Ty::PTR, "q", false);
        let p = b.declare_var(Ty::PTR, "p", false);
        let i = b.declare_var(Ty::I32, "i", false);
        b.assign(Some(i), Opcode::Const, Ty::I32, [Arg::int(1)]);
        b.assign(Some(q), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        b.call(None, sync(vec![Ty::PTR], None), [q.into()]).unwrap();
        b.assign(Some(p), Opcode::Alloc, Ty::PTR, [Arg::int(16)]);
        b.call(None, sync(vec![Ty::I32], None), [i.into()]).unwrap();
        b.ret([p.into()]);
        let mut f = b.finish().unwrap();

        analyze(&types, &mut f);
        assert!(f.var(p).gc_discoverable);
        // consumed by the call before it runs
        assert!(!f.var(q).gc_discoverable);
        assert!(!f.var(i).gc_discoverable);
    }

    #[test]
    fn follows_loop_back_edges() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", sync(vec![], None));
        let p = b.declare_var(Ty::PTR, "p", false);
        let i = b.declare_var(Ty::I32, "i", false);
        b.assign(Some(p), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        let l = b.loop_block();
        b.call(None, sync(vec![Ty::PTR], None), [p.into()]).unwrap();
        b.call(Some(i), sync(vec![], Some(Ty::I32)), []).unwrap();
        b.br_if(i.into(), l).unwrap();
        b.end().unwrap();
        b.ret([]);
        let mut f = b.finish().unwrap();

        analyze(&types, &mut f);
        assert!(f.var(p).gc_discoverable);
    }

    #[test]
    fn keeps_pointers_live_through_else_branch() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", sync(vec![Ty::I32], Some(Ty::PTR)));
        let c = b.declare_param(Ty::I32, "c");
        let p = b.declare_var(Ty::PTR, "p", false);
        let q = b.declare_var(Ty::PTR, "q", false);
        b.assign(Some(p), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        b.assign(Some(q), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        b.if_block(c.into());
        b.call(None, sync(vec![Ty::PTR], None), [q.into()]).unwrap();
        b.else_block().unwrap();
        b.call(None, sync(vec![], None), []).unwrap();
        b.end().unwrap();
        b.ret([p.into()]);
        let mut f = b.finish().unwrap();

        analyze(&types, &mut f);
        // the only call p survives sits in the else branch
        assert!(f.var(p).gc_discoverable);
        assert!(!f.var(q).gc_discoverable);
    }

    #[test]
    fn results_stay_visible_until_return() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", sync(vec![], Some(Ty::PTR)));
        let r = b.declare_result(Ty::PTR, "r");
        b.assign(Some(r), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        b.call(None, sync(vec![], None), []).unwrap();
        b.ret([]);
        let mut f = b.finish().unwrap();

        analyze(&types, &mut f);
        assert!(f.var(r).gc_discoverable);
    }

    #[test]
    fn spills_pointer_operands() {
        let types = testing::types();
        let mut b = FunctionBuilder::define(&types, "f", sync(vec![], None));
        let t = b.declare_var(Ty::PTR, "t", false);
        let u = b.declare_var(Ty::I32, "u", false);
        b.call(Some(u), sync(vec![], Some(Ty::I32)), []).unwrap();
        b.assign(Some(t), Opcode::Alloc, Ty::PTR, [Arg::int(8)]);
        b.call(None, sync(vec![Ty::PTR, Ty::I32], None), [t.into(), u.into()])
            .unwrap();
        b.ret([]);
        let mut f = b.finish().unwrap();

        let ctx = testing::context(&types, CompilerOption::default());
        Stackify.run_pass(&ctx, &mut f).unwrap();
        analyze(&types, &mut f);

        let text = f.to_string();
        assert!(
            text.contains("    call (ptr,i32) => () (%0 = alloc ptr 8), (call () => (i32))\n"),
            "{text}"
        );
        let (tmp, decl) = f.vars().find(|(_, d)| d.name == "%0").unwrap();
        assert!(decl.gc_discoverable);
        assert_eq!((f.var(tmp).read_count(), f.var(tmp).write_count()), (1, 1));
    }
}
