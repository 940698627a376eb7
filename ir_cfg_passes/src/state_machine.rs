//! Lowering of coroutines into resumable steps.
//!
//! Every suspension point (a call of a coroutine or `yield`) ends a step.
//! Control flow that crosses step boundaries is rewritten into
//! `goto_step`/`goto_step_if`, and the `block`/`loop` constructs that
//! contained suspension points disappear. `if` constructs and constructs
//! without suspension points are kept as they are.
use ir_cfg::{Function, IrError, Jump, NodeData, NodeId, NodeKind, Var};
use log::{debug, trace};
use middleware::{FxHashMap, GlobalContext};

use crate::CfgPass;

#[derive(Default)]
pub struct StateMachine {
    step_counter: usize,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'ctx> CfgPass<'ctx> for StateMachine {
    fn run_pass(&mut self, _ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError> {
        if !function.is_async() {
            return Ok(());
        }
        propagate_async(function);
        let first_step = self.step_counter;
        let (entry, exit) = (function.entry(), function.exit());
        let mut lowering = Lowering {
            function: &mut *function,
            step_counter: &mut self.step_counter,
        };
        lowering.transform(entry, exit, None, false)?;
        lowering.resolve(entry, None);
        lowering.cleanup(entry, None)?;
        debug!(
            "{}: lowered into {} steps",
            function.name(),
            self.step_counter - first_step
        );
        Ok(())
    }
}

/// Marks every construct between a branch and its async target as async, so
/// that the branch is reached by the lowering.
fn propagate_async(function: &mut Function) {
    let mut parents = FxHashMap::default();
    let mut branches = Vec::new();
    let entry = function.entry();
    if let Some(first) = function.node(entry).first_next() {
        collect_parents(function, first, function.exit(), entry, &mut parents, &mut branches);
    }
    loop {
        let mut changed = false;
        for &(branch, target) in &branches {
            if !function.kind(target).is_async_construct() {
                continue;
            }
            let mut opener = parents.get(&branch).copied();
            while let Some(node) = opener.filter(|node| *node != target) {
                if let Some(c) = function.kind_mut(node).construct_mut() {
                    changed |= !c.is_async;
                    c.is_async = true;
                }
                opener = parents.get(&node).copied();
            }
        }
        if !changed {
            break;
        }
    }
}

/// Records the innermost enclosing opener of every node and all branches.
fn collect_parents(
    function: &Function,
    start: NodeId,
    stop: NodeId,
    parent: NodeId,
    parents: &mut FxHashMap<NodeId, NodeId>,
    branches: &mut Vec<(NodeId, NodeId)>,
) {
    let mut n = Some(start);
    while let Some(node) = n.filter(|n| *n != stop) {
        parents.insert(node, parent);
        let data = function.node(node);
        if let NodeKind::Br(b) | NodeKind::BrIf(b) = &data.kind {
            branches.push((node, b.target));
        }
        n = match data.kind.construct() {
            Some(c) => {
                for &first in data.next() {
                    collect_parents(function, first, c.end, node, parents, branches);
                }
                function.node(c.end).first_next()
            }
            None => data.first_next(),
        };
    }
}

struct Lowering<'a> {
    function: &'a mut Function,
    step_counter: &'a mut usize,
}

impl Lowering<'_> {
    fn detached(&mut self, kind: NodeKind) -> NodeId {
        self.function.new_node(NodeData::new(kind, None, None, Vec::new()))
    }

    fn open_step_before(&mut self, node: NodeId) -> Result<NodeId, IrError> {
        let name = format!("s{}", self.step_counter);
        *self.step_counter += 1;
        let step = self.detached(NodeKind::Step(name));
        self.function.insert_before(node, step)?;
        Ok(step)
    }

    fn ensure_step(&mut self, step: &mut Option<NodeId>, node: NodeId) -> Result<(), IrError> {
        if step.is_none() {
            *step = Some(self.open_step_before(node)?);
        }
        Ok(())
    }

    /// Where a branch to `target` continues: the head of a loop, otherwise
    /// behind the construct.
    fn branch_destination(&self, target: NodeId) -> Result<NodeId, IrError> {
        let kind = self.function.kind(target);
        if kind.is_loop() {
            Ok(target)
        } else {
            kind.partner().ok_or(IrError::BranchTargetUnreachable { target })
        }
    }

    fn first_next(&self, node: NodeId) -> Option<NodeId> {
        self.function.node(node).first_next()
    }

    /// Cuts `start..=stop` into steps. `step` is the step open on entry.
    /// With `else_branch`, `stop` is the `end` of an `if` reached through
    /// its else edge.
    fn transform(
        &mut self,
        start: NodeId,
        stop: NodeId,
        mut step: Option<NodeId>,
        else_branch: bool,
    ) -> Result<(), IrError> {
        let mut n = Some(start);
        while let Some(node) = n {
            let kind = self.function.kind(node).clone();
            n = match kind {
                NodeKind::Define { .. } => self.first_next(node),
                NodeKind::Block(c) | NodeKind::Loop(c) if c.is_async => {
                    if step.take().is_some() {
                        let goto = self.detached(NodeKind::GotoStep(Jump::Pending(None)));
                        self.function.insert_before(node, goto)?;
                    }
                    self.first_next(node)
                }
                NodeKind::Block(c) | NodeKind::Loop(c) | NodeKind::If(c) if !c.is_async => {
                    self.ensure_step(&mut step, node)?;
                    self.first_next(c.end)
                }
                NodeKind::If(c) => {
                    self.ensure_step(&mut step, node)?;
                    if let Some(&else_first) = self.function.node(node).next().get(1) {
                        self.transform(else_first, c.end, step, true)?;
                    }
                    self.first_next(node)
                }
                NodeKind::End { opener } => {
                    if step.take().is_some() {
                        let slot = usize::from(else_branch && node == stop);
                        let last = *self
                            .function
                            .node(node)
                            .prev()
                            .get(slot)
                            .ok_or_else(|| IrError::malformed(node, "end without predecessor"))?;
                        let returned = !self.function.kind(opener).is_if()
                            && matches!(self.function.kind(last), NodeKind::Return);
                        if !returned {
                            let goto = self.detached(NodeKind::GotoStep(Jump::Pending(None)));
                            self.function.insert_before_slot(node, slot, goto)?;
                        }
                    }
                    if node == stop {
                        break;
                    }
                    self.first_next(node)
                }
                NodeKind::Br(b) => {
                    self.ensure_step(&mut step, node)?;
                    let dest = self.branch_destination(b.target)?;
                    *self.function.kind_mut(node) = NodeKind::GotoStep(Jump::Pending(Some(dest)));
                    step = None;
                    self.first_next(node)
                }
                NodeKind::BrIf(b) => {
                    self.ensure_step(&mut step, node)?;
                    let dest = self.branch_destination(b.target)?;
                    *self.function.kind_mut(node) = NodeKind::GotoStepIf(Jump::Pending(Some(dest)));
                    self.first_next(node)
                }
                NodeKind::Call(ty) | NodeKind::CallIndirect(ty) if ty.is_async() => {
                    self.ensure_step(&mut step, node)?;
                    let data = self.function.node(node);
                    let indirect = matches!(data.kind, NodeKind::CallIndirect(_));
                    let (assign, result_ty) = (data.assign(), data.ty.clone());
                    self.function.set_assign(node, None)?;
                    *self.function.kind_mut(node) = if indirect {
                        NodeKind::CallIndirectBegin(ty.clone())
                    } else {
                        NodeKind::CallBegin(ty.clone())
                    };
                    let goto = self.detached(NodeKind::GotoStep(Jump::Pending(None)));
                    self.function.insert_after(node, goto)?;
                    let call_end = self
                        .function
                        .new_node(NodeData::new(NodeKind::CallEnd(ty), assign, result_ty, Vec::new()));
                    self.function.insert_after(goto, call_end)?;
                    self.function.count_node(call_end);
                    step = None;
                    Some(call_end)
                }
                NodeKind::Yield => {
                    self.ensure_step(&mut step, node)?;
                    let goto = self.detached(NodeKind::GotoStep(Jump::Pending(None)));
                    self.function.insert_after(node, goto)?;
                    step = None;
                    self.first_next(goto)
                }
                _ => {
                    self.ensure_step(&mut step, node)?;
                    self.first_next(node)
                }
            };
        }
        Ok(())
    }

    /// The first step reached from `from` along `next[0]`.
    fn next_step(&self, from: NodeId) -> Option<NodeId> {
        let mut n = Some(from);
        while let Some(node) = n {
            if self.function.kind(node).is_step() {
                return Some(node);
            }
            n = self.first_next(node);
        }
        None
    }

    fn resolve(&mut self, start: NodeId, stop: Option<NodeId>) {
        let mut n = Some(start);
        while let Some(node) = n.filter(|n| Some(*n) != stop) {
            match self.function.kind(node) {
                NodeKind::GotoStep(Jump::Pending(origin)) | NodeKind::GotoStepIf(Jump::Pending(origin)) => {
                    let jump = match self.next_step(origin.unwrap_or(node)) {
                        Some(step) => Jump::Step(step),
                        None => Jump::Terminal,
                    };
                    if let NodeKind::GotoStep(j) | NodeKind::GotoStepIf(j) = self.function.kind_mut(node) {
                        *j = jump;
                    }
                    trace!("{}", self.function.display_node(node));
                }
                NodeKind::If(c) => {
                    let end = c.end;
                    if let Some(&else_first) = self.function.node(node).next().get(1) {
                        self.resolve(else_first, Some(end));
                    }
                }
                _ => {}
            }
            n = self.first_next(node);
        }
    }

    /// Unlinks the async `block`/`loop` constructs; their branches are gone.
    fn cleanup(&mut self, start: NodeId, stop: Option<NodeId>) -> Result<(), IrError> {
        let mut n = Some(start);
        while let Some(node) = n.filter(|n| Some(*n) != stop) {
            let data = self.function.node(node);
            let next = data.first_next();
            let dissolve = match &data.kind {
                NodeKind::If(c) => {
                    if let Some(&else_first) = data.next().get(1) {
                        let end = c.end;
                        self.cleanup(else_first, Some(end))?;
                    }
                    false
                }
                NodeKind::Block(c) | NodeKind::Loop(c) => c.is_async,
                NodeKind::End { opener } => matches!(
                    self.function.kind(*opener),
                    NodeKind::Block(c) | NodeKind::Loop(c) if c.is_async
                ),
                _ => false,
            };
            if dissolve {
                self.function.remove_node(node)?;
            }
            n = next;
        }
        Ok(())
    }
}

/// The steps of a lowered coroutine and the variables that have to survive
/// between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepLayout {
    /// Every `step` node, in layout order.
    pub steps: Vec<NodeId>,
    /// `call_begin`, `call_indirect_begin` and `yield` nodes.
    pub suspension_points: Vec<NodeId>,
}

impl StepLayout {
    /// Collects the steps of `function` and sets
    /// [`ir_cfg::VarDecl::used_in_multiple_steps`].
    pub fn analyze(function: &mut Function) -> Self {
        let mut layout = Self::default();
        let mut first_seen = FxHashMap::default();
        let mut shared = Vec::new();
        let (entry, exit) = (function.entry(), function.exit());
        if let Some(first) = function.node(entry).first_next() {
            layout.traverse(function, first, Some(exit), None, &mut first_seen, &mut shared);
        }
        for v in shared {
            function.var_mut(v).used_in_multiple_steps = true;
        }
        debug!(
            "{}: {} steps, {} suspension points",
            function.name(),
            layout.steps.len(),
            layout.suspension_points.len()
        );
        layout
    }

    pub fn step_index(&self, step: NodeId) -> Option<usize> {
        self.steps.iter().position(|s| *s == step)
    }

    fn traverse(
        &mut self,
        function: &Function,
        start: NodeId,
        stop: Option<NodeId>,
        mut step: Option<NodeId>,
        first_seen: &mut FxHashMap<Var, Option<NodeId>>,
        shared: &mut Vec<Var>,
    ) {
        let mut n = Some(start);
        while let Some(node) = n {
            for (v, _) in function.accesses(node) {
                if v == function.mem() {
                    continue;
                }
                match first_seen.get(&v) {
                    Some(Some(seen)) if Some(*seen) != step => {
                        if !shared.contains(&v) {
                            shared.push(v);
                        }
                    }
                    _ => {
                        first_seen.insert(v, step);
                    }
                }
            }
            if Some(node) == stop {
                break;
            }
            let data = function.node(node);
            match &data.kind {
                NodeKind::Step(_) => {
                    step = Some(node);
                    self.steps.push(node);
                }
                NodeKind::If(c) => {
                    if let Some(&else_first) = data.next().get(1) {
                        self.traverse(function, else_first, Some(c.end), step, first_seen, shared);
                    }
                }
                NodeKind::CallBegin(_) | NodeKind::CallIndirectBegin(_) | NodeKind::Yield => {
                    self.suspension_points.push(node);
                }
                _ => {}
            }
            n = data.first_next();
        }
    }
}
