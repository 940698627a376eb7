use data_structure::index::vec::{Idx, IndexVec};
use ty::{FunctionTy, Ty, TypeContext};

use crate::{
    Arg, Branch, Construct, Function, IrError, NodeData, NodeId, NodeKind, Opcode, Var, VarDecl,
};

/// Appends nodes to a function body while keeping the graph well formed.
///
/// Open constructs are kept on a stack; every opener gets its `end` at
/// creation time and [`FunctionBuilder::end`] links the current node to it.
/// Variable reads and writes are counted as nodes are appended.
pub struct FunctionBuilder<'a> {
    types: &'a TypeContext,
    function: Function,
    blocks: Vec<NodeId>,
    current: NodeId,
}

impl<'a> FunctionBuilder<'a> {
    /// Opens the body of a function.
    pub fn define(types: &'a TypeContext, name: impl Into<String>, ty: FunctionTy) -> Self {
        let mut mem = VarDecl::new("$mem", None);
        let (reads, writes) = mem.counts_mut();
        // pinned so that no pass considers it dead or single-use
        *reads = 2;
        *writes = 2;

        let mut vars: IndexVec<Var, VarDecl> = IndexVec::new();
        let mem = vars.push(mem);

        let mut nodes: IndexVec<NodeId, NodeData> = IndexVec::new();
        let entry = nodes.next_index();
        let end = NodeId::new(entry.index() + 1);
        let is_async = ty.is_async();
        nodes.push(NodeData::new(
            NodeKind::Define {
                name: name.into(),
                ty,
                body: Construct { end, is_async },
            },
            None,
            None,
            Vec::new(),
        ));
        nodes.push(NodeData::new(
            NodeKind::End { opener: entry },
            None,
            None,
            Vec::new(),
        ));

        Self {
            types,
            function: Function {
                vars,
                nodes,
                entry,
                mem,
                tmp_counter: 0,
            },
            blocks: vec![entry],
            current: entry,
        }
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    /// The node the next instruction is appended to.
    pub fn current(&self) -> NodeId {
        self.current
    }

    pub fn mem(&self) -> Var {
        self.function.mem
    }

    pub fn tmp(&mut self, ty: Option<Ty>) -> Var {
        self.function.new_tmp(ty)
    }

    fn append(&mut self, data: NodeData) -> NodeId {
        let node = self.function.new_node(data);
        self.function.link(self.current, node);
        self.current = node;
        self.function.count_node(node);
        node
    }

    fn declare(&mut self, kind: NodeKind, ty: Ty, name: String, needs_ref_counting: bool) -> Var {
        let mut decl = VarDecl::new(name, Some(ty.clone()));
        decl.needs_ref_counting = needs_ref_counting;
        let v = self.function.new_var(decl);
        self.append(NodeData::new(kind, Some(v), Some(ty), Vec::new()));
        v
    }

    pub fn declare_param(&mut self, ty: Ty, name: impl Into<String>) -> Var {
        self.declare(NodeKind::DeclParam, ty, name.into(), false)
    }

    pub fn declare_result(&mut self, ty: Ty, name: impl Into<String>) -> Var {
        self.declare(NodeKind::DeclResult, ty, name.into(), false)
    }

    pub fn declare_var(&mut self, ty: Ty, name: impl Into<String>, needs_ref_counting: bool) -> Var {
        self.declare(NodeKind::DeclVar, ty, name.into(), needs_ref_counting)
    }

    /// Appends a computation. An untyped destination takes `ty`.
    pub fn assign(
        &mut self,
        assign: Option<Var>,
        op: Opcode,
        ty: Ty,
        args: impl IntoIterator<Item = Arg>,
    ) -> Option<Var> {
        if let Some(v) = assign {
            let decl = self.function.var_mut(v);
            if decl.ty.is_none() {
                decl.ty = Some(ty.clone());
            }
        }
        self.append(NodeData::new(
            NodeKind::Op(op),
            assign,
            Some(ty),
            args.into_iter().collect(),
        ));
        assign
    }

    /// Checks the destination of a call against the callee's result type.
    fn bind_result(&mut self, assign: Option<Var>, ty: &FunctionTy) -> Result<(), IrError> {
        let Some(v) = assign else {
            return Ok(());
        };
        let decl = self.function.var(v);
        match (&decl.ty, &ty.result) {
            (Some(declared), Some(result)) if self.types.same_type(declared, result) => Ok(()),
            (Some(declared), result) => Err(IrError::TypeMismatch {
                var: decl.name.clone(),
                expected: declared.to_string(),
                found: result
                    .as_ref()
                    .map_or_else(|| "no result".to_string(), Ty::to_string),
            }),
            (None, result) => {
                let result = result.clone();
                self.function.var_mut(v).ty = result;
                Ok(())
            }
        }
    }

    fn mark_async(&mut self) {
        for &block in &self.blocks {
            if let Some(construct) = self.function.kind_mut(block).construct_mut() {
                construct.is_async = true;
            }
        }
    }

    fn append_call(
        &mut self,
        make: fn(FunctionTy) -> NodeKind,
        ty: FunctionTy,
        assign: Option<Var>,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<Option<Var>, IrError> {
        self.bind_result(assign, &ty)?;
        let result = ty.result.clone();
        let kind = make(ty);
        let suspends = kind.is_plain_call() && kind.function_ty().is_some_and(FunctionTy::is_async);
        self.append(NodeData::new(kind, assign, result, args.into_iter().collect()));
        if suspends {
            self.mark_async();
        }
        Ok(assign)
    }

    /// A direct call. Calling a coroutine makes every open construct async.
    pub fn call(
        &mut self,
        assign: Option<Var>,
        ty: FunctionTy,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<Option<Var>, IrError> {
        self.append_call(NodeKind::Call, ty, assign, args)
    }

    /// A call through a function address passed as the first argument.
    pub fn call_indirect(
        &mut self,
        assign: Option<Var>,
        ty: FunctionTy,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<Option<Var>, IrError> {
        self.append_call(NodeKind::CallIndirect, ty, assign, args)
    }

    /// Starts a coroutine without waiting for it.
    pub fn spawn(&mut self, ty: FunctionTy, args: impl IntoIterator<Item = Arg>) -> Result<(), IrError> {
        self.append_call(NodeKind::Spawn, ty, None, args).map(|_| ())
    }

    pub fn spawn_indirect(
        &mut self,
        assign: Option<Var>,
        ty: FunctionTy,
        args: impl IntoIterator<Item = Arg>,
    ) -> Result<Option<Var>, IrError> {
        self.append_call(NodeKind::SpawnIndirect, ty, assign, args)
    }

    /// An explicit suspension point.
    pub fn yield_now(&mut self) {
        self.append(NodeData::new(NodeKind::Yield, None, None, Vec::new()));
        self.mark_async();
    }

    pub fn ret(&mut self, args: impl IntoIterator<Item = Arg>) {
        self.append(NodeData::new(
            NodeKind::Return,
            None,
            None,
            args.into_iter().collect(),
        ));
    }

    fn open(&mut self, make: fn(Construct) -> NodeKind, args: Vec<Arg>) -> NodeId {
        let end = NodeId::new(self.function.nodes.next_index().index() + 1);
        let opener = self.append(NodeData::new(
            make(Construct {
                end,
                is_async: false,
            }),
            None,
            None,
            args,
        ));
        let pushed = self.function.new_node(NodeData::new(
            NodeKind::End { opener },
            None,
            None,
            Vec::new(),
        ));
        debug_assert_eq!(pushed, end);
        self.blocks.push(opener);
        opener
    }

    pub fn block(&mut self) -> NodeId {
        self.open(NodeKind::Block, Vec::new())
    }

    pub fn loop_block(&mut self) -> NodeId {
        self.open(NodeKind::Loop, Vec::new())
    }

    pub fn if_block(&mut self, cond: Arg) -> NodeId {
        self.open(NodeKind::If, vec![cond])
    }

    /// Closes the then branch of the innermost `if` and starts its else branch.
    pub fn else_block(&mut self) -> Result<(), IrError> {
        let &top = self.blocks.last().ok_or(IrError::EndWithoutOpen)?;
        let kind = self.function.kind(top);
        let end = match kind {
            NodeKind::If(c) if self.function.node(c.end).prev().is_empty() => c.end,
            _ => return Err(IrError::ElseWithoutIf { node: top }),
        };
        self.function.link(self.current, end);
        self.current = top;
        Ok(())
    }

    /// Closes the innermost construct. The function body itself is closed by
    /// [`FunctionBuilder::finish`].
    pub fn end(&mut self) -> Result<(), IrError> {
        if self.blocks.len() <= 1 {
            return Err(IrError::EndWithoutOpen);
        }
        let block = self.blocks.pop().ok_or(IrError::EndWithoutOpen)?;
        let end = self
            .function
            .node(block)
            .partner()
            .ok_or_else(|| IrError::malformed(block, "opener without end"))?;
        self.function.link(self.current, end);
        self.current = end;
        Ok(())
    }

    /// Depth of `target` on the stack of open constructs, innermost is 0.
    fn branch_to(&self, target: NodeId) -> Result<Branch, IrError> {
        self.blocks
            .iter()
            .rev()
            .position(|b| *b == target)
            .map(|depth| Branch { target, depth })
            .ok_or(IrError::BranchTargetUnreachable { target })
    }

    pub fn br(&mut self, to: NodeId) -> Result<(), IrError> {
        let branch = self.branch_to(to)?;
        self.append(NodeData::new(NodeKind::Br(branch), None, None, Vec::new()));
        Ok(())
    }

    pub fn br_if(&mut self, cond: Arg, to: NodeId) -> Result<(), IrError> {
        let branch = self.branch_to(to)?;
        self.append(NodeData::new(NodeKind::BrIf(branch), None, None, vec![cond]));
        Ok(())
    }

    /// Closes the function body and hands out the graph.
    pub fn finish(mut self) -> Result<Function, IrError> {
        if let [_, .., top] = self.blocks.as_slice() {
            return Err(IrError::UnclosedConstruct { node: *top });
        }
        let exit = self.function.exit();
        self.function.link(self.current, exit);
        Ok(self.function)
    }
}

#[cfg(test)]
mod tests {
    use ty::{CallingConv, TargetLayout};

    use super::*;

    fn i32_fn(conv: CallingConv) -> FunctionTy {
        FunctionTy::new(vec![Ty::I32], Some(Ty::I32), conv)
    }

    #[test]
    fn counts_reads_and_writes() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", i32_fn(CallingConv::Default));
        let a = b.declare_param(Ty::I32, "a");
        let r = b.declare_result(Ty::I32, "$return");
        let x = b.tmp(None);
        b.assign(Some(x), Opcode::Add, Ty::I32, [a.into(), a.into()]);
        b.assign(Some(r), Opcode::Copy, Ty::I32, [x.into()]);
        b.ret([]);
        let f = b.finish().unwrap();

        assert_eq!(f.var(a).read_count(), 3);
        assert_eq!(f.var(a).write_count(), 1);
        assert_eq!(f.var(r).read_count(), 1);
        assert_eq!(f.var(r).write_count(), 2);
        assert_eq!(f.var(x).ty, Some(Ty::I32));
        assert_eq!(f.var(x).read_count(), 1);
        assert_eq!(f.var(f.mem()).read_count(), 2);
        f.verify().unwrap();
    }

    #[test]
    fn decl_var_is_not_a_write_and_addr_of_marks_addressable() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let v = b.declare_var(Ty::I32, "v", true);
        let p = b.tmp(None);
        b.assign(Some(p), Opcode::AddrOf, Ty::ADDR, [v.into()]);
        let f = b.finish().unwrap();
        assert_eq!(f.var(v).write_count(), 0);
        assert!(f.var(v).addressable);
        assert!(f.var(v).needs_ref_counting);
    }

    #[test]
    fn branch_depth_counts_open_constructs() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let outer = b.block();
        let lp = b.loop_block();
        let cond = b.tmp(Some(Ty::I32));
        b.assign(Some(cond), Opcode::Const, Ty::I32, [Arg::int(1)]);
        b.if_block(cond.into());
        b.br(outer).unwrap();
        b.end().unwrap();
        b.br_if(cond.into(), lp).unwrap();
        b.end().unwrap();
        b.end().unwrap();
        let f = b.finish().unwrap();

        let branches: Vec<_> = f
            .live_nodes()
            .into_iter()
            .filter_map(|n| match f.kind(n) {
                NodeKind::Br(br) | NodeKind::BrIf(br) => Some(br.depth),
                _ => None,
            })
            .collect();
        assert_eq!(branches.len(), 2);
        assert!(branches.contains(&2));
        assert!(branches.contains(&0));
        f.verify().unwrap();
    }

    #[test]
    fn unbalanced_constructs_are_rejected() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let inner = b.block();
        b.end().unwrap();
        assert_eq!(
            b.br(inner),
            Err(IrError::BranchTargetUnreachable { target: inner })
        );
        assert_eq!(b.end(), Err(IrError::EndWithoutOpen));
        assert!(matches!(b.else_block(), Err(IrError::ElseWithoutIf { .. })));
        let open = b.loop_block();
        assert_eq!(
            b.finish().err(),
            Some(IrError::UnclosedConstruct { node: open })
        );
    }

    #[test]
    fn coroutine_calls_make_open_constructs_async() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let before = b.block();
        b.end().unwrap();
        let lp = b.loop_block();
        b.spawn(i32_fn(CallingConv::Coroutine), [Arg::int(1)]).unwrap();
        assert!(!b.function().kind(lp).is_async_construct());
        b.call(None, i32_fn(CallingConv::Coroutine), [Arg::int(1)]).unwrap();
        b.end().unwrap();
        let f = b.finish().unwrap();
        assert!(f.kind(lp).is_async_construct());
        assert!(!f.kind(before).is_async_construct());
        assert!(f.is_async());
    }

    #[test]
    fn call_result_type_is_checked() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let wide = b.tmp(Some(Ty::I64));
        let err = b
            .call(Some(wide), i32_fn(CallingConv::Default), [Arg::int(0)])
            .unwrap_err();
        assert!(matches!(err, IrError::TypeMismatch { .. }));

        let untyped = b.tmp(None);
        b.call(Some(untyped), i32_fn(CallingConv::Default), [Arg::int(0)])
            .unwrap();
        assert_eq!(b.function().var(untyped).ty, Some(Ty::I32));
    }

    #[test]
    fn empty_else_links_if_to_end_twice() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(&types, "f", FunctionTy::new(vec![], None, CallingConv::Default));
        let c = b.tmp(Some(Ty::I32));
        b.assign(Some(c), Opcode::Const, Ty::I32, [Arg::int(1)]);
        let if_node = b.if_block(c.into());
        b.else_block().unwrap();
        assert!(matches!(b.else_block(), Err(IrError::ElseWithoutIf { .. })));
        b.end().unwrap();
        let f = b.finish().unwrap();
        let end = f.node(if_node).partner().unwrap();
        assert_eq!(f.node(if_node).next(), &[end, end]);
        assert_eq!(f.node(end).prev(), &[if_node, if_node]);
        f.verify().unwrap();
    }
}
