use data_structure::{
    index::{vec::IndexVec, Indexable},
    newtype_index,
};
use ty::{FunctionTy, Ty};

newtype_index! {
    /// A local variable of a [`Function`].
    pub struct Var;
}

newtype_index! {
    /// A node in the arena of a [`Function`].
    pub struct NodeId;
}

impl Indexable<Var> for VarDecl {}
impl Indexable<NodeId> for NodeData {}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn as_int(&self) -> Option<i64> {
        if let Self::Int(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    /// Integers and floats; string literals are never propagated into operands.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    /// The truth value of a numeric literal used as a condition.
    pub fn truthiness(&self) -> Option<bool> {
        match self {
            Self::Int(v) => Some(*v != 0),
            Self::Float(v) => Some(*v != 0.0),
            Self::Str(_) => None,
        }
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// An operand of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Lit(Literal),
    Var(Var),
    /// A sub-expression. The node is detached from the instruction stream
    /// and owned by the node holding this argument.
    Node(NodeId),
}

impl Arg {
    pub fn int(value: i64) -> Self {
        Self::Lit(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Lit(Literal::Float(value))
    }

    pub fn as_var(&self) -> Option<Var> {
        if let Self::Var(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    pub fn as_lit(&self) -> Option<&Literal> {
        if let Self::Lit(lit) = self {
            Some(lit)
        } else {
            None
        }
    }

    pub fn as_node(&self) -> Option<NodeId> {
        if let Self::Node(n) = self {
            Some(*n)
        } else {
            None
        }
    }
}

impl From<Var> for Arg {
    fn from(value: Var) -> Self {
        Self::Var(value)
    }
}

impl From<Literal> for Arg {
    fn from(value: Literal) -> Self {
        Self::Lit(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub ty: Option<Ty>,
    /// Number of live nodes reading the variable.
    read_count: usize,
    /// Number of live nodes assigning the variable.
    write_count: usize,
    /// Set when the only write was a literal and the address was never taken.
    pub constant: Option<Literal>,
    /// The variable has been folded into another one; writes go there instead.
    pub copied_value: Option<Var>,
    /// `addr_of` has been applied to the variable.
    pub addressable: bool,
    /// The value must be visible to the collector at the next collection point.
    pub gc_discoverable: bool,
    /// Read or written in more than one step of a lowered coroutine.
    pub used_in_multiple_steps: bool,
    /// Set by the front end for values the emitter wraps in reference count
    /// updates. Carried through the passes unchanged.
    pub needs_ref_counting: bool,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, ty: Option<Ty>) -> Self {
        Self {
            name: name.into(),
            ty,
            read_count: 0,
            write_count: 0,
            constant: None,
            copied_value: None,
            addressable: false,
            gc_discoverable: false,
            used_in_multiple_steps: false,
            needs_ref_counting: false,
        }
    }

    pub fn read_count(&self) -> usize {
        self.read_count
    }

    pub fn write_count(&self) -> usize {
        self.write_count
    }

    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }

    pub fn is_copy(&self) -> bool {
        self.copied_value.is_some()
    }

    pub(crate) fn counts_mut(&mut self) -> (&mut usize, &mut usize) {
        (&mut self.read_count, &mut self.write_count)
    }
}

/// Opener of `block`, `loop`, `if` and the function body itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Construct {
    /// The matching `end`.
    pub end: NodeId,
    /// A suspension point lies somewhere inside.
    pub is_async: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    /// The `block` or `loop` branched to.
    pub target: NodeId,
    /// Number of constructs between the branch and its target.
    pub depth: usize,
}

/// Destination of `goto_step`/`goto_step_if`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jump {
    /// Not resolved yet. The destination is the first step found by scanning
    /// forward from the given node, or from the jump itself.
    Pending(Option<NodeId>),
    Step(NodeId),
    /// No step follows: the jump terminates the function.
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Define {
        name: String,
        ty: FunctionTy,
        body: Construct,
    },
    DeclParam,
    DeclResult,
    DeclVar,
    Block(Construct),
    Loop(Construct),
    If(Construct),
    End {
        opener: NodeId,
    },
    Br(Branch),
    /// `args[0]` is the condition.
    BrIf(Branch),
    Call(FunctionTy),
    /// `args[0]` is the callee address.
    CallIndirect(FunctionTy),
    CallBegin(FunctionTy),
    CallIndirectBegin(FunctionTy),
    CallEnd(FunctionTy),
    Spawn(FunctionTy),
    SpawnIndirect(FunctionTy),
    Return,
    Yield,
    Step(String),
    GotoStep(Jump),
    /// `args[0]` is the condition.
    GotoStepIf(Jump),
    Op(Opcode),
}

impl NodeKind {
    pub fn construct(&self) -> Option<&Construct> {
        match self {
            Self::Define { body, .. } => Some(body),
            Self::Block(c) | Self::Loop(c) | Self::If(c) => Some(c),
            _ => None,
        }
    }

    pub fn construct_mut(&mut self) -> Option<&mut Construct> {
        match self {
            Self::Define { body, .. } => Some(body),
            Self::Block(c) | Self::Loop(c) | Self::If(c) => Some(c),
            _ => None,
        }
    }

    /// The `end` of an opener, or the opener of an `end`.
    pub fn partner(&self) -> Option<NodeId> {
        match self {
            Self::End { opener } => Some(*opener),
            _ => self.construct().map(|c| c.end),
        }
    }

    pub fn is_async_construct(&self) -> bool {
        self.construct().is_some_and(|c| c.is_async)
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }

    pub fn is_if(&self) -> bool {
        matches!(self, Self::If(_))
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, Self::Loop(_))
    }

    pub fn is_step(&self) -> bool {
        matches!(self, Self::Step(_))
    }

    pub fn is_declaration(&self) -> bool {
        matches!(self, Self::DeclParam | Self::DeclResult | Self::DeclVar)
    }

    pub fn is_op(&self, op: Opcode) -> bool {
        matches!(self, Self::Op(o) if *o == op)
    }

    pub fn function_ty(&self) -> Option<&FunctionTy> {
        match self {
            Self::Define { ty, .. }
            | Self::Call(ty)
            | Self::CallIndirect(ty)
            | Self::CallBegin(ty)
            | Self::CallIndirectBegin(ty)
            | Self::CallEnd(ty)
            | Self::Spawn(ty)
            | Self::SpawnIndirect(ty) => Some(ty),
            _ => None,
        }
    }

    /// `call` or `call_indirect`, the nodes whose destination may be dropped.
    pub fn is_plain_call(&self) -> bool {
        matches!(self, Self::Call(_) | Self::CallIndirect(_))
    }

    /// Any call or spawn. These are kept even if their destination is unread.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Self::Call(_)
                | Self::CallIndirect(_)
                | Self::CallBegin(_)
                | Self::CallIndirectBegin(_)
                | Self::CallEnd(_)
                | Self::Spawn(_)
                | Self::SpawnIndirect(_)
        )
    }

    /// Nodes during which the garbage collector may run.
    pub fn may_collect(&self) -> bool {
        self.has_side_effect() || self.is_op(Opcode::Alloc) || self.is_op(Opcode::AllocArr)
    }

    /// Nodes that change memory or scheduling state; expressions are never
    /// moved across them.
    pub fn blocks_reordering(&self) -> bool {
        match self {
            Self::Call(_)
            | Self::CallIndirect(_)
            | Self::CallBegin(_)
            | Self::CallIndirectBegin(_)
            | Self::CallEnd(_) => true,
            Self::Op(op) => op.writes_memory(),
            _ => false,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Define { .. } => "define",
            Self::DeclParam => "decl_param",
            Self::DeclResult => "decl_result",
            Self::DeclVar => "decl_var",
            Self::Block(_) => "block",
            Self::Loop(_) => "loop",
            Self::If(_) => "if",
            Self::End { .. } => "end",
            Self::Br(_) => "br",
            Self::BrIf(_) => "br_if",
            Self::Call(_) => "call",
            Self::CallIndirect(_) => "call_indirect",
            Self::CallBegin(_) => "call_begin",
            Self::CallIndirectBegin(_) => "call_indirect_begin",
            Self::CallEnd(_) => "call_end",
            Self::Spawn(_) => "spawn",
            Self::SpawnIndirect(_) => "spawn_indirect",
            Self::Return => "return",
            Self::Yield => "yield",
            Self::Step(_) => "step",
            Self::GotoStep(_) => "goto_step",
            Self::GotoStepIf(_) => "goto_step_if",
            Self::Op(op) => op.mnemonic(),
        }
    }
}

/// Operations without control-flow semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Const,
    Copy,
    Struct,
    Load,
    Store,
    AddrOf,
    Alloc,
    AllocArr,
    Free,
    FreeArr,
    Incref,
    Decref,
    Member,
    SetMember,
    Memcpy,
    Memmove,
    Memcmp,
    Lock,
    Unlock,
    Trap,
    Add,
    Sub,
    Mul,
    Div,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrU,
    ShrS,
    Eq,
    Ne,
    LtS,
    LtU,
    LeS,
    LeU,
    GtS,
    GtU,
    GeS,
    GeU,
    Lt,
    Gt,
    Le,
    Ge,
    Min,
    Max,
    Eqz,
    Neg,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
    Wrap,
    Extend,
    Promote,
    Demote,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Const => "const",
            Self::Copy => "copy",
            Self::Struct => "struct",
            Self::Load => "load",
            Self::Store => "store",
            Self::AddrOf => "addr_of",
            Self::Alloc => "alloc",
            Self::AllocArr => "alloc_arr",
            Self::Free => "free",
            Self::FreeArr => "free_arr",
            Self::Incref => "incref",
            Self::Decref => "decref",
            Self::Member => "member",
            Self::SetMember => "set_member",
            Self::Memcpy => "memcpy",
            Self::Memmove => "memmove",
            Self::Memcmp => "memcmp",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Trap => "trap",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::DivS => "div_s",
            Self::DivU => "div_u",
            Self::RemS => "rem_s",
            Self::RemU => "rem_u",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::ShrU => "shr_u",
            Self::ShrS => "shr_s",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::LtS => "lt_s",
            Self::LtU => "lt_u",
            Self::LeS => "le_s",
            Self::LeU => "le_u",
            Self::GtS => "gt_s",
            Self::GtU => "gt_u",
            Self::GeS => "ge_s",
            Self::GeU => "ge_u",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Le => "le",
            Self::Ge => "ge",
            Self::Min => "min",
            Self::Max => "max",
            Self::Eqz => "eqz",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sqrt => "sqrt",
            Self::Ceil => "ceil",
            Self::Floor => "floor",
            Self::Trunc => "trunc",
            Self::Nearest => "nearest",
            Self::Wrap => "wrap",
            Self::Extend => "extend",
            Self::Promote => "promote",
            Self::Demote => "demote",
        }
    }

    pub fn writes_memory(self) -> bool {
        matches!(
            self,
            Self::Store | Self::Free | Self::FreeArr | Self::Decref | Self::Unlock
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub kind: NodeKind,
    pub ty: Option<Ty>,
    assign: Option<Var>,
    args: Vec<Arg>,
    next: Vec<NodeId>,
    prev: Vec<NodeId>,
}

impl NodeData {
    pub fn new(kind: NodeKind, assign: Option<Var>, ty: Option<Ty>, args: Vec<Arg>) -> Self {
        Self {
            kind,
            ty,
            assign,
            args,
            next: Vec::new(),
            prev: Vec::new(),
        }
    }

    pub fn assign(&self) -> Option<Var> {
        self.assign
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Successors. Only `if` has two.
    pub fn next(&self) -> &[NodeId] {
        &self.next
    }

    pub fn prev(&self) -> &[NodeId] {
        &self.prev
    }

    pub fn first_next(&self) -> Option<NodeId> {
        self.next.first().copied()
    }

    pub fn first_prev(&self) -> Option<NodeId> {
        self.prev.first().copied()
    }

    pub fn partner(&self) -> Option<NodeId> {
        self.kind.partner()
    }

    pub(crate) fn assign_mut(&mut self) -> &mut Option<Var> {
        &mut self.assign
    }

    pub(crate) fn args_mut(&mut self) -> &mut Vec<Arg> {
        &mut self.args
    }

    pub(crate) fn next_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.next
    }

    pub(crate) fn prev_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.prev
    }
}

/// The CFG of one function body.
///
/// Nodes and variables live in arenas and refer to each other by index.
/// Removed nodes stay in the arena but are unreachable from [`Function::entry`].
#[derive(Debug, Clone)]
pub struct Function {
    pub(crate) vars: IndexVec<Var, VarDecl>,
    pub(crate) nodes: IndexVec<NodeId, NodeData>,
    pub(crate) entry: NodeId,
    pub(crate) mem: Var,
    pub(crate) tmp_counter: usize,
}

impl Function {
    /// The `define` node.
    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// The `end` of the `define` node.
    pub fn exit(&self) -> NodeId {
        self.body().end
    }

    fn body(&self) -> &Construct {
        match &self.nodes[self.entry].kind {
            NodeKind::Define { body, .. } => body,
            _ => unreachable!("entry node is always a define"),
        }
    }

    pub fn name(&self) -> &str {
        match &self.nodes[self.entry].kind {
            NodeKind::Define { name, .. } => name,
            _ => unreachable!("entry node is always a define"),
        }
    }

    pub fn ty(&self) -> &FunctionTy {
        match &self.nodes[self.entry].kind {
            NodeKind::Define { ty, .. } => ty,
            _ => unreachable!("entry node is always a define"),
        }
    }

    /// The function may suspend and must be lowered into a state machine.
    pub fn is_async(&self) -> bool {
        self.body().is_async
    }

    /// The pseudo-variable written by nodes that modify memory.
    pub fn mem(&self) -> Var {
        self.mem
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    pub fn kind_mut(&mut self, id: NodeId) -> &mut NodeKind {
        &mut self.nodes[id].kind
    }

    pub fn var(&self, v: Var) -> &VarDecl {
        &self.vars[v]
    }

    pub fn var_mut(&mut self, v: Var) -> &mut VarDecl {
        &mut self.vars[v]
    }

    pub fn vars(&self) -> impl Iterator<Item = (Var, &VarDecl)> {
        self.vars.iter_enumerated()
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Allocates a detached node. Its reads and writes are not counted yet.
    pub fn new_node(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(data)
    }

    pub fn new_var(&mut self, decl: VarDecl) -> Var {
        self.vars.push(decl)
    }

    /// A fresh anonymous variable `%N`.
    pub fn new_tmp(&mut self, ty: Option<Ty>) -> Var {
        let name = format!("%{}", self.tmp_counter);
        self.tmp_counter += 1;
        self.vars.push(VarDecl::new(name, ty))
    }

    /// Calls `f` with `node` and every sub-expression nested in its arguments,
    /// outer nodes first.
    pub fn walk_nested(&self, node: NodeId, f: &mut impl FnMut(NodeId, &NodeData)) {
        let data = &self.nodes[node];
        f(node, data);
        for arg in &data.args {
            if let Arg::Node(inner) = arg {
                self.walk_nested(*inner, f);
            }
        }
    }

    /// The node, or one of its sub-expressions, satisfies `pred`.
    pub fn any_nested(&self, node: NodeId, pred: &mut impl FnMut(&NodeData) -> bool) -> bool {
        let data = &self.nodes[node];
        pred(data)
            || data.args.iter().any(|arg| match arg {
                Arg::Node(inner) => self.any_nested(*inner, pred),
                _ => false,
            })
    }
}
