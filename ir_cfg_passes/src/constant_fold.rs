use ir_cfg::{Arg, Function, IrError, Literal, NodeId, NodeKind, Opcode, Var};
use log::{debug, trace};
use middleware::GlobalContext;
use ty::{ScalarTy, TargetLayout, Ty};

use crate::CfgPass;

/// Propagates variables that are assigned a literal exactly once.
///
/// The defining node is removed and every later operand naming the variable
/// is replaced by the literal. With `fold_arithmetic` enabled, operations
/// whose operands all became literals are evaluated as well.
pub struct ConstantFold;

impl<'ctx> CfgPass<'ctx> for ConstantFold {
    fn run_pass(&mut self, ctx: &GlobalContext<'ctx>, function: &mut Function) -> Result<(), IrError> {
        let mut folder = Folder {
            function,
            layout: *ctx.types().target(),
            fold_arithmetic: ctx.options().fold_arithmetic,
            folded: 0,
        };
        let (entry, exit) = (folder.function.entry(), folder.function.exit());
        folder.fold_strain(entry, exit)?;
        debug!("{}: folded {} constants", folder.function.name(), folder.folded);
        Ok(())
    }
}

struct Folder<'a> {
    function: &'a mut Function,
    layout: TargetLayout,
    fold_arithmetic: bool,
    folded: usize,
}

impl Folder<'_> {
    fn fold_strain(&mut self, start: NodeId, end: NodeId) -> Result<(), IrError> {
        let mut n = Some(start);
        while let Some(node) = n.filter(|n| *n != end) {
            let data = self.function.node(node);
            if let (NodeKind::If(c), [_, else_first]) = (&data.kind, data.next()) {
                let (else_first, if_end) = (*else_first, c.end);
                self.fold_strain(else_first, if_end)?;
            }
            let next = self.function.node(node).first_next();
            if self.fold_definition(node)? {
                n = next;
                continue;
            }
            self.propagate(node)?;
            if self.fold_arithmetic && self.evaluate(node)? && self.fold_definition(node)? {
                n = next;
                continue;
            }
            n = self.function.node(node).first_next();
        }
        Ok(())
    }

    /// The literal of a definition that can be folded away.
    fn definition(&self, node: NodeId) -> Option<(Var, Literal)> {
        let data = self.function.node(node);
        let v = data.assign()?;
        let lit = match (&data.kind, data.args()) {
            (NodeKind::Op(Opcode::Const), [Arg::Lit(lit)]) => lit,
            (NodeKind::Op(Opcode::Copy), [Arg::Lit(lit)]) if lit.is_numeric() => lit,
            _ => return None,
        };
        let decl = self.function.var(v);
        (decl.write_count() == 1 && !decl.addressable).then(|| (v, lit.clone()))
    }

    fn fold_definition(&mut self, node: NodeId) -> Result<bool, IrError> {
        let Some((v, lit)) = self.definition(node) else {
            return Ok(false);
        };
        trace!("{} := {lit}", self.function.var(v).name);
        self.function.var_mut(v).constant = Some(lit);
        self.function.release_write(v)?;
        self.function.remove_node(node)?;
        self.folded += 1;
        Ok(true)
    }

    fn propagate(&mut self, node: NodeId) -> Result<(), IrError> {
        for i in 0..self.function.node(node).args().len() {
            let Some(v) = self.function.node(node).args()[i].as_var() else {
                continue;
            };
            match &self.function.var(v).constant {
                Some(lit) if lit.is_numeric() => {
                    let lit = lit.clone();
                    self.function.replace_arg(node, i, Arg::Lit(lit))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Turns an operation on literals into `const`.
    fn evaluate(&mut self, node: NodeId) -> Result<bool, IrError> {
        let data = self.function.node(node);
        let NodeKind::Op(op) = data.kind else {
            return Ok(false);
        };
        if data.assign().is_none() {
            return Ok(false);
        }
        let Some(lits) = data
            .args()
            .iter()
            .map(|arg| arg.as_lit().filter(|lit| lit.is_numeric()).cloned())
            .collect::<Option<Vec<_>>>()
        else {
            return Ok(false);
        };
        let scalar = data.ty.as_ref().and_then(Ty::as_scalar);
        let Some(folded) = fold_op(op, &lits, scalar, &self.layout) else {
            return Ok(false);
        };
        trace!("{} folded to {folded}", self.function.display_node(node));
        *self.function.kind_mut(node) = NodeKind::Op(Opcode::Const);
        self.function.set_args(node, vec![Arg::Lit(folded)])?;
        Ok(true)
    }
}

/// Truncates `value` to the width of the result type.
fn wrap_int(value: i64, ty: Option<ScalarTy>, layout: &TargetLayout) -> i64 {
    let Some(ty) = ty.filter(|ty| !ty.is_float()) else {
        return value;
    };
    let bits = ty.size(layout) * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits as u32;
    if ty.is_signed() {
        (value << shift) >> shift
    } else {
        ((value as u64) << shift >> shift) as i64
    }
}

fn fold_op(op: Opcode, args: &[Literal], ty: Option<ScalarTy>, layout: &TargetLayout) -> Option<Literal> {
    use Literal::{Float, Int};

    let bool_lit = |b: bool| Some(Int(b as i64));
    let folded = match (op, args) {
        (Opcode::Eqz, [Int(x)]) => return bool_lit(*x == 0),
        (Opcode::Neg, [Int(x)]) => Int(x.wrapping_neg()),
        (Opcode::Neg, [Float(x)]) => Float(-x),
        (Opcode::Abs, [Float(x)]) => Float(x.abs()),
        (Opcode::Sqrt, [Float(x)]) => Float(x.sqrt()),
        (Opcode::Ceil, [Float(x)]) => Float(x.ceil()),
        (Opcode::Floor, [Float(x)]) => Float(x.floor()),
        (Opcode::Trunc, [Float(x)]) => Float(x.trunc()),
        (Opcode::Nearest, [Float(x)]) => Float(x.round_ties_even()),

        (Opcode::Add, [Int(x), Int(y)]) => Int(x.wrapping_add(*y)),
        (Opcode::Sub, [Int(x), Int(y)]) => Int(x.wrapping_sub(*y)),
        (Opcode::Mul, [Int(x), Int(y)]) => Int(x.wrapping_mul(*y)),
        (Opcode::Div | Opcode::DivS, [Int(x), Int(y)]) => Int(x.checked_div(*y)?),
        (Opcode::DivU, [Int(x), Int(y)]) => Int((*x as u64).checked_div(*y as u64)? as i64),
        (Opcode::RemS, [Int(x), Int(y)]) => Int(x.checked_rem(*y)?),
        (Opcode::RemU, [Int(x), Int(y)]) => Int((*x as u64).checked_rem(*y as u64)? as i64),
        (Opcode::And, [Int(x), Int(y)]) => Int(x & y),
        (Opcode::Or, [Int(x), Int(y)]) => Int(x | y),
        (Opcode::Xor, [Int(x), Int(y)]) => Int(x ^ y),
        (Opcode::Shl, [Int(x), Int(y)]) => Int(x.wrapping_shl(*y as u32)),
        (Opcode::ShrS, [Int(x), Int(y)]) => Int(x.wrapping_shr(*y as u32)),
        (Opcode::ShrU, [Int(x), Int(y)]) => Int((*x as u64).wrapping_shr(*y as u32) as i64),
        (Opcode::Min, [Int(x), Int(y)]) => Int(*x.min(y)),
        (Opcode::Max, [Int(x), Int(y)]) => Int(*x.max(y)),
        (Opcode::Eq, [Int(x), Int(y)]) => return bool_lit(x == y),
        (Opcode::Ne, [Int(x), Int(y)]) => return bool_lit(x != y),
        (Opcode::LtS | Opcode::Lt, [Int(x), Int(y)]) => return bool_lit(x < y),
        (Opcode::LeS | Opcode::Le, [Int(x), Int(y)]) => return bool_lit(x <= y),
        (Opcode::GtS | Opcode::Gt, [Int(x), Int(y)]) => return bool_lit(x > y),
        (Opcode::GeS | Opcode::Ge, [Int(x), Int(y)]) => return bool_lit(x >= y),
        (Opcode::LtU, [Int(x), Int(y)]) => return bool_lit((*x as u64) < (*y as u64)),
        (Opcode::LeU, [Int(x), Int(y)]) => return bool_lit((*x as u64) <= (*y as u64)),
        (Opcode::GtU, [Int(x), Int(y)]) => return bool_lit((*x as u64) > (*y as u64)),
        (Opcode::GeU, [Int(x), Int(y)]) => return bool_lit((*x as u64) >= (*y as u64)),

        (Opcode::Add, [Float(x), Float(y)]) => Float(x + y),
        (Opcode::Sub, [Float(x), Float(y)]) => Float(x - y),
        (Opcode::Mul, [Float(x), Float(y)]) => Float(x * y),
        (Opcode::Div, [Float(x), Float(y)]) => Float(x / y),
        (Opcode::Min, [Float(x), Float(y)]) => Float(x.min(*y)),
        (Opcode::Max, [Float(x), Float(y)]) => Float(x.max(*y)),
        (Opcode::Eq, [Float(x), Float(y)]) => return bool_lit(x == y),
        (Opcode::Ne, [Float(x), Float(y)]) => return bool_lit(x != y),
        (Opcode::Lt, [Float(x), Float(y)]) => return bool_lit(x < y),
        (Opcode::Le, [Float(x), Float(y)]) => return bool_lit(x <= y),
        (Opcode::Gt, [Float(x), Float(y)]) => return bool_lit(x > y),
        (Opcode::Ge, [Float(x), Float(y)]) => return bool_lit(x >= y),
        _ => return None,
    };
    Some(match folded {
        Int(v) => Int(wrap_int(v, ty, layout)),
        other => other,
    })
}
