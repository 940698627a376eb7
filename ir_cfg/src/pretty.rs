use std::fmt::{self, Display, Formatter};

use crate::syntax::*;

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Prints a single node on one line, sub-expressions in parentheses.
pub struct NodeDisplay<'a> {
    function: &'a Function,
    node: NodeId,
}

impl Function {
    pub fn display_node(&self, node: NodeId) -> NodeDisplay<'_> {
        NodeDisplay {
            function: self,
            node,
        }
    }

    fn jump_target(&self, jump: &Jump) -> String {
        match jump {
            Jump::Pending(_) => "<pending>".to_string(),
            Jump::Terminal => "<end>".to_string(),
            Jump::Step(step) => match self.kind(*step) {
                NodeKind::Step(name) => name.clone(),
                _ => format!("<{step:?}>"),
            },
        }
    }

    fn fmt_strain(&self, f: &mut Formatter<'_>, depth: usize, start: Option<NodeId>) -> fmt::Result {
        let indent = "    ".repeat(depth);
        let mut n = start;
        while let Some(node) = n {
            let data = self.node(node);
            if data.kind.is_end() {
                break;
            }
            writeln!(f, "{indent}{}", self.display_node(node))?;
            match &data.kind {
                NodeKind::Define { body: c, .. } | NodeKind::Block(c) | NodeKind::Loop(c) => {
                    self.fmt_strain(f, depth + 1, data.first_next())?;
                    writeln!(f, "{indent}end")?;
                    n = self.node(c.end).first_next();
                }
                NodeKind::If(c) => {
                    self.fmt_strain(f, depth + 1, data.first_next())?;
                    if let Some(&else_first) = data.next().get(1) {
                        writeln!(f, "{indent}else")?;
                        self.fmt_strain(f, depth + 1, Some(else_first))?;
                    }
                    writeln!(f, "{indent}end")?;
                    n = self.node(c.end).first_next();
                }
                _ => n = data.first_next(),
            }
        }
        Ok(())
    }
}

impl Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let function = self.function;
        let data = function.node(self.node);
        if let Some(v) = data.assign() {
            write!(f, "{} = ", function.var(v).name)?;
        }
        write!(f, "{}", data.kind.mnemonic())?;
        match &data.kind {
            NodeKind::Define { name, ty, .. } => write!(f, " {name} {ty}")?,
            NodeKind::Step(name) => write!(f, " {name}")?,
            NodeKind::GotoStep(jump) | NodeKind::GotoStepIf(jump) => {
                write!(f, " {}", function.jump_target(jump))?
            }
            kind => {
                if let Some(ty) = kind.function_ty() {
                    write!(f, " {ty}")?;
                } else if let Some(ty) = &data.ty {
                    write!(f, " {ty}")?;
                }
            }
        }
        for (i, arg) in data.args().iter().enumerate() {
            f.write_str(if i == 0 { " " } else { ", " })?;
            match arg {
                Arg::Lit(lit) => write!(f, "{lit}")?,
                Arg::Var(v) => write!(f, "{}", function.var(*v).name)?,
                Arg::Node(inner) => write!(f, "({})", function.display_node(*inner))?,
            }
        }
        match &data.kind {
            NodeKind::Br(branch) | NodeKind::BrIf(branch) => {
                let sep = if data.args().is_empty() { " " } else { ", " };
                write!(f, "{sep}{}", branch.depth)
            }
            _ => Ok(()),
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.fmt_strain(f, 0, Some(self.entry()))
    }
}

#[cfg(test)]
mod tests {
    use ty::{CallingConv, FunctionTy, TargetLayout, Ty, TypeContext};

    use crate::{FunctionBuilder, Opcode};

    use super::*;

    #[test]
    fn prints_nested_constructs() {
        let types = TypeContext::new(TargetLayout::default());
        let mut b = FunctionBuilder::define(
            &types,
            "f",
            FunctionTy::new(vec![Ty::I32], None, CallingConv::Default),
        );
        let a = b.declare_param(Ty::I32, "a");
        let outer = b.block();
        b.if_block(a.into());
        b.br(outer).unwrap();
        b.else_block().unwrap();
        let t = b.tmp(None);
        b.assign(Some(t), Opcode::Add, Ty::I32, [a.into(), Arg::int(1)]);
        b.end().unwrap();
        b.end().unwrap();
        b.ret([Arg::float(1.5)]);
        let f = b.finish().unwrap();

        let expected = "\
define f (i32) => ()
    a = decl_param i32
    block
        if a
            br 1
        else
            %0 = add i32 a, 1
        end
    end
    return 1.5
end
";
        assert_eq!(f.to_string(), expected);
    }
}
