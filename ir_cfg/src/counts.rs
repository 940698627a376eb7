//! Read/write bookkeeping of variables.
//!
//! Every node that enters the instruction stream is counted once and every
//! node that leaves it for good is released once. Passes never touch the
//! counters directly.
use crate::{Arg, Function, IrError, NodeData, NodeId, NodeKind, Opcode, Var};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// The variable accesses a single node performs, ignoring sub-expressions.
pub fn node_accesses(data: &NodeData) -> impl Iterator<Item = (Var, Access)> + '_ {
    let assign = data.assign();
    let (declared_read, write) = match data.kind {
        NodeKind::DeclVar => (None, None),
        // parameters are read by the caller, results by the caller after return
        NodeKind::DeclParam | NodeKind::DeclResult => (assign, assign),
        _ => (None, assign),
    };
    declared_read
        .map(|v| (v, Access::Read))
        .into_iter()
        .chain(write.map(|v| (v, Access::Write)))
        .chain(
            data.args()
                .iter()
                .filter_map(Arg::as_var)
                .map(|v| (v, Access::Read)),
        )
}

impl Function {
    /// The accesses of `node` and all of its sub-expressions.
    ///
    /// A sub-expression with a destination stores its value and leaves it to
    /// the enclosing node, which therefore reads the destination.
    pub fn accesses(&self, node: NodeId) -> Vec<(Var, Access)> {
        let mut out = Vec::new();
        self.walk_nested(node, &mut |id, data| {
            out.extend(node_accesses(data));
            if id != node {
                out.extend(data.assign().map(|v| (v, Access::Read)));
            }
        });
        out
    }

    pub fn add_read(&mut self, v: Var) {
        *self.vars[v].counts_mut().0 += 1;
    }

    pub fn add_write(&mut self, v: Var) {
        *self.vars[v].counts_mut().1 += 1;
    }

    pub fn release_read(&mut self, v: Var) -> Result<(), IrError> {
        self.release(v, Access::Read)
    }

    pub fn release_write(&mut self, v: Var) -> Result<(), IrError> {
        self.release(v, Access::Write)
    }

    fn release(&mut self, v: Var, access: Access) -> Result<(), IrError> {
        let decl = &mut self.vars[v];
        let (reads, writes) = decl.counts_mut();
        let (count, which) = match access {
            Access::Read => (reads, "read"),
            Access::Write => (writes, "write"),
        };
        match count.checked_sub(1) {
            Some(c) => {
                *count = c;
                Ok(())
            }
            None => Err(IrError::CountUnderflow {
                var: decl.name.clone(),
                which,
            }),
        }
    }

    /// Counts a node that has just been added to the instruction stream.
    pub fn count_node(&mut self, node: NodeId) {
        let mut addressed = Vec::new();
        self.walk_nested(node, &mut |_, data| {
            if data.kind.is_op(Opcode::AddrOf) {
                addressed.extend(data.args().first().and_then(Arg::as_var));
            }
        });
        for (v, access) in self.accesses(node) {
            match access {
                Access::Read => self.add_read(v),
                Access::Write => self.add_write(v),
            }
        }
        for v in addressed {
            self.vars[v].addressable = true;
        }
    }

    /// Releases the accesses of a node that is being deleted.
    pub fn uncount_node(&mut self, node: NodeId) -> Result<(), IrError> {
        for (v, access) in self.accesses(node) {
            self.release(v, access)?;
        }
        Ok(())
    }

    /// Releases a deleted node, including the else branch of an `if`.
    pub fn retire_node(&mut self, node: NodeId) -> Result<(), IrError> {
        self.uncount_node(node)?;
        let data = &self.nodes[node];
        let else_strain = match (&data.kind, data.next()) {
            (NodeKind::If(c), [_, else_first]) => Some((*else_first, c.end)),
            _ => None,
        };
        if let Some((first, end)) = else_strain {
            self.retire_strain(first, end)?;
        }
        Ok(())
    }

    /// Releases every node from `first` up to, but excluding, `until`.
    pub fn retire_strain(&mut self, first: NodeId, until: NodeId) -> Result<(), IrError> {
        let mut n = first;
        while n != until {
            let next = self.nodes[n]
                .first_next()
                .ok_or_else(|| IrError::malformed(n, "strain ends before its construct"))?;
            self.retire_node(n)?;
            n = next;
        }
        Ok(())
    }

    /// Redirects the destination of `node`, moving the write count along.
    pub fn set_assign(&mut self, node: NodeId, assign: Option<Var>) -> Result<(), IrError> {
        if let Some(old) = self.nodes[node].assign() {
            self.release_write(old)?;
        }
        if let Some(new) = assign {
            self.add_write(new);
        }
        *self.nodes[node].assign_mut() = assign;
        Ok(())
    }

    /// Replaces all arguments, moving variable reads along.
    pub fn set_args(&mut self, node: NodeId, args: Vec<Arg>) -> Result<Vec<Arg>, IrError> {
        for v in args.iter().filter_map(Arg::as_var) {
            self.add_read(v);
        }
        let old = std::mem::replace(self.nodes[node].args_mut(), args);
        for v in old.iter().filter_map(Arg::as_var) {
            self.release_read(v)?;
        }
        Ok(old)
    }

    /// Replaces an argument and returns the old one.
    ///
    /// Variable reads move along. A replaced sub-expression is returned
    /// with its counts untouched, and a new one is taken over as is.
    pub fn replace_arg(&mut self, node: NodeId, index: usize, arg: Arg) -> Result<Arg, IrError> {
        if let Arg::Var(v) = arg {
            self.add_read(v);
        }
        let slot = self.nodes[node]
            .args_mut()
            .get_mut(index)
            .ok_or_else(|| IrError::malformed(node, format!("no argument {index}")))?;
        let old = std::mem::replace(slot, arg);
        if let Arg::Var(v) = old {
            self.release_read(v)?;
        }
        Ok(old)
    }
}
