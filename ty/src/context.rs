use std::cell::OnceCell;

use data_structure::{
    index::{
        vec::{Idx, IndexVec},
        Indexable,
    },
    FxHashMap, FxHashSet,
};
use thiserror::Error;

use crate::{StructId, TargetLayout, Ty};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("struct.{} has no field `{name}`", .id.index())]
    UnknownField { id: StructId, name: String },
    #[error("struct.{} contains itself by value", .0.index())]
    RecursiveByValue(StructId),
    #[error("struct.{} is already laid out and cannot gain fields", .0.index())]
    AlreadyFinalized(StructId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
    /// Number of consecutive elements, for inline arrays.
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub size: usize,
    pub align: usize,
    pub offsets: FxHashMap<String, usize>,
}

#[derive(Debug)]
pub struct StructDef {
    pub name: Option<String>,
    pub fields: Vec<Field>,
    pub is_union: bool,
    /// Field lookups that fail here continue in the base struct.
    pub extends: Option<StructId>,
    layout: OnceCell<StructLayout>,
}
impl Indexable<StructId> for StructDef {}

impl StructDef {
    pub fn is_finalized(&self) -> bool {
        self.layout.get().is_some()
    }
}

impl std::fmt::Display for StructDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "struct{{...}}"),
        }
    }
}

/// Owns the record types of a compilation unit and computes their layout.
#[derive(Debug, Default)]
pub struct TypeContext {
    layout: TargetLayout,
    structs: IndexVec<StructId, StructDef>,
}

impl TypeContext {
    pub fn new(layout: TargetLayout) -> Self {
        Self {
            layout,
            structs: IndexVec::new(),
        }
    }

    pub fn target(&self) -> &TargetLayout {
        &self.layout
    }

    pub fn new_struct(&mut self, name: Option<&str>) -> StructId {
        self.push_def(name, false)
    }

    pub fn new_union(&mut self, name: Option<&str>) -> StructId {
        self.push_def(name, true)
    }

    fn push_def(&mut self, name: Option<&str>, is_union: bool) -> StructId {
        self.structs.push(StructDef {
            name: name.map(str::to_owned),
            fields: Vec::new(),
            is_union,
            extends: None,
            layout: OnceCell::new(),
        })
    }

    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id]
    }

    /// Appends a field and returns its index.
    pub fn add_field(
        &mut self,
        id: StructId,
        name: &str,
        ty: Ty,
        count: usize,
    ) -> Result<usize, TypeError> {
        let def = &mut self.structs[id];
        if def.is_finalized() {
            return Err(TypeError::AlreadyFinalized(id));
        }
        def.fields.push(Field {
            name: name.to_owned(),
            ty,
            count,
        });
        Ok(def.fields.len() - 1)
    }

    /// Copies all fields of `from` into `id`.
    pub fn add_fields(&mut self, id: StructId, from: StructId) -> Result<(), TypeError> {
        let fields = self.structs[from].fields.clone();
        for field in fields {
            self.add_field(id, &field.name, field.ty, field.count)?;
        }
        Ok(())
    }

    pub fn extend(&mut self, id: StructId, base: StructId) {
        self.structs[id].extends = Some(base);
    }

    /// Computes (once) the size, alignment and field offsets of a struct.
    ///
    /// Fields of struct type are laid out first; pointer fields are not followed.
    pub fn finalize(&self, id: StructId) -> Result<&StructLayout, TypeError> {
        self.finalize_guarded(id, &mut Vec::new())
    }

    fn finalize_guarded(
        &self,
        id: StructId,
        in_progress: &mut Vec<StructId>,
    ) -> Result<&StructLayout, TypeError> {
        let def = &self.structs[id];
        if let Some(layout) = def.layout.get() {
            return Ok(layout);
        }
        if in_progress.contains(&id) {
            return Err(TypeError::RecursiveByValue(id));
        }
        in_progress.push(id);

        let mut size = 0;
        let mut align = 1;
        let mut offsets = FxHashMap::default();
        for field in &def.fields {
            let field_size = self.size_guarded(&field.ty, in_progress)?;
            let field_align = self.align_guarded(&field.ty, in_progress)?;
            if def.is_union {
                size = size.max(field_size);
                offsets.insert(field.name.clone(), 0);
            } else {
                align = align.max(field_align);
                size += (field_align - size % field_align) % field_align;
                offsets.insert(field.name.clone(), size);
                size += field.count * Self::round_up(field_size, field_align);
            }
        }
        if def.is_union {
            align = def
                .fields
                .iter()
                .map(|field| self.align_guarded(&field.ty, in_progress))
                .try_fold(1, |acc, a| a.map(|a| acc.max(a)))?;
        }
        in_progress.pop();

        Ok(def.layout.get_or_init(|| StructLayout {
            size,
            align,
            offsets,
        }))
    }

    fn round_up(size: usize, align: usize) -> usize {
        if size == 0 {
            0
        } else {
            align * size.div_ceil(align)
        }
    }

    fn size_guarded(&self, ty: &Ty, in_progress: &mut Vec<StructId>) -> Result<usize, TypeError> {
        match ty {
            Ty::Scalar(s) => Ok(s.size(&self.layout)),
            Ty::Pointer(_) => Ok(self.layout.ptr_size),
            Ty::Struct(id) => Ok(self.finalize_guarded(*id, in_progress)?.size),
        }
    }

    fn align_guarded(&self, ty: &Ty, in_progress: &mut Vec<StructId>) -> Result<usize, TypeError> {
        match ty {
            Ty::Scalar(s) => Ok(s.align(&self.layout)),
            Ty::Pointer(_) => Ok(self.layout.ptr_size),
            Ty::Struct(id) if self.structs[*id].fields.is_empty() => Ok(1),
            Ty::Struct(id) => Ok(self.finalize_guarded(*id, in_progress)?.align),
        }
    }

    pub fn size_of(&self, ty: &Ty) -> Result<usize, TypeError> {
        self.size_guarded(ty, &mut Vec::new())
    }

    pub fn align_of(&self, ty: &Ty) -> Result<usize, TypeError> {
        self.align_guarded(ty, &mut Vec::new())
    }

    /// Size rounded up to a multiple of the alignment; zero-sized types stay zero.
    pub fn aligned_size_of(&self, ty: &Ty) -> Result<usize, TypeError> {
        Ok(Self::round_up(self.size_of(ty)?, self.align_of(ty)?))
    }

    pub fn field_offset(&self, id: StructId, name: &str) -> Result<usize, TypeError> {
        if let Some(offset) = self.finalize(id)?.offsets.get(name) {
            return Ok(*offset);
        }
        match self.structs[id].extends {
            Some(base) => self.field_offset(base, name),
            None => Err(TypeError::UnknownField {
                id,
                name: name.to_owned(),
            }),
        }
    }

    pub fn field_index(&self, id: StructId, name: &str) -> Result<usize, TypeError> {
        self.structs[id]
            .fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| TypeError::UnknownField {
                id,
                name: name.to_owned(),
            })
    }

    pub fn field_ty(&self, id: StructId, name: &str) -> Result<&Ty, TypeError> {
        let index = self.field_index(id, name)?;
        Ok(&self.structs[id].fields[index].ty)
    }

    /// Structural type equality. Structs compare field by field, pointers by
    /// their element type.
    pub fn same_type(&self, a: &Ty, b: &Ty) -> bool {
        self.same_type_assuming(a, b, &mut FxHashSet::default())
    }

    // `assumed` holds struct pairs currently under comparison; meeting one
    // again through a pointer cycle counts as equal.
    fn same_type_assuming(
        &self,
        a: &Ty,
        b: &Ty,
        assumed: &mut FxHashSet<(StructId, StructId)>,
    ) -> bool {
        match (a, b) {
            (Ty::Scalar(a), Ty::Scalar(b)) => a == b,
            (Ty::Pointer(a), Ty::Pointer(b)) => self.same_type_assuming(&a.elem, &b.elem, assumed),
            (Ty::Struct(a), Ty::Struct(b)) if a == b => true,
            (Ty::Struct(a), Ty::Struct(b)) => {
                if !assumed.insert((*a, *b)) {
                    return true;
                }
                let (fa, fb) = (&self.structs[*a].fields, &self.structs[*b].fields);
                fa.len() == fb.len()
                    && fa
                        .iter()
                        .zip(fb)
                        .all(|(x, y)| self.same_type_assuming(&x.ty, &y.ty, assumed))
            }
            _ => false,
        }
    }

    /// Whether a value of this type holds something the garbage collector traces.
    pub fn has_pointers(&self, ty: &Ty) -> bool {
        self.has_pointers_guarded(ty, &mut FxHashSet::default())
    }

    fn has_pointers_guarded(&self, ty: &Ty, seen: &mut FxHashSet<StructId>) -> bool {
        match ty {
            Ty::Scalar(s) => *s == crate::ScalarTy::Ptr,
            Ty::Pointer(_) => true,
            Ty::Struct(id) => {
                seen.insert(*id)
                    && self.structs[*id]
                        .fields
                        .iter()
                        .any(|field| self.has_pointers_guarded(&field.ty, seen))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScalarTy;

    fn ctx() -> TypeContext {
        TypeContext::new(TargetLayout::default())
    }

    #[test]
    fn struct_fields_are_aligned() {
        let mut ctx = ctx();
        let s = ctx.new_struct(Some("point"));
        ctx.add_field(s, "tag", Ty::I8, 1).unwrap();
        ctx.add_field(s, "x", Ty::I32, 1).unwrap();
        ctx.add_field(s, "next", Ty::PTR, 1).unwrap();
        ctx.add_field(s, "bytes", Ty::I8, 3).unwrap();

        assert_eq!(ctx.field_offset(s, "tag").unwrap(), 0);
        assert_eq!(ctx.field_offset(s, "x").unwrap(), 4);
        assert_eq!(ctx.field_offset(s, "next").unwrap(), 8);
        assert_eq!(ctx.field_offset(s, "bytes").unwrap(), 16);
        assert_eq!(ctx.size_of(&Ty::Struct(s)).unwrap(), 19);
        assert_eq!(ctx.align_of(&Ty::Struct(s)).unwrap(), 8);
        assert_eq!(ctx.aligned_size_of(&Ty::Struct(s)).unwrap(), 24);
        assert!(matches!(
            ctx.add_field(s, "late", Ty::I8, 1),
            Err(TypeError::AlreadyFinalized(_))
        ));
    }

    #[test]
    fn unions_overlap() {
        let mut ctx = ctx();
        let u = ctx.new_union(None);
        ctx.add_field(u, "a", Ty::I8, 1).unwrap();
        ctx.add_field(u, "b", Ty::F64, 1).unwrap();
        assert_eq!(ctx.field_offset(u, "b").unwrap(), 0);
        assert_eq!(ctx.size_of(&Ty::Struct(u)).unwrap(), 8);
        assert_eq!(ctx.align_of(&Ty::Struct(u)).unwrap(), 8);
    }

    #[test]
    fn extends_falls_back_to_base() {
        let mut ctx = ctx();
        let base = ctx.new_struct(Some("base"));
        ctx.add_field(base, "id", Ty::I64, 1).unwrap();
        let derived = ctx.new_struct(Some("derived"));
        ctx.add_field(derived, "extra", Ty::I32, 1).unwrap();
        ctx.extend(derived, base);
        assert_eq!(ctx.field_offset(derived, "id").unwrap(), 0);
        assert!(matches!(
            ctx.field_offset(derived, "missing"),
            Err(TypeError::UnknownField { .. })
        ));
    }

    #[test]
    fn recursion_through_pointers_is_fine() {
        let mut ctx = ctx();
        let list = ctx.new_struct(Some("list"));
        ctx.add_field(list, "value", Ty::I32, 1).unwrap();
        ctx.add_field(list, "next", Ty::pointer_to(Ty::Struct(list), false), 1)
            .unwrap();
        assert_eq!(ctx.size_of(&Ty::Struct(list)).unwrap(), 16);
        assert!(ctx.has_pointers(&Ty::Struct(list)));

        let other = ctx.new_struct(Some("other"));
        ctx.add_field(other, "value", Ty::I32, 1).unwrap();
        ctx.add_field(other, "next", Ty::pointer_to(Ty::Struct(other), false), 1)
            .unwrap();
        assert!(ctx.same_type(&Ty::Struct(list), &Ty::Struct(other)));
        assert!(!ctx.same_type(&Ty::Struct(list), &Ty::I32));
    }

    #[test]
    fn recursion_by_value_is_rejected() {
        let mut ctx = ctx();
        let a = ctx.new_struct(Some("a"));
        let b = ctx.new_struct(Some("b"));
        ctx.add_field(a, "b", Ty::Struct(b), 1).unwrap();
        ctx.add_field(b, "a", Ty::Struct(a), 1).unwrap();
        assert!(matches!(ctx.finalize(a), Err(TypeError::RecursiveByValue(_))));
    }

    #[test]
    fn pointer_free_structs() {
        let mut ctx = ctx();
        let s = ctx.new_struct(None);
        ctx.add_field(s, "len", Ty::Scalar(ScalarTy::Int), 1).unwrap();
        ctx.add_field(s, "data", Ty::ADDR, 1).unwrap();
        assert!(!ctx.has_pointers(&Ty::Struct(s)));
        assert!(ctx.has_pointers(&Ty::pointer_to(Ty::I8, true)));
    }
}
