//! Machine-level value types of the CFG IR.
//!
//! Every variable and node of the IR is annotated with a [`Ty`].
//! Record types live in a [`TypeContext`] and are referenced by [`StructId`],
//! which makes recursive types (through pointers) expressible.
pub mod context;

pub use context::{Field, StructDef, StructLayout, TypeContext, TypeError};

use data_structure::newtype_index;
use serde::Deserialize;

newtype_index! {
    /// Index of a struct definition in a [`TypeContext`].
    pub struct StructId;
}

/// Scalar machine types.
///
/// `iN` are unsigned (or sign-agnostic) integers, `sN` are signed ones.
/// `int`/`sint` take the target's natural integer size, `addr` is an untraced
/// address and `ptr` a pointer the garbage collector has to trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarTy {
    I8,
    I16,
    I32,
    I64,
    S8,
    S16,
    S32,
    S64,
    Addr,
    F32,
    F64,
    Ptr,
    Int,
    Sint,
}

impl ScalarTy {
    pub fn is_signed(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64 | Self::Sint)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn size(self, layout: &TargetLayout) -> usize {
        match self {
            Self::I8 | Self::S8 => 1,
            Self::I16 | Self::S16 => 2,
            Self::I32 | Self::S32 | Self::F32 => 4,
            Self::I64 | Self::S64 | Self::F64 => 8,
            Self::Addr | Self::Ptr => layout.ptr_size,
            Self::Int | Self::Sint => layout.int_size,
        }
    }

    /// Scalars are aligned to their own size.
    pub fn align(self, layout: &TargetLayout) -> usize {
        self.size(layout)
    }
}

impl std::fmt::Display for ScalarTy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::Addr => "addr",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::Ptr => "ptr",
            Self::Int => "int",
            Self::Sint => "sint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerTy {
    pub elem: Box<Ty>,
    pub is_const: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Ty {
    Scalar(ScalarTy),
    Pointer(PointerTy),
    Struct(StructId),
}

impl Ty {
    pub const I8: Self = Self::Scalar(ScalarTy::I8);
    pub const I32: Self = Self::Scalar(ScalarTy::I32);
    pub const I64: Self = Self::Scalar(ScalarTy::I64);
    pub const S32: Self = Self::Scalar(ScalarTy::S32);
    pub const F64: Self = Self::Scalar(ScalarTy::F64);
    pub const ADDR: Self = Self::Scalar(ScalarTy::Addr);
    pub const PTR: Self = Self::Scalar(ScalarTy::Ptr);

    pub fn pointer_to(elem: Ty, is_const: bool) -> Self {
        Self::Pointer(PointerTy {
            elem: Box::new(elem),
            is_const,
        })
    }

    pub fn as_scalar(&self) -> Option<ScalarTy> {
        if let Self::Scalar(s) = self {
            Some(*s)
        } else {
            None
        }
    }

    pub fn as_struct(&self) -> Option<StructId> {
        if let Self::Struct(id) = self {
            Some(*id)
        } else {
            None
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }
}

impl From<ScalarTy> for Ty {
    fn from(value: ScalarTy) -> Self {
        Self::Scalar(value)
    }
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ty::Scalar(s) => write!(f, "{s}"),
            Ty::Pointer(p) if p.is_const => write!(f, "*const {}", p.elem),
            Ty::Pointer(p) => write!(f, "*{}", p.elem),
            Ty::Struct(id) => write!(f, "struct.{}", id.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConv {
    #[default]
    Default,
    /// The callee may suspend; callers must be lowered into a state machine.
    Coroutine,
    System,
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionTy {
    pub params: Vec<Ty>,
    pub result: Option<Ty>,
    pub conv: CallingConv,
}

impl FunctionTy {
    pub fn new(params: Vec<Ty>, result: Option<Ty>, conv: CallingConv) -> Self {
        Self {
            params,
            result,
            conv,
        }
    }

    pub fn is_async(&self) -> bool {
        self.conv == CallingConv::Coroutine
    }
}

impl std::fmt::Display for FunctionTy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") => (")?;
        if let Some(result) = &self.result {
            write!(f, "{result}")?;
        }
        write!(f, ")")
    }
}

/// Sizes that depend on the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TargetLayout {
    pub int_size: usize,
    pub ptr_size: usize,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            int_size: 4,
            ptr_size: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sizes_follow_the_target() {
        let wasm32 = TargetLayout {
            int_size: 4,
            ptr_size: 4,
        };
        assert_eq!(ScalarTy::Ptr.size(&wasm32), 4);
        assert_eq!(ScalarTy::Ptr.size(&TargetLayout::default()), 8);
        assert_eq!(ScalarTy::Sint.align(&wasm32), 4);
        assert_eq!(ScalarTy::S16.size(&wasm32), 2);
        assert!(ScalarTy::Sint.is_signed());
        assert!(!ScalarTy::Addr.is_signed());
    }

    #[test]
    fn layout_from_toml_keeps_defaults() {
        let layout: TargetLayout = toml::from_str("ptr_size = 4").unwrap();
        assert_eq!(layout.ptr_size, 4);
        assert_eq!(layout.int_size, 4);
    }

    #[test]
    fn display_types() {
        let ty = FunctionTy::new(
            vec![Ty::I32, Ty::pointer_to(Ty::I8, true)],
            Some(Ty::PTR),
            CallingConv::Coroutine,
        );
        assert_eq!(ty.to_string(), "(i32,*const i8) => (ptr)");
        assert!(ty.is_async());
    }
}
