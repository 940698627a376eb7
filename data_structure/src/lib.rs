//! Shared containers used by the IR and its passes.
pub mod graph;
pub mod index;
mod set_like_vec;

pub use bitvec::vec::BitVec;
pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
pub use set_like_vec::SetLikeVec;
