//! Rime Core
//!
//! Object and type metadata shared by every part of the rime memory
//! system:
//!
//! - [`Type`]: immutable descriptors giving instance size, reference
//!   offsets and optimization hints.
//! - [`ObjPtr`] / [`IObjPtr`]: pointers to managed objects and to
//!   interned objects, with header accessors.
//! - [`hash`]: the hash primitives used for interning.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hash;
pub mod object;
pub mod types;

pub use object::{
    ALLOC_ALIGN, INTERN_HEADER_SIZE, IObjPtr, InternHeader, MemoryKind, OBJECT_HEADER_SIZE, ObjPtr,
    ObjectHeader, align_up,
};
pub use types::{REF_SIZE, StateChange, StateChangeFn, Type, TypeHints, TypeKind};
