//! Cycle handles.
//!
//! An interned strongly connected component is published in the table
//! through a single handle object:
//!
//! ```text
//!   CycleHandle ──root──► member ──► member ──► member
//!   refcount: N            ▲                      │
//!   hash                   └──────────────────────┘
//!                    refcount: CYCLE_MEMBER, next: handle
//! ```
//!
//! The handle owns the refcount of every member. Members reference each
//! other without counting; references from outside the component count
//! against the handle.

use super::storage;
use rime_core::hash::raw_object_hash;
use rime_core::{IObjPtr, Type};

/// Type of every cycle handle: the root reference, then the cycle's hash.
pub static CYCLE_HANDLE: Type = Type::cycle_handle("CycleHandle", 16, &[ROOT_OFFSET]);

const ROOT_OFFSET: usize = 0;
const HASH_OFFSET: usize = 8;

/// Allocate an unpublished handle for the component rooted at `root`.
pub(crate) fn new(hash: u64, root: IObjPtr) -> IObjPtr {
    let handle = storage::alloc(&CYCLE_HANDLE, 0);
    handle.write_ref(ROOT_OFFSET, Some(root.obj()));
    handle.write_u64(HASH_OFFSET, hash);
    handle.set_frozen();
    handle
}

/// The component's root member.
#[inline]
pub fn root(handle: IObjPtr) -> IObjPtr {
    debug_assert!(handle.ty().is_cycle_handle());
    match handle.read_ref(ROOT_OFFSET) {
        Some(root) => storage::as_iobj(root),
        None => unreachable!("cycle handle without a root"),
    }
}

/// The component's structural hash.
#[inline]
pub fn hash(handle: IObjPtr) -> u64 {
    debug_assert!(handle.ty().is_cycle_handle());
    handle.read_u64(HASH_OFFSET)
}

/// Hash under which `iobj` is stored in the table.
pub(crate) fn object_hash(iobj: IObjPtr) -> u64 {
    if iobj.ty().is_cycle_handle() {
        hash(iobj)
    } else {
        raw_object_hash(iobj.obj())
    }
}
