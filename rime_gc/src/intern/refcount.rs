//! Reference counts of interned objects.
//!
//! The top of the `u32` range is reserved for sentinels:
//!
//! | value              | meaning                                          |
//! |--------------------|--------------------------------------------------|
//! | `1..=MAX_REFCOUNT` | ordinary, definitely acyclic interned object     |
//! | `CYCLE_MEMBER`     | member of an interned cycle; counted by handle   |
//! | `BEING_INTERNED`   | clone owned by an in-flight intern operation     |
//! | `DEAD`             | released (debug builds only)                     |
//!
//! Every count goes through [`refcount_delegate`]: a cycle member's count
//! lives on its cycle handle, everything else counts itself.

use rime_core::IObjPtr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Refcount stored in released objects in debug builds.
pub const DEAD: u32 = u32::MAX - 54;

/// Refcount of a clone that is still being interned.
pub const BEING_INTERNED: u32 = u32::MAX - 65;

/// Refcount of a cycle member.
pub const CYCLE_MEMBER: u32 = u32::MAX - 98;

/// Largest ordinary refcount.
pub const MAX_REFCOUNT: u32 = CYCLE_MEMBER - 1;

const _: () = assert!(MAX_REFCOUNT < CYCLE_MEMBER);
const _: () = assert!(CYCLE_MEMBER < BEING_INTERNED);
const _: () = assert!(BEING_INTERNED < DEAD);

/// The object owning `obj`'s refcount: its cycle handle for cycle members,
/// `obj` itself otherwise.
#[inline]
pub fn refcount_delegate(obj: IObjPtr) -> IObjPtr {
    if is_cycle_member(obj) {
        match obj.next() {
            Some(handle) => handle,
            None => unreachable!("cycle member without a handle"),
        }
    } else {
        obj
    }
}

/// Take a reference to `obj`.
#[inline]
pub fn incref(obj: IObjPtr) {
    let delegate = refcount_delegate(obj);
    let prev = delegate.refcount_cell().fetch_add(1, Ordering::Relaxed);
    debug_assert!(prev < MAX_REFCOUNT, "refcount overflow or sentinel: {prev}");
}

/// Decrement `refcount` unless that would drop it to zero.
///
/// Returns false, leaving the count untouched, if the caller holds the last
/// reference.
#[inline]
pub fn decref_to_nonzero(refcount: &AtomicU32) -> bool {
    let mut rc = refcount.load(Ordering::Relaxed);
    debug_assert!(rc <= MAX_REFCOUNT, "decref of sentinel refcount {rc}");
    while rc > 1 {
        match refcount.compare_exchange_weak(rc, rc - 1, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => rc = actual,
        }
    }
    debug_assert!(rc > 0, "decref of dead object");
    false
}

/// True for members of an interned cycle.
#[inline]
pub fn is_cycle_member(obj: IObjPtr) -> bool {
    obj.refcount() == CYCLE_MEMBER
}

/// True once `obj` is published in the intern table, either on its own or
/// as a cycle member.
#[inline]
pub fn is_fully_interned(obj: IObjPtr) -> bool {
    obj.refcount() <= CYCLE_MEMBER
}

/// True for interned objects proven not to be part of any cycle.
///
/// References to such objects have fixed addresses that are safe to hash
/// and compare bitwise.
#[inline]
pub fn is_definitely_acyclic(obj: IObjPtr) -> bool {
    let rc = obj.refcount();
    debug_assert!(rc < DEAD, "use of released object");
    rc <= MAX_REFCOUNT
}
