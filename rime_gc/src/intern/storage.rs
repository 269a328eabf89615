//! Interned object storage.
//!
//! Interned objects are allocated one by one from the global allocator with
//! an [`InternHeader`] in front of the usual object header. They live until
//! their reference count reaches zero, independent of any arena.

use super::refcount::DEAD;
use rime_core::{
    ALLOC_ALIGN, INTERN_HEADER_SIZE, IObjPtr, InternHeader, MemoryKind, OBJECT_HEADER_SIZE, ObjPtr, StateChange,
    Type,
};
use std::alloc::{Layout, dealloc, handle_alloc_error};

const METADATA_SIZE: usize = INTERN_HEADER_SIZE + OBJECT_HEADER_SIZE;

#[inline]
fn layout_for(user_size: usize) -> Layout {
    // At least one word of user data, so the user pointer of an empty
    // object still lies inside its allocation.
    match Layout::from_size_align(METADATA_SIZE + user_size.max(ALLOC_ALIGN), ALLOC_ALIGN) {
        Ok(layout) => layout,
        Err(_) => panic!("interned object of {user_size} bytes overflows"),
    }
}

/// Allocate a zeroed, unfrozen interned object with refcount 1.
///
/// The object is not in any table.
pub(crate) fn alloc(ty: &'static Type, len: usize) -> IObjPtr {
    let user_size = ty.user_byte_size(len);
    let len = u32::try_from(len).unwrap_or_else(|_| panic!("array length {len} out of range"));
    let layout = layout_for(user_size);
    // SAFETY: the layout is never zero-sized.
    let raw = unsafe { std::alloc::alloc(layout) };
    if raw.is_null() {
        handle_alloc_error(layout);
    }
    // SAFETY: `raw` holds the metadata plus `user_size` bytes, aligned.
    unsafe {
        std::ptr::write_bytes(raw.add(METADATA_SIZE), 0, user_size);
        (raw as *mut InternHeader).write(InternHeader::default());
        let obj = ObjPtr::init_at(raw.add(INTERN_HEADER_SIZE), ty, len, MemoryKind::Interned);
        let iobj = IObjPtr::from_obj(obj);
        iobj.set_refcount(1);
        iobj
    }
}

/// Copy `obj`'s type, length and user data into fresh interned storage.
///
/// The copy is frozen and has refcount 1. References are copied verbatim;
/// no reference is taken on their targets.
pub(crate) fn shallow_clone(obj: ObjPtr) -> IObjPtr {
    let iobj = alloc(obj.ty(), obj.len());
    // SAFETY: same type and length, distinct allocations.
    unsafe { std::ptr::copy_nonoverlapping(obj.as_ptr(), iobj.as_ptr(), obj.user_size()) };
    iobj.set_frozen();
    iobj
}

/// View a reference held by an interned object.
#[inline]
pub(crate) fn as_iobj(obj: ObjPtr) -> IObjPtr {
    debug_assert_eq!(obj.kind(), MemoryKind::Interned, "interned object refers outside interned storage");
    // SAFETY: interned objects only refer to interned objects.
    unsafe { IObjPtr::from_obj(obj) }
}

/// Release storage that was never published.
///
/// # Safety
///
/// Nothing may refer to `iobj` afterwards.
pub(crate) unsafe fn free(iobj: IObjPtr) {
    let layout = layout_for(iobj.user_size());
    if cfg!(debug_assertions) {
        debug_assert_ne!(iobj.refcount(), DEAD, "double free of interned object");
        iobj.set_refcount(DEAD);
    }
    // SAFETY: allocated by `alloc` with the same layout.
    unsafe { dealloc(iobj.start(), layout) }
}

/// Finalize and release a published object.
///
/// # Safety
///
/// As for [`free`]; `iobj` must have been erased from its table.
pub(crate) unsafe fn release(iobj: IObjPtr) {
    if let Some(handler) = iobj.ty().state_change() {
        let before = iobj.refcount();
        handler(iobj, StateChange::Finalize);
        debug_assert_eq!(iobj.refcount(), before, "finalizer changed the refcount");
    }
    // SAFETY: forwarded from the caller.
    unsafe { free(iobj) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GcConfig;
    use crate::heap::Arena;
    use crate::intern::InternTable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CELL: Type = Type::class("Cell", 16, &[0]);
    static EMPTY: Type = Type::class("Empty", 0, &[]);
    static WORDS: Type = Type::array("Words", 8, &[]);

    fn arena() -> Arena {
        Arena::with_table(GcConfig::default(), Arc::new(InternTable::new()))
    }

    #[test]
    fn test_shallow_clone_layout() {
        let mut arena = arena();
        let obj = arena.alloc_object(&CELL, 0);
        obj.write_u64(8, 42);
        let iobj = shallow_clone(obj);
        assert_eq!(iobj.kind(), MemoryKind::Interned);
        assert!(iobj.is_frozen());
        assert_eq!(iobj.refcount(), 1);
        assert_eq!(iobj.next(), None);
        assert_eq!(iobj.read_u64(8), 42);
        assert_eq!(iobj.total_size(), METADATA_SIZE + 16);
        assert_eq!(obj.as_interned(), None);
        assert_eq!(iobj.obj().as_interned(), Some(iobj));
        unsafe { free(iobj) };
    }

    #[test]
    fn test_alloc_is_zeroed_and_unpublished() {
        let iobj = alloc(&WORDS, 5);
        assert_eq!(iobj.len(), 5);
        assert_eq!(iobj.user_size(), 40);
        assert_eq!(iobj.kind(), MemoryKind::Interned);
        assert_eq!(iobj.refcount(), 1);
        assert_eq!(iobj.next(), None);
        assert!(!iobj.is_frozen());
        assert!((0..5).all(|i| iobj.read_u64(i * 8) == 0));
        unsafe { free(iobj) };
    }

    #[test]
    fn test_empty_object_gets_storage() {
        let iobj = alloc(&EMPTY, 0);
        assert_eq!(iobj.user_size(), 0);
        assert_eq!(layout_for(0).size(), METADATA_SIZE + ALLOC_ALIGN);
        unsafe { free(iobj) };
    }

    #[test]
    fn test_release_runs_finalizer() {
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);
        fn on_change(_: IObjPtr, change: StateChange) {
            if change == StateChange::Finalize {
                FINALIZED.fetch_add(1, Ordering::Relaxed);
            }
        }
        static TRACKED: Type = Type::class("Tracked", 8, &[]).with_state_change(on_change);

        let iobj = alloc(&TRACKED, 0);
        unsafe { release(iobj) };
        assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);

        let iobj = alloc(&TRACKED, 0);
        unsafe { free(iobj) };
        assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);
    }
}
