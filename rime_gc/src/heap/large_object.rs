//! Out-of-band allocations.
//!
//! Objects too big for a chunk, and anything explicitly pinned, get their
//! own allocation from the global allocator:
//!
//! ```text
//!   ┌──────────────────────┬───────────────────────────┐
//!   │ LargeObjHeader       │ payload (size bytes)      │
//!   │  pos | size          │                           │
//!   └──────────────────────┴───────────────────────────┘
//! ```
//!
//! A large object never moves. Its `pos` is the position of an 8-byte
//! placeholder bump-allocated in the owning arena, which gives it a place
//! in allocation order. The collector keeps a large object alive by
//! rewriting that position instead of copying it.

use super::Pos;
use rime_core::{ALLOC_ALIGN, OBJECT_HEADER_SIZE, ObjPtr};
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

#[repr(C)]
struct LargeObjHeader {
    pos: Pos,
    size: usize,
}

const LARGE_HEADER_SIZE: usize = std::mem::size_of::<LargeObjHeader>();

const _: () = assert!(LARGE_HEADER_SIZE == 16);

#[inline]
fn layout_for(size: usize) -> Layout {
    match Layout::from_size_align(LARGE_HEADER_SIZE + size, ALLOC_ALIGN) {
        Ok(layout) => layout,
        Err(_) => panic!("large allocation of {size} bytes overflows"),
    }
}

/// Handle to one live large allocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct LargeObject(NonNull<LargeObjHeader>);

impl LargeObject {
    /// Allocate `size` payload bytes positioned at `pos`.
    pub fn alloc(size: usize, pos: Pos) -> Self {
        let layout = layout_for(size);
        // SAFETY: the layout is never zero-sized.
        let raw = unsafe { alloc(layout) };
        let Some(header) = NonNull::new(raw as *mut LargeObjHeader) else {
            handle_alloc_error(layout)
        };
        // SAFETY: freshly allocated and suitably aligned.
        unsafe { header.as_ptr().write(LargeObjHeader { pos, size }) };
        LargeObject(header)
    }

    /// The allocation holding a large-kind object.
    ///
    /// # Safety
    ///
    /// `obj` must have been built by the arena inside a large allocation.
    #[inline]
    pub unsafe fn of_object(obj: ObjPtr) -> Self {
        // SAFETY: the object header directly follows the large header.
        unsafe {
            let header = obj.as_ptr().sub(OBJECT_HEADER_SIZE + LARGE_HEADER_SIZE);
            LargeObject(NonNull::new_unchecked(header as *mut LargeObjHeader))
        }
    }

    /// First payload byte.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: the payload follows the header in the same allocation.
        unsafe { NonNull::new_unchecked((self.0.as_ptr() as *mut u8).add(LARGE_HEADER_SIZE)) }
    }

    #[inline]
    pub fn pos(self) -> Pos {
        // SAFETY: live large objects have initialized headers.
        unsafe { (*self.0.as_ptr()).pos }
    }

    #[inline]
    pub fn set_pos(self, pos: Pos) {
        // SAFETY: see pos.
        unsafe { (*self.0.as_ptr()).pos = pos }
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: see pos.
        unsafe { (*self.0.as_ptr()).size }
    }

    /// Release the allocation.
    ///
    /// # Safety
    ///
    /// Nothing may reference the payload afterwards.
    pub unsafe fn free(self) {
        let layout = layout_for(self.size());
        // SAFETY: allocated with the same layout.
        unsafe { dealloc(self.0.as_ptr() as *mut u8, layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rime_core::{MemoryKind, Type};

    static BLOB: Type = Type::array("Blob", 1, &[]);

    #[test]
    fn test_header_round_trip() {
        let large = LargeObject::alloc(64, Pos::new(3, 24));
        assert_eq!(large.size(), 64);
        assert_eq!(large.pos(), Pos::new(3, 24));
        large.set_pos(Pos::new(3, 16));
        assert_eq!(large.pos(), Pos::new(3, 16));
        unsafe { large.free() };
    }

    #[test]
    fn test_object_lookup() {
        let large = LargeObject::alloc(OBJECT_HEADER_SIZE + 40, Pos::new(0, 8));
        let obj = unsafe { ObjPtr::init_at(large.payload().as_ptr(), &BLOB, 40, MemoryKind::Large) };
        assert_eq!(unsafe { LargeObject::of_object(obj) }, large);
        unsafe { large.free() };
    }
}
