//! Arena memory: slabs, chunks, large objects and the scoped arena itself.
//!
//! # Positions
//!
//! Every byte an arena hands out has a [`Pos`]: its chunk's generation
//! times [`CHUNK_SIZE`] plus its offset in the chunk. Chunks are linked
//! newest to oldest with strictly decreasing generations, so positions
//! grow with allocation order even though chunk addresses do not.
//!
//! ```text
//!   gen 0            gen 1            gen 2
//!   ┌────────────┐   ┌────────────┐   ┌──────────┐
//!   │ old │ old  │◄──│ young      │◄──│ young  ▲ │
//!   └─────▲──────┘   └────────────┘   └────────┼─┘
//!       note                                 cursor
//! ```
//!
//! A [`Note`] captures the cursor. Everything positioned at or after a note
//! is young relative to it and may be reclaimed by collecting at that note.

pub mod arena;
pub mod chunk;
pub(crate) mod extref;
pub(crate) mod large_object;
pub mod page;

pub use arena::Arena;
pub use chunk::{CHUNK_CAPACITY, CHUNK_SIZE, CHUNKS_PER_SLAB};

use chunk::Chunk;
use rime_core::ObjPtr;
use std::fmt;
use std::ptr::NonNull;

/// Allocations of at least this many bytes bypass the chunks.
pub const LARGE_ALLOC_SIZE: usize = CHUNK_SIZE / 2;

const _: () = assert!(LARGE_ALLOC_SIZE < CHUNK_CAPACITY);

/// A totally ordered position in one arena's allocation stream.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pos(usize);

impl Pos {
    #[inline]
    pub(crate) const fn new(generation: usize, offset: usize) -> Self {
        Pos(generation * CHUNK_SIZE + offset)
    }

    /// Position of an address inside a live chunk.
    ///
    /// # Safety
    ///
    /// `addr` must lie inside a chunk whose header is initialized.
    #[inline]
    pub(crate) unsafe fn of_addr(addr: usize) -> Self {
        // SAFETY: forwarded from the caller.
        let chunk = unsafe { Chunk::containing(addr) };
        Pos::new(chunk.generation(), addr & (CHUNK_SIZE - 1))
    }

    /// Position of a chunk-allocated object.
    ///
    /// Measured inside the object header so that an object starting at a
    /// chunk's first byte still resolves to that chunk.
    ///
    /// # Safety
    ///
    /// `obj` must be bump-allocated in a live chunk.
    #[inline]
    pub(crate) unsafe fn of_object(obj: ObjPtr) -> Self {
        unsafe { Pos::of_addr(obj.addr() - rime_core::ALLOC_ALIGN) }
    }

    /// Generation of the chunk this position falls in.
    #[inline]
    pub fn generation(self) -> usize {
        self.0 / CHUNK_SIZE
    }

    /// Byte offset inside the chunk.
    #[inline]
    pub fn offset(self) -> usize {
        self.0 & (CHUNK_SIZE - 1)
    }

    /// The position immediately before this one.
    #[inline]
    pub(crate) fn prev(self) -> Self {
        Pos(self.0 - 1)
    }

    /// Bytes between `earlier` and this position, counting chunk headers
    /// and abandoned chunk tails in between.
    #[inline]
    pub fn distance_from(self, earlier: Pos) -> usize {
        debug_assert!(earlier <= self, "positions out of order");
        self.0 - earlier.0
    }
}

impl fmt::Debug for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pos({}:{})", self.generation(), self.offset())
    }
}

/// A checkpoint in an arena, taken by [`Arena::note`].
///
/// A note stays meaningful as long as nothing older than it has been
/// collected away.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Note(NonNull<u8>);

// Safety: a note is an opaque address; it is only dereferenced by the arena
// that produced it.
unsafe impl Send for Note {}

impl Note {
    #[inline]
    pub(crate) fn from_cursor(cursor: NonNull<u8>) -> Self {
        Note(cursor)
    }

    /// The cursor address this note captured.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> NonNull<u8> {
        self.0
    }

    /// Position of the note. The note's chunk must still be alive.
    #[inline]
    pub(crate) fn pos(self) -> Pos {
        // SAFETY: notes are cursor values of a live arena.
        unsafe { Pos::of_addr(self.addr()) }
    }

    #[inline]
    pub(crate) fn chunk(self) -> Chunk {
        // SAFETY: see pos.
        unsafe { Chunk::containing(self.addr()) }
    }
}

impl fmt::Debug for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Note({:p})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pos_ordering_follows_generation_first() {
        let a = Pos::new(0, CHUNK_SIZE - 8);
        let b = Pos::new(1, 16);
        assert!(a < b);
        assert_eq!(b.generation(), 1);
        assert_eq!(b.offset(), 16);
        assert_eq!(b.distance_from(a), 24);
        assert!(b.prev() < b);
    }
}
