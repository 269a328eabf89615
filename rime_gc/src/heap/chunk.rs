//! Arena chunks and the per-arena chunk pool.
//!
//! ```text
//!   slab (2 MiB, 128 chunks)
//!   ┌────────┬────────┬────────┬─────┬────────┐
//!   │ chunk  │ chunk  │ chunk  │ ... │ chunk  │
//!   └────────┴────────┴────────┴─────┴────────┘
//!
//!   chunk (16 KiB, aligned)
//!   ┌──────────────────┬────────────────────────────┬──────┐
//!   │ prev, generation │ bump-allocated objects ... │ 8 B  │
//!   └──────────────────┴────────────────────────────┴──────┘
//!                                                   ▲ end_addr
//! ```
//!
//! The trailing slack keeps a cursor sitting at `end_addr` inside its own
//! chunk, so masking any cursor yields the chunk it belongs to.

use super::Pos;
use super::page::{SLAB_SIZE, alloc_slab, free_slab, slab_base};
use rime_core::ALLOC_ALIGN;
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

/// Size and alignment of one chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Chunks carved from each slab.
pub const CHUNKS_PER_SLAB: usize = SLAB_SIZE / CHUNK_SIZE;

/// Size of the header at the start of every chunk.
pub const CHUNK_HEADER_SIZE: usize = std::mem::size_of::<ChunkHeader>();

/// Bytes available for allocation in one chunk.
pub const CHUNK_CAPACITY: usize = CHUNK_SIZE - CHUNK_HEADER_SIZE - ALLOC_ALIGN;

const _: () = assert!(CHUNK_HEADER_SIZE == 16);
const _: () = assert!(CHUNKS_PER_SLAB == 128);

#[repr(C)]
struct ChunkHeader {
    /// Next older chunk in the arena, or null for the oldest.
    prev: *mut ChunkHeader,
    generation: usize,
}

/// A live chunk linked into some arena's chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    /// The chunk containing `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must lie inside an initialized chunk.
    #[inline]
    pub unsafe fn containing(addr: usize) -> Self {
        // SAFETY: chunk bases are never null.
        Chunk(unsafe { NonNull::new_unchecked((addr & !(CHUNK_SIZE - 1)) as *mut ChunkHeader) })
    }

    #[inline]
    pub fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// First allocatable address.
    #[inline]
    pub fn begin_addr(self) -> usize {
        self.base() + CHUNK_HEADER_SIZE
    }

    /// One past the last allocatable address.
    #[inline]
    pub fn end_addr(self) -> usize {
        self.base() + CHUNK_SIZE - ALLOC_ALIGN
    }

    #[inline]
    pub fn begin_pos(self) -> Pos {
        Pos::new(self.generation(), CHUNK_HEADER_SIZE)
    }

    #[inline]
    pub fn end_pos(self) -> Pos {
        Pos::new(self.generation(), CHUNK_SIZE - ALLOC_ALIGN)
    }

    #[inline]
    pub fn prev(self) -> Option<Chunk> {
        // SAFETY: live chunks have initialized headers.
        NonNull::new(unsafe { (*self.0.as_ptr()).prev }).map(Chunk)
    }

    #[inline]
    pub fn generation(self) -> usize {
        // SAFETY: see prev.
        unsafe { (*self.0.as_ptr()).generation }
    }

    /// Link `prev` behind this chunk, continuing its generation.
    #[inline]
    pub fn set_prev(self, prev: Chunk) {
        // SAFETY: see prev.
        unsafe {
            let header = &mut *self.0.as_ptr();
            header.prev = prev.0.as_ptr();
            header.generation = prev.generation() + 1;
        }
    }

    #[inline]
    pub fn set_generation(self, generation: usize) {
        // SAFETY: see prev.
        unsafe { (*self.0.as_ptr()).generation = generation }
    }

    #[inline]
    pub fn contains(self, addr: usize) -> bool {
        addr & !(CHUNK_SIZE - 1) == self.base()
    }
}

// =============================================================================
// ChunkAllocator
// =============================================================================

/// Per-arena pool of raw chunks.
///
/// Slabs are only released once every one of their chunks has returned to
/// the free list, which may happen in a different arena after a steal.
pub(crate) struct ChunkAllocator {
    free_list: Vec<NonNull<u8>>,
    allocated_slabs: usize,
    /// Collect garbage once the free list grows past this.
    garbage_limit: usize,
}

// Safety: the allocator exclusively owns its free chunks and moves with
// its arena.
unsafe impl Send for ChunkAllocator {}

impl ChunkAllocator {
    pub fn new() -> Self {
        Self {
            free_list: Vec::with_capacity(2 * CHUNKS_PER_SLAB),
            allocated_slabs: 0,
            garbage_limit: 2 * CHUNKS_PER_SLAB,
        }
    }

    fn new_raw_chunk(&mut self) -> NonNull<u8> {
        if self.free_list.is_empty() {
            let slab = alloc_slab();
            self.allocated_slabs += 1;
            // Hand out chunks in address order.
            for i in (0..CHUNKS_PER_SLAB).rev() {
                // SAFETY: in bounds of the slab.
                self.free_list.push(unsafe { slab.add(i * CHUNK_SIZE) });
            }
        }
        match self.free_list.pop() {
            Some(raw) => raw,
            None => unreachable!("free list refilled above"),
        }
    }

    fn init(&mut self, prev: Option<Chunk>, generation: usize) -> Chunk {
        let raw = self.new_raw_chunk().cast::<ChunkHeader>();
        // SAFETY: raw chunks are CHUNK_SIZE bytes, suitably aligned.
        unsafe {
            raw.as_ptr().write(ChunkHeader {
                prev: prev.map_or(std::ptr::null_mut(), |p| p.0.as_ptr()),
                generation,
            });
        }
        Chunk(raw)
    }

    /// A chunk continuing the chain after `prev`, or a fresh chain.
    pub fn new_chunk(&mut self, prev: Option<Chunk>) -> Chunk {
        let generation = prev.map_or(0, |p| p.generation() + 1);
        self.init(prev, generation)
    }

    /// The first chunk of an arena pinned after `pin` in another arena.
    pub fn new_chunk_pinned(&mut self, pin: Pos) -> Chunk {
        self.init(None, pin.generation() + 1)
    }

    /// Return a chunk to the pool.
    pub fn delete_chunk(&mut self, chunk: Chunk) {
        self.free_list.push(chunk.0.cast());
    }

    /// Number of slabs owned.
    pub fn slab_count(&self) -> usize {
        self.allocated_slabs
    }

    /// Number of pooled chunks.
    pub fn free_chunks(&self) -> usize {
        self.free_list.len()
    }

    /// Release fully free slabs once the free list is over its limit.
    pub fn collect_garbage(&mut self) {
        if self.free_list.len() < self.garbage_limit {
            return;
        }

        let mut free_per_slab: FxHashMap<usize, usize> = FxHashMap::default();
        let mut index = self.free_list.len();
        while index > 0 {
            index -= 1;
            let slab = slab_base(self.free_list[index].as_ptr() as usize);
            let count = free_per_slab.entry(slab).or_insert(0);
            *count += 1;
            if *count == CHUNKS_PER_SLAB {
                // Every chunk of this slab is free; all of them sit at or
                // after `index`.
                self.free_list.retain(|c| slab_base(c.as_ptr() as usize) != slab);
                // SAFETY: non-null slab base that we allocated.
                unsafe { free_slab(NonNull::new_unchecked(slab as *mut u8)) };
                self.allocated_slabs -= 1;
                index = index.min(self.free_list.len());

                if self.free_list.len() <= self.garbage_limit / 2 {
                    break;
                }
            }
        }

        if self.free_list.len() <= self.garbage_limit / 2 {
            self.garbage_limit = (2 * CHUNKS_PER_SLAB).max(self.garbage_limit * 2 / 3);
        } else {
            self.garbage_limit = self.garbage_limit * 3 / 2;
        }
    }

    /// Take over every slab and free chunk of `source`.
    pub fn steal_slabs(&mut self, source: &mut ChunkAllocator) {
        self.allocated_slabs += std::mem::take(&mut source.allocated_slabs);
        self.free_list.append(&mut source.free_list);
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        self.garbage_limit = 0;
        self.collect_garbage();
        debug_assert!(self.free_list.is_empty(), "chunks leaked from pool");
        debug_assert_eq!(self.allocated_slabs, 0, "slabs leaked from pool");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_geometry() {
        let mut pool = ChunkAllocator::new();
        let chunk = pool.new_chunk(None);
        assert_eq!(chunk.base() % CHUNK_SIZE, 0);
        assert_eq!(chunk.generation(), 0);
        assert_eq!(chunk.prev(), None);
        assert_eq!(chunk.end_addr() - chunk.begin_addr(), CHUNK_CAPACITY);
        assert!(chunk.contains(chunk.end_addr()));
        assert_eq!(unsafe { Chunk::containing(chunk.end_addr()) }, chunk);
        pool.delete_chunk(chunk);
    }

    #[test]
    fn test_chain_generations() {
        let mut pool = ChunkAllocator::new();
        let a = pool.new_chunk(None);
        let b = pool.new_chunk(Some(a));
        assert_eq!(b.generation(), 1);
        assert_eq!(b.prev(), Some(a));
        assert!(a.end_pos() < b.begin_pos());

        let pinned = pool.new_chunk_pinned(b.begin_pos());
        assert_eq!(pinned.generation(), 2);
        assert_eq!(pinned.prev(), None);

        for chunk in [pinned, b, a] {
            pool.delete_chunk(chunk);
        }
    }

    #[test]
    fn test_collect_garbage_releases_free_slabs() {
        let mut pool = ChunkAllocator::new();
        let chunks: Vec<_> = (0..3 * CHUNKS_PER_SLAB).map(|_| pool.new_chunk(None)).collect();
        assert_eq!(pool.slab_count(), 3);

        for chunk in chunks {
            pool.delete_chunk(chunk);
        }
        assert_eq!(pool.free_chunks(), 3 * CHUNKS_PER_SLAB);
        pool.collect_garbage();
        assert!(pool.slab_count() < 3);
        assert_eq!(pool.free_chunks(), pool.slab_count() * CHUNKS_PER_SLAB);
    }

    #[test]
    fn test_partially_used_slab_is_kept() {
        let mut pool = ChunkAllocator::new();
        let keep = pool.new_chunk(None);
        let rest: Vec<_> = (1..CHUNKS_PER_SLAB).map(|_| pool.new_chunk(None)).collect();
        for chunk in rest {
            pool.delete_chunk(chunk);
        }
        pool.collect_garbage();
        assert_eq!(pool.slab_count(), 1);
        pool.delete_chunk(keep);
    }

    #[test]
    fn test_steal_slabs() {
        let mut dest = ChunkAllocator::new();
        let mut source = ChunkAllocator::new();
        let chunk = source.new_chunk(None);
        dest.steal_slabs(&mut source);
        assert_eq!(source.slab_count(), 0);
        assert_eq!(source.free_chunks(), 0);
        assert_eq!(dest.slab_count(), 1);
        dest.delete_chunk(chunk);
    }
}
