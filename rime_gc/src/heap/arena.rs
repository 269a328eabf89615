//! The scoped arena.
//!
//! An [`Arena`] serves one computation. Allocation bumps a cursor through a
//! chain of chunks; reclamation is by checkpoint: take a [`Note`], allocate,
//! then collect at the note to keep only what the roots still reach.
//!
//! ```text
//!   first_note                 note                     cursor
//!   ▼                          ▼                        ▼
//!   ├── old (never touched) ───┼── young (collectable) ─┤
//!
//!   large objects and extrefs hang off positions in the same stream
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut arena = Arena::new();
//! let note = arena.note();
//! let keep = arena.alloc_object(&PAIR, 0);
//! let _garbage = arena.alloc_object(&PAIR, 0);
//! let mut roots = [keep];
//! arena.collect(note, &mut roots);
//! // roots[0] now points at the relocated survivor
//! ```

use super::chunk::{CHUNKS_PER_SLAB, Chunk, ChunkAllocator};
use super::extref::ExtRefs;
use super::large_object::LargeObject;
use super::page::memory_kind_of;
use super::{LARGE_ALLOC_SIZE, Note, Pos};
use crate::config::GcConfig;
use crate::deferred::{LockCoordinator, WorkCoordinator, safe_decref};
use crate::intern::InternTable;
use crate::intern::refcount::{decref_to_nonzero, incref, refcount_delegate};
use crate::roots::{Handle, Process};
use crate::stats::AllocStats;
use rime_core::{ALLOC_ALIGN, IObjPtr, MemoryKind, OBJECT_HEADER_SIZE, ObjPtr, Type, align_up};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

/// A single-owner bump allocator with checkpoint-relative collection.
pub struct Arena {
    pub(crate) cursor: NonNull<u8>,
    pub(crate) first_note: Note,
    pub(crate) last_note: Note,
    pub(crate) chunks: ChunkAllocator,
    /// Oldest first.
    pub(crate) large: Vec<LargeObject>,
    pub(crate) extrefs: ExtRefs,
    pub(crate) handles: Vec<Weak<Handle>>,
    pub(crate) process: Arc<Process>,
    pub(crate) stats: AllocStats,
    pub(crate) config: GcConfig,
    pub(crate) table: Arc<InternTable>,
    pub(crate) coordinator: Arc<dyn WorkCoordinator>,
    /// Usage below which automatic collections are skipped.
    pub(crate) min_usage: usize,
    /// Set once another arena has stolen our chunks.
    pub(crate) zombie: bool,
}

// Safety: an arena is owned by one thread at a time; everything it points
// to is either exclusively owned or reached through thread-safe types.
unsafe impl Send for Arena {}

impl Arena {
    /// Create a root arena using the process-wide configuration and
    /// intern table.
    pub fn new() -> Self {
        Self::with_table(GcConfig::global().clone(), InternTable::global())
    }

    /// Create a root arena with `config` and the process-wide intern table.
    pub fn with_config(config: GcConfig) -> Self {
        Self::with_table(config, InternTable::global())
    }

    /// Create a root arena interning into `table`.
    pub fn with_table(config: GcConfig, table: Arc<InternTable>) -> Self {
        let mut chunks = ChunkAllocator::new();
        let chunk = chunks.new_chunk(None);
        Self::from_chunk(chunks, chunk, config, table, Arc::new(LockCoordinator::new()))
    }

    /// Create a child arena whose positions all follow `note` in `self`.
    ///
    /// The child can later be stolen back into `self` at `note` without
    /// renumbering its contents.
    pub fn new_child(&self, note: Note) -> Self {
        let mut chunks = ChunkAllocator::new();
        let chunk = chunks.new_chunk_pinned(note.pos());
        Self::from_chunk(
            chunks,
            chunk,
            self.config.clone(),
            Arc::clone(&self.table),
            Arc::clone(&self.coordinator),
        )
    }

    fn from_chunk(
        chunks: ChunkAllocator,
        chunk: Chunk,
        config: GcConfig,
        table: Arc<InternTable>,
        coordinator: Arc<dyn WorkCoordinator>,
    ) -> Self {
        // SAFETY: chunk begin addresses are never null.
        let cursor = unsafe { NonNull::new_unchecked(chunk.begin_addr() as *mut u8) };
        let note = Note::from_cursor(cursor);
        let mut arena = Self {
            cursor,
            first_note: note,
            last_note: note,
            chunks,
            large: Vec::new(),
            extrefs: ExtRefs::new(),
            handles: Vec::new(),
            process: Process::new(),
            stats: AllocStats::new(),
            config,
            table,
            coordinator,
            min_usage: 0,
            zombie: false,
        };
        arena.stats.modify_chunks(1);
        // Keeps every note strictly after the chunk's first byte.
        arena.alloc_small(ALLOC_ALIGN);
        arena.first_note = Note::from_cursor(arena.cursor);
        arena.last_note = arena.first_note;
        arena
    }

    /// Route deferred decrefs through `coordinator` instead of the
    /// arena's private [`LockCoordinator`].
    pub fn set_coordinator(&mut self, coordinator: Arc<dyn WorkCoordinator>) {
        self.coordinator = coordinator;
    }

    /// The coordinator deciding when released interned objects are torn
    /// down.
    pub fn coordinator(&self) -> &Arc<dyn WorkCoordinator> {
        &self.coordinator
    }

    /// The intern table this arena interns into.
    pub fn table(&self) -> &Arc<InternTable> {
        &self.table
    }

    /// The owning process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// Active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    // =========================================================================
    // Positions
    // =========================================================================

    /// Checkpoint the cursor.
    ///
    /// Two notes taken without an allocation in between would coincide, so
    /// a placeholder is allocated first in that case.
    pub fn note(&mut self) -> Note {
        if self.cursor == self.last_note.as_ptr() {
            self.alloc_placeholder();
        }
        self.last_note = Note::from_cursor(self.cursor);
        self.last_note
    }

    /// Position of `note`.
    #[inline]
    pub fn pos(&self, note: Note) -> Pos {
        note.pos()
    }

    /// The note taken when the arena was created.
    #[inline]
    pub fn first_note(&self) -> Note {
        self.first_note
    }

    #[inline]
    pub(crate) fn cursor_pos(&self) -> Pos {
        // SAFETY: the cursor always lies in the newest live chunk.
        unsafe { Pos::of_addr(self.cursor.as_ptr() as usize) }
    }

    #[inline]
    pub(crate) fn cursor_chunk(&self) -> Chunk {
        // SAFETY: see cursor_pos.
        unsafe { Chunk::containing(self.cursor.as_ptr() as usize) }
    }

    /// True if nothing has been allocated since the arena was created.
    pub fn is_empty(&self) -> bool {
        self.cursor == self.first_note.as_ptr()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Bump-allocate `size` bytes, which must be aligned and below
    /// [`LARGE_ALLOC_SIZE`].
    #[inline]
    pub(crate) fn alloc_small(&mut self, size: usize) -> NonNull<u8> {
        debug_assert_eq!(size, align_up(size));
        debug_assert!(size < LARGE_ALLOC_SIZE);
        let mem = self.cursor.as_ptr() as usize;
        let next = mem + size;
        if (next ^ mem) < super::CHUNK_SIZE {
            // SAFETY: next stays inside the current chunk.
            self.cursor = unsafe { NonNull::new_unchecked(next as *mut u8) };
            self.stats.alloc_small(size);
            return self.cursor_minus(size);
        }
        self.alloc_overflow(size)
    }

    #[inline]
    fn cursor_minus(&self, size: usize) -> NonNull<u8> {
        // SAFETY: the cursor just advanced by `size` within one chunk.
        unsafe { NonNull::new_unchecked(self.cursor.as_ptr().sub(size)) }
    }

    #[cold]
    fn alloc_overflow(&mut self, size: usize) -> NonNull<u8> {
        let prev = self.cursor_chunk();
        self.stats.alloc_fragment(prev.end_addr() - self.cursor.as_ptr() as usize);
        let chunk = self.chunks.new_chunk(Some(prev));
        self.stats.modify_chunks(1);
        let mem = chunk.begin_addr() + size;
        // SAFETY: chunk addresses are never null.
        self.cursor = unsafe { NonNull::new_unchecked(mem as *mut u8) };
        self.stats.alloc_small(size);
        self.cursor_minus(size)
    }

    pub(crate) fn alloc_placeholder(&mut self) -> Pos {
        self.stats.alloc_placeholder(ALLOC_ALIGN);
        let mem = self.alloc_small(ALLOC_ALIGN);
        // SAFETY: just allocated in a live chunk.
        unsafe { Pos::of_addr(mem.as_ptr() as usize) }
    }

    /// Make sure the cursor lies strictly after `pos`.
    pub(crate) fn placeholder_after(&mut self, pos: Pos) {
        if self.cursor_pos() == pos {
            self.alloc_placeholder();
        }
        debug_assert!(pos < self.cursor_pos());
    }

    /// Allocate `size` bytes of uninitialized memory.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        let size = align_up(size);
        if size < LARGE_ALLOC_SIZE {
            self.alloc_small(size)
        } else {
            self.alloc_large(size).payload()
        }
    }

    /// Allocate `size` zeroed bytes.
    pub fn calloc(&mut self, size: usize) -> NonNull<u8> {
        let mem = self.alloc(size);
        // SAFETY: freshly allocated, at least `size` bytes.
        unsafe { std::ptr::write_bytes(mem.as_ptr(), 0, size) };
        mem
    }

    /// Allocate `size` bytes that the collector will never move.
    pub fn alloc_pinned(&mut self, size: usize) -> NonNull<u8> {
        self.alloc_large(align_up(size)).payload()
    }

    pub(crate) fn alloc_large(&mut self, size: usize) -> LargeObject {
        let pos = self.alloc_placeholder();
        let large = LargeObject::alloc(size, pos);
        self.stats.modify_large(1, size as isize);
        self.stats.alloc_large(size);
        self.large.push(large);
        large
    }

    /// Allocate a zeroed object of type `ty` with `len` elements.
    pub fn alloc_object(&mut self, ty: &'static Type, len: usize) -> ObjPtr {
        let total = OBJECT_HEADER_SIZE + ty.user_byte_size(len);
        if total < LARGE_ALLOC_SIZE {
            let start = self.alloc_small(total);
            // SAFETY: `total` bytes were just allocated.
            unsafe { init_object(start.as_ptr(), total, ty, len, MemoryKind::Arena) }
        } else {
            self.alloc_object_pinned(ty, len)
        }
    }

    /// Allocate a zeroed object that the collector will never move.
    pub fn alloc_object_pinned(&mut self, ty: &'static Type, len: usize) -> ObjPtr {
        let total = OBJECT_HEADER_SIZE + ty.user_byte_size(len);
        let large = self.alloc_large(total);
        // SAFETY: the payload holds `total` bytes.
        unsafe { init_object(large.payload().as_ptr(), total, ty, len, MemoryKind::Large) }
    }

    /// Copy `obj`'s user data into a new, unfrozen object in this arena.
    pub fn shallow_clone(&mut self, obj: ObjPtr) -> ObjPtr {
        let copy = self.alloc_object(obj.ty(), obj.len());
        // SAFETY: same type and length, so the sizes match; the regions
        // are distinct allocations.
        unsafe { std::ptr::copy_nonoverlapping(obj.as_ptr(), copy.as_ptr(), obj.user_size()) };
        copy
    }

    // =========================================================================
    // Interned storage
    // =========================================================================

    /// Intern `obj` and track the result.
    ///
    /// The table hands out one reference; if the arena already tracks the
    /// same delegate that reference is returned to the table right away.
    pub fn intern(&mut self, obj: ObjPtr) -> IObjPtr {
        let iobj = self.table.intern(obj);
        let delegate = refcount_delegate(iobj);
        if self.extrefs.contains(delegate) {
            let released = decref_to_nonzero(delegate.refcount_cell());
            debug_assert!(released, "tracked object held only by the intern call");
        } else {
            let pos = self.alloc_placeholder();
            self.extrefs.insert(delegate, pos);
            self.stats.modify_extrefs(1);
        }
        iobj
    }

    /// Track an interned object obtained elsewhere, taking a reference if
    /// it is new to this arena.
    pub fn register_interned(&mut self, iobj: IObjPtr) -> IObjPtr {
        let delegate = refcount_delegate(iobj);
        if !self.extrefs.contains(delegate) {
            incref(delegate);
            let pos = self.alloc_placeholder();
            self.extrefs.insert(delegate, pos);
            self.stats.modify_extrefs(1);
        }
        iobj
    }

    /// Replace `obj` with an immutable deep copy.
    ///
    /// Frozen objects, interned ones included, are returned unchanged.
    pub fn freeze(&mut self, obj: ObjPtr) -> ObjPtr {
        let frozen = crate::freeze::freeze(self, obj);
        if self.config.verify_invariants {
            self.verify_invariants();
        }
        frozen
    }

    // =========================================================================
    // Handles
    // =========================================================================

    /// Register `obj` as a root until the returned handle is dropped.
    pub fn make_handle(&mut self, obj: ObjPtr) -> Arc<Handle> {
        let handle = Arc::new(Handle::new(Some(obj), Arc::clone(&self.process)));
        self.handles.push(Arc::downgrade(&handle));
        handle
    }

    /// Live handles, pruning the dead ones.
    pub(crate) fn live_handles(&mut self) -> Vec<Arc<Handle>> {
        let mut live = Vec::with_capacity(self.handles.len());
        self.handles.retain(|weak| match weak.upgrade() {
            Some(handle) => {
                live.push(handle);
                true
            }
            None => false,
        });
        live
    }

    /// True if any handle is still registered.
    pub fn any_handles(&mut self) -> bool {
        self.handles.retain(|weak| weak.strong_count() > 0);
        !self.handles.is_empty()
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Bytes allocated since `note`, including large objects attached at or
    /// after it.
    pub fn usage(&self, note: Note) -> usize {
        let note = note.pos();
        let mut sum = self.cursor_pos().distance_from(note);
        for large in self.large.iter().rev() {
            if large.pos() < note {
                break;
            }
            sum += large.size();
        }
        sum
    }

    /// Bytes allocated since the arena was created.
    pub fn total_usage(&self) -> usize {
        self.usage(self.first_note)
    }

    /// Chunks currently linked into the arena.
    pub fn chunk_count(&self) -> usize {
        self.stats.cur_chunks
    }

    /// Large and pinned objects currently owned.
    pub fn large_object_count(&self) -> usize {
        self.large.len()
    }

    /// Interned objects currently referenced.
    pub fn extref_count(&self) -> usize {
        self.extrefs.len()
    }

    /// True if the arena holds a reference to `iobj`'s refcount delegate.
    pub fn tracks(&self, iobj: IObjPtr) -> bool {
        self.extrefs.contains(refcount_delegate(iobj))
    }

    /// Allocation and collection statistics.
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Log current usage.
    pub fn report(&self) {
        self.stats.report(self.total_usage());
    }

    /// Check the chunk chain, large objects and extrefs against the
    /// statistics. Panics on the first violation.
    pub fn verify_invariants(&self) {
        let cursor = self.cursor_pos();
        let newest = self.cursor_chunk();
        assert!(
            newest.begin_pos() <= cursor && cursor <= newest.end_pos(),
            "cursor outside its chunk"
        );

        let mut count = 0;
        let mut newer: Option<Chunk> = None;
        let mut chunk = Some(newest);
        while let Some(c) = chunk {
            if let Some(n) = newer {
                assert_eq!(c.generation() + 1, n.generation(), "chunk generations out of order");
            }
            assert_eq!(memory_kind_of(c.base()), MemoryKind::Arena, "chunk outside a registered slab");
            count += 1;
            newer = Some(c);
            chunk = c.prev();
        }
        assert_eq!(count, self.stats.cur_chunks, "chunk count mismatch");
        assert!(
            count + self.chunks.free_chunks() <= self.chunks.slab_count() * CHUNKS_PER_SLAB,
            "more chunks than the pool's slabs hold"
        );

        let mut bytes = 0;
        let mut last = None;
        for large in &self.large {
            assert!(large.pos() < cursor, "large object positioned after cursor");
            if let Some(last) = last {
                assert!(last <= large.pos(), "large objects out of order");
            }
            last = Some(large.pos());
            bytes += large.size();
        }
        assert_eq!(self.large.len(), self.stats.cur_large_count, "large object count mismatch");
        assert_eq!(bytes, self.stats.cur_large_bytes, "large object bytes mismatch");

        self.extrefs.for_each(|_, entry| {
            assert!(entry.pos < cursor, "extref positioned after cursor");
        });
        assert_eq!(self.extrefs.chain_len(), self.extrefs.len(), "extref chain broken");
        assert_eq!(self.extrefs.len(), self.stats.cur_extrefs, "extref count mismatch");
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("cursor", &self.cursor)
            .field("chunks", &self.stats.cur_chunks)
            .field("large", &self.large.len())
            .field("extrefs", &self.extrefs.len())
            .field("handles", &self.handles.len())
            .field("zombie", &self.zombie)
            .finish()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.zombie {
            let mut oldest = self.cursor_chunk();
            let mut chunk = Some(oldest);
            while let Some(c) = chunk {
                chunk = c.prev();
                oldest = c;
                if chunk.is_some() {
                    self.chunks.delete_chunk(c);
                }
            }
            if self.config.memstats && oldest.generation() == 0 {
                self.stats.report_final();
            }
            self.chunks.delete_chunk(oldest);
        }

        for delegate in self.extrefs.drain() {
            safe_decref(&*self.coordinator, &self.table, delegate);
        }

        for large in self.large.drain(..) {
            self.stats.modify_large(-1, -(large.size() as isize));
            // SAFETY: the arena is going away with everything in it.
            unsafe { large.free() };
        }
    }
}

/// Zero `total` bytes at `start` and write an object header there.
///
/// # Safety
///
/// `start` must be aligned and valid for `total` bytes of writes.
unsafe fn init_object(start: *mut u8, total: usize, ty: &'static Type, len: usize, kind: MemoryKind) -> ObjPtr {
    let len = u32::try_from(len).unwrap_or_else(|_| panic!("array length {len} out of range"));
    unsafe {
        std::ptr::write_bytes(start, 0, total);
        ObjPtr::init_at(start, ty, len, kind)
    }
}
