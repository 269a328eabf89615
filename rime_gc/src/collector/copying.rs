//! Scope-relative copying collection.
//!
//! A collection at note `N` reclaims everything positioned at or after `N`
//! that the roots and handles do not reach. The cursor is reset to `N` up
//! front and survivors are copied back to it:
//!
//! ```text
//!   before:  │ old │ a │ x │ b │ y ││ c │ z │          (x, y, z unreachable)
//!                  ▲ N                        ▲ cursor
//!
//!   after:   │ old │ a'│ b'│ c'│
//!                  ▲ N         ▲ cursor
//! ```
//!
//! The chunk holding `N` is read from and written to at once, so copies
//! landing in it go to a shadow buffer first and are copied back when the
//! walk finishes. Every copied object leaves a forwarding address behind.
//!
//! Large objects and extrefs are never copied. Reaching one "marks" it by
//! moving its position to `N - 1`; the sweep then releases what is still
//! positioned at or after `N` and moves the marked ones to `N`. Old objects
//! are scanned but neither moved nor rewritten beyond their references.

use super::CollectMode;
use crate::heap::chunk::Chunk;
use crate::heap::large_object::LargeObject;
use crate::heap::{Arena, CHUNK_SIZE, Note, Pos};
use crate::intern::refcount::{incref, refcount_delegate};
use rime_core::{IObjPtr, MemoryKind, OBJECT_HEADER_SIZE, ObjPtr, REF_SIZE};
use rustc_hash::FxHashSet;

pub(crate) struct Collector<'a> {
    arena: &'a mut Arena,
    note: Note,
    collect_pos: Pos,
    collect_chunk: Chunk,
    /// Cursor before the collection; the evicted chunks hang off it.
    old_cursor: usize,
    pre_usage: usize,
    mode: CollectMode,

    mark_count: usize,
    /// Reference slots scanned, roots included.
    scan_count: usize,
    shadow_vol: usize,
    copy_vol: usize,
    large_young_count: usize,

    work: Vec<ObjPtr>,
    /// Image of the collect chunk; absent on the quick path.
    shadow: Option<Box<[u64]>>,
    /// Old objects and old large objects already queued.
    marked: FxHashSet<ObjPtr>,
}

impl<'a> Collector<'a> {
    pub fn new(arena: &'a mut Arena, note: Note, mode: CollectMode) -> Self {
        let old_cursor = arena.cursor.as_ptr() as usize;
        let pre_usage = arena.usage(note);
        Self {
            arena,
            note,
            collect_pos: note.pos(),
            collect_chunk: note.chunk(),
            old_cursor,
            pre_usage,
            mode,
            mark_count: 0,
            scan_count: 0,
            shadow_vol: 0,
            copy_vol: 0,
            large_young_count: 0,
            work: Vec::new(),
            shadow: None,
            marked: FxHashSet::default(),
        }
    }

    /// Marked large objects and extrefs sit here during the walk.
    #[inline]
    fn mark_pos(&self) -> Pos {
        self.collect_pos.prev()
    }

    /// Keep what `roots` and the arena's handles reach, rewriting the root
    /// slots, and sweep the rest.
    ///
    /// Returns the usage threshold for the next automatic collection.
    pub fn collect(mut self, roots: &mut [ObjPtr]) -> usize {
        self.arena.cursor = self.note.as_ptr();

        let quick = roots.len() == 1 && self.quick_collect_one(&mut roots[0]);
        if !quick {
            self.shadow = Some(vec![0; CHUNK_SIZE / 8].into_boxed_slice());
            for root in roots.iter_mut() {
                self.scan_count += 1;
                *root = self.visit(*root);
            }
            for handle in self.arena.live_handles() {
                self.scan_count += 1;
                if let Some(target) = handle.get() {
                    handle.set(Some(self.visit(target)));
                }
            }
            self.copy_shadow_to_collect_chunk();
        }

        let large_survivors = self.arena.sweep(self.note, self.old_cursor);
        debug_assert_eq!(large_survivors, self.large_young_count);

        let threshold = (self.scan_count * REF_SIZE + self.copy_vol + self.shadow_vol) as f64
            * self.arena.config.gc_ratio;
        self.finish();
        threshold as usize
    }

    fn finish(&mut self) {
        let post_usage = self.arena.usage(self.note);
        let freed = self.pre_usage.saturating_sub(post_usage);
        let scan_vol = self.scan_count * REF_SIZE;

        let stats = &mut self.arena.stats;
        stats.alloc_gc(self.copy_vol);
        stats.alloc_shadow(self.shadow_vol);
        stats.gc_reclaim(freed);
        stats.gc_visit(self.mark_count);
        stats.gc_scan(scan_vol);

        let config = &self.arena.config;
        if config.verbosity == 0 {
            return;
        }
        let min = self.arena.min_usage;
        let total = self.arena.total_usage();
        let work = scan_vol + self.copy_vol + self.shadow_vol;
        if work as f64 > freed.max(CHUNK_SIZE) as f64 * config.squawk_ratio {
            tracing::info!(
                target: "rime_gc::collect",
                mode = self.mode.collect_name(),
                eligible = self.pre_usage,
                min,
                scan = scan_vol,
                copy = self.copy_vol,
                freed,
                survived = post_usage,
                total,
                "low-yield collection"
            );
        } else if config.verbosity >= 2 {
            tracing::info!(
                target: "rime_gc::collect",
                mode = self.mode.collect_name(),
                eligible = self.pre_usage,
                above_min = self.pre_usage >= min,
                min,
                survived = post_usage,
                work,
                total,
                "collection"
            );
        }
    }

    // =========================================================================
    // Marking and copying
    // =========================================================================

    #[inline]
    fn is_old_small(&self, obj: ObjPtr) -> bool {
        // SAFETY: arena objects live in chunks that stay linked until the
        // sweep.
        unsafe { Pos::of_object(obj) < self.mark_pos() }
    }

    /// Copy `obj` and drain everything it makes reachable.
    fn visit(&mut self, obj: ObjPtr) -> ObjPtr {
        let moved = self.copy_object(obj);
        while let Some(target) = self.work.pop() {
            let ty = target.ty();
            ty.for_each_ref_offset(target.len(), |off| {
                self.scan_count += 1;
                if let Some(child) = target.read_ref(off) {
                    let moved = self.copy_object(child);
                    if moved != child {
                        target.write_ref(off, Some(moved));
                    }
                }
            });
        }
        moved
    }

    /// Mark `obj`, copying it if it is young. Returns its new address.
    fn copy_object(&mut self, obj: ObjPtr) -> ObjPtr {
        match obj.kind() {
            MemoryKind::Interned => {
                // SAFETY: the kind says it carries an intern header.
                self.update_iobj(unsafe { IObjPtr::from_obj(obj) });
                obj
            }
            MemoryKind::Large => {
                self.update_large(obj);
                obj
            }
            MemoryKind::Unknown => obj,
            MemoryKind::Arena => {
                if self.is_old_small(obj) {
                    if obj.ty().has_refs() && !obj.is_frozen() && self.marked.insert(obj) {
                        self.mark_count += 1;
                        self.work.push(obj);
                    }
                    return obj;
                }
                if let Some(target) = obj.forwarded() {
                    return target;
                }

                self.mark_count += 1;
                let ty = obj.ty();
                let size = obj.total_size();
                let (read, write) = self.alloc_during_gc(size);
                // SAFETY: `write` has room for `size` bytes and never overlaps
                // the original, which lies after the note or in another chunk.
                unsafe {
                    std::ptr::copy_nonoverlapping(obj.start(), write.as_ptr().sub(OBJECT_HEADER_SIZE), size);
                }
                obj.set_forwarded(read);
                if ty.has_refs() {
                    self.work.push(write);
                }
                read
            }
        }
    }

    /// Allocate room for a copy of `size` bytes at the cursor.
    fn alloc_copy(&mut self, size: usize) -> ObjPtr {
        let mem = self.arena.alloc_small(size).as_ptr();
        self.copy_vol += size;
        // SAFETY: the object header fits in the allocation.
        unsafe { ObjPtr::from_raw(mem.add(OBJECT_HEADER_SIZE)) }
    }

    /// Allocate room for a copy of `size` bytes.
    ///
    /// Returns the address the copy will have once the collection ends and
    /// the address to write it to now; they differ inside the collect chunk.
    fn alloc_during_gc(&mut self, size: usize) -> (ObjPtr, ObjPtr) {
        let read = self.alloc_copy(size);
        if !self.collect_chunk.contains(read.addr() - OBJECT_HEADER_SIZE) {
            return (read, read);
        }
        let Some(shadow) = self.shadow.as_deref_mut() else {
            unreachable!("copy into the collect chunk without a shadow buffer");
        };
        let offset = read.addr() & (CHUNK_SIZE - 1);
        // SAFETY: the shadow spans a whole chunk.
        let write = unsafe { ObjPtr::from_raw((shadow.as_mut_ptr() as *mut u8).add(offset)) };
        (read, write)
    }

    fn update_iobj(&mut self, iobj: IObjPtr) {
        let delegate = refcount_delegate(iobj);
        let mark = self.mark_pos();
        if self.arena.extrefs.insert(delegate, mark) {
            // Reachable but not yet tracked: start tracking it.
            incref(delegate);
            self.arena.stats.modify_extrefs(1);
            self.mark_count += 1;
        } else if let Some(entry) = self.arena.extrefs.get_mut(delegate) {
            if entry.pos > mark {
                entry.pos = mark;
                self.mark_count += 1;
            }
        }
    }

    fn update_large(&mut self, obj: ObjPtr) {
        // SAFETY: the kind says it lives in a large allocation.
        let large = unsafe { LargeObject::of_object(obj) };
        let mark = self.mark_pos();
        if large.pos() < mark {
            if self.marked.insert(obj) {
                self.work.push(obj);
                self.mark_count += 1;
            }
        } else if large.pos() != mark {
            large.set_pos(mark);
            self.work.push(obj);
            self.mark_count += 1;
            self.large_young_count += 1;
        }
    }

    /// Handle a lone root without the worklist or shadow buffer.
    ///
    /// Only objects that cannot lead anywhere qualify. Returns false, having
    /// done nothing, if the general path is needed.
    fn quick_collect_one(&mut self, root: &mut ObjPtr) -> bool {
        if self.arena.any_handles() {
            return false;
        }
        let done = self.quick_visit(root);
        if done {
            self.scan_count += 1;
        }
        done
    }

    fn quick_visit(&mut self, root: &mut ObjPtr) -> bool {
        let obj = *root;
        match obj.kind() {
            MemoryKind::Arena => {
                let ty = obj.ty();
                if self.is_old_small(obj) {
                    let done = !ty.has_refs() || obj.is_frozen();
                    if done {
                        self.mark_count += 1;
                    }
                    return done;
                }
                if ty.has_refs() {
                    return false;
                }
                let size = obj.total_size();
                let read = self.alloc_copy(size);
                if read != obj {
                    // SAFETY: both regions hold `size` bytes; they may overlap.
                    unsafe {
                        std::ptr::copy(obj.start(), read.as_ptr().sub(OBJECT_HEADER_SIZE), size);
                    }
                    *root = read;
                }
                self.mark_count += 1;
                true
            }
            MemoryKind::Large => {
                let ty = obj.ty();
                // SAFETY: the kind says it lives in a large allocation.
                let large = unsafe { LargeObject::of_object(obj) };
                if large.pos() < self.mark_pos() {
                    let done = !ty.has_refs() || obj.is_frozen();
                    if done {
                        self.mark_count += 1;
                    }
                    return done;
                }
                if ty.has_refs() {
                    return false;
                }
                large.set_pos(self.mark_pos());
                self.mark_count += 1;
                self.large_young_count += 1;
                true
            }
            MemoryKind::Interned => {
                // SAFETY: see copy_object.
                self.update_iobj(unsafe { IObjPtr::from_obj(obj) });
                true
            }
            MemoryKind::Unknown => true,
        }
    }

    fn copy_shadow_to_collect_chunk(&mut self) {
        let Some(shadow) = self.shadow.as_deref() else {
            return;
        };
        let end = self.arena.cursor_pos().min(self.collect_chunk.end_pos());
        self.shadow_vol = end.distance_from(self.collect_pos);
        let offset = self.collect_pos.offset();
        // SAFETY: [offset, offset + shadow_vol) lies within both the shadow
        // and the collect chunk.
        unsafe {
            std::ptr::copy_nonoverlapping(
                (shadow.as_ptr() as *const u8).add(offset),
                self.note.as_ptr().as_ptr(),
                self.shadow_vol,
            );
        }
    }
}
