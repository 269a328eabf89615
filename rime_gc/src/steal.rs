//! Merging a child arena back into its parent.
//!
//! ```text
//!   parent:  ... ── [cursor chunk, gen g] ─┐
//!                                          │ set_prev
//!   child:          [gen n+1] ── ... ── [newest] ◄── new parent cursor
//! ```
//!
//! The child's chunks are relinked after the parent's cursor chunk and
//! renumbered by `g - n`, where `n` is the generation of the note the
//! child was created at. Positions therefore keep increasing along the
//! chain even if the parent allocated after the note.

use crate::heap::{Arena, Note, Pos};
use std::sync::Arc;

impl Arena {
    /// Take over everything `child` owns: chunks, slabs, large objects,
    /// interned references, handles and statistics.
    ///
    /// `child` must have been created by [`Arena::new_child`] on `self` at
    /// `note`. Its objects become young relative to `note`, so a later
    /// collection at `note` treats them like the parent's own.
    pub fn steal(&mut self, note: Note, mut child: Arena) {
        self.stats.merge(&mut child.stats);

        if !child.is_empty() {
            self.steal_memory(note, &mut child);
        }

        for handle in child.live_handles() {
            handle.transfer_to(&self.process);
            self.handles.push(Arc::downgrade(&handle));
        }
        child.handles.clear();

        if self.config.verbosity >= 3 {
            tracing::info!(
                target: "rime_gc::steal",
                chunks = self.stats.cur_chunks,
                large = self.large.len(),
                extrefs = self.extrefs.len(),
                total = self.total_usage(),
                "steal"
            );
        }
        if self.config.verify_invariants {
            self.verify_invariants();
        }
    }

    fn steal_memory(&mut self, note: Note, child: &mut Arena) {
        let tail = self.cursor_chunk();
        let delta = tail.generation() - note.chunk().generation();

        let mut count = 0;
        let mut oldest = child.cursor_chunk();
        let mut chunk = Some(oldest);
        while let Some(c) = chunk {
            chunk = c.prev();
            c.set_generation(c.generation() + delta);
            oldest = c;
            count += 1;
        }
        oldest.set_prev(tail);

        self.stats.alloc_fragment(tail.end_addr() - self.cursor.as_ptr() as usize);
        self.stats.modify_chunks(count as isize);
        child.stats.modify_chunks(-(count as isize));
        self.cursor = child.cursor;
        self.chunks.steal_slabs(&mut child.chunks);

        let rebase = |pos: Pos| Pos::new(pos.generation() + delta, pos.offset());

        let (mut moved, mut bytes) = (0isize, 0isize);
        for large in child.large.drain(..) {
            large.set_pos(rebase(large.pos()));
            moved += 1;
            bytes += large.size() as isize;
            self.large.push(large);
        }
        self.stats.modify_large(moved, bytes);
        child.stats.modify_large(-moved, -bytes);

        let tracked = child.extrefs.len();
        let added = self.extrefs.absorb(&mut child.extrefs, rebase);
        self.stats.modify_extrefs(added as isize);
        child.stats.modify_extrefs(-(tracked as isize));

        child.zombie = true;
    }
}

#[cfg(test)]
mod tests {
    use crate::GcConfig;
    use crate::heap::{Arena, CHUNK_CAPACITY};
    use crate::intern::InternTable;
    use rime_core::{ObjPtr, Type};
    use std::sync::Arc;

    static NODE: Type = Type::class("Node", 16, &[0]);
    static BLOB: Type = Type::array("Blob", 1, &[]);
    static LEAF: Type = Type::class("Leaf", 8, &[]);

    fn config() -> GcConfig {
        GcConfig {
            verify_invariants: true,
            ..Default::default()
        }
    }

    fn parent() -> Arena {
        Arena::with_table(config(), Arc::new(InternTable::new()))
    }

    fn node(arena: &mut Arena, next: Option<ObjPtr>, value: u64) -> ObjPtr {
        let obj = arena.alloc_object(&NODE, 0);
        obj.write_ref(0, next);
        obj.write_u64(8, value);
        obj
    }

    #[test]
    fn test_steal_empty_child() {
        let mut arena = parent();
        let note = arena.note();
        let child = arena.new_child(note);
        let chunks = arena.chunk_count();
        arena.steal(note, child);
        assert_eq!(arena.chunk_count(), chunks);
    }

    #[test]
    fn test_child_objects_survive_steal() {
        let mut arena = parent();
        let note = arena.note();
        let mut child = arena.new_child(note);

        let a = node(&mut child, None, 1);
        let b = node(&mut child, Some(a), 2);
        let blob = child.alloc_object(&BLOB, CHUNK_CAPACITY);
        let leaf = child.alloc_object(&LEAF, 0);
        leaf.write_u64(0, 5);
        let interned = child.intern(leaf);

        arena.steal(note, child);
        assert_eq!(arena.large_object_count(), 1);
        assert_eq!(arena.extref_count(), 1);
        assert!(arena.tracks(interned));
        assert_eq!(b.read_ref(0), Some(a));
        assert_eq!(a.read_u64(8), 1);
        assert_eq!(blob.len(), CHUNK_CAPACITY);
        assert_eq!(interned.refcount(), 1);
    }

    #[test]
    fn test_collect_after_steal() {
        let mut arena = parent();
        let note = arena.note();
        let mut child = arena.new_child(note);

        let keep = node(&mut child, None, 42);
        for i in 0..100 {
            node(&mut child, None, i);
        }
        let garbage = child.alloc_object(&BLOB, CHUNK_CAPACITY);
        assert_eq!(garbage.len(), CHUNK_CAPACITY);

        arena.steal(note, child);
        let mut roots = [keep];
        arena.collect(note, &mut roots);
        assert_eq!(roots[0].read_u64(8), 42);
        assert_eq!(arena.large_object_count(), 0);
    }

    #[test]
    fn test_parent_grew_since_note() {
        let mut arena = parent();
        let note = arena.note();
        let mut child = arena.new_child(note);

        // Push the parent a few chunks past the note.
        let mut parent_objs = Vec::new();
        for i in 0..3000 {
            parent_objs.push(node(&mut arena, None, i));
        }
        let mut last = None;
        for i in 0..3000 {
            last = Some(node(&mut child, last, i));
        }
        let child_chunks = child.chunk_count();
        let parent_chunks = arena.chunk_count();
        assert!(parent_chunks > 1 && child_chunks > 1);

        arena.steal(note, child);
        assert_eq!(arena.chunk_count(), parent_chunks + child_chunks);

        let mut roots = [parent_objs[0], last.unwrap_or_else(|| panic!("no child objects"))];
        arena.collect(note, &mut roots);
        assert_eq!(roots[0].read_u64(8), 0);
        let mut len = 0;
        let mut cur = Some(roots[1]);
        while let Some(obj) = cur {
            len += 1;
            cur = obj.read_ref(0);
        }
        assert_eq!(len, 3000);
    }

    #[test]
    fn test_duplicate_extref_returns_reference() {
        let mut arena = parent();
        let leaf = arena.alloc_object(&LEAF, 0);
        leaf.write_u64(0, 9);
        let interned = arena.intern(leaf);

        let note = arena.note();
        let mut child = arena.new_child(note);
        let copy = child.alloc_object(&LEAF, 0);
        copy.write_u64(0, 9);
        assert_eq!(child.intern(copy), interned);
        assert_eq!(interned.refcount(), 2);

        arena.steal(note, child);
        assert_eq!(arena.extref_count(), 1);
        assert_eq!(interned.refcount(), 1);
    }

    #[test]
    fn test_handles_move_to_parent() {
        let mut arena = parent();
        let note = arena.note();
        let mut child = arena.new_child(note);
        let obj = node(&mut child, None, 3);
        let handle = child.make_handle(obj);
        assert!(!handle.is_owned_by(arena.process()));

        arena.steal(note, child);
        assert!(handle.is_owned_by(arena.process()));
        assert!(arena.any_handles());

        arena.collect_sweep(note);
        let moved = handle.get().unwrap_or_else(|| panic!("handle cleared"));
        assert_eq!(moved.read_u64(8), 3);
    }
}
