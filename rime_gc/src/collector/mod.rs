//! Collection entry points.
//!
//! Three trigger modes share one collector:
//!
//! | mode      | runs                                                  |
//! |-----------|-------------------------------------------------------|
//! | `Manual`  | always, unless `manual_collect` is off (then as Auto) |
//! | `Runtime` | always                                                |
//! | `Auto`    | once usage since the note reaches the last threshold  |
//!
//! A collection without roots or handles skips the walk entirely and only
//! resets the cursor and sweeps.

mod copying;

use crate::deferred::safe_decref;
use crate::heap::chunk::Chunk;
use crate::heap::{Arena, Note, Pos};
use copying::Collector;
use rime_core::ObjPtr;

/// What asked for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectMode {
    /// Inserted by the compiler; always runs.
    Runtime,
    /// Requested explicitly by user code.
    Manual,
    /// Runs only when usage justifies the work.
    Auto,
}

impl CollectMode {
    /// Slot in the per-mode statistics arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            CollectMode::Runtime => 0,
            CollectMode::Manual => 1,
            CollectMode::Auto => 2,
        }
    }

    /// Log name for collections with roots.
    pub fn collect_name(self) -> &'static str {
        match self {
            CollectMode::Runtime => "runtime-collect",
            CollectMode::Manual => "manual-collect",
            CollectMode::Auto => "auto-collect",
        }
    }

    /// Log name for sweeps.
    pub fn sweep_name(self) -> &'static str {
        match self {
            CollectMode::Runtime => "runtime-sweep",
            CollectMode::Manual => "manual-sweep",
            CollectMode::Auto => "auto-sweep",
        }
    }
}

impl Arena {
    /// Reclaim everything allocated since `note` that `roots` and the
    /// arena's handles do not reach. Root slots are rewritten in place.
    pub fn collect(&mut self, note: Note, roots: &mut [ObjPtr]) {
        self.collect_manual(note, roots);
    }

    /// Reclaim everything allocated since `note`, keeping only what the
    /// arena's handles reach.
    pub fn collect_sweep(&mut self, note: Note) {
        self.sweep_only(note, CollectMode::Manual);
    }

    /// Reclaim everything except what the arena's handles reach.
    pub fn collect_all(&mut self) {
        let note = self.first_note;
        self.sweep_only(note, CollectMode::Manual);
    }

    /// A user-requested collection.
    pub fn collect_manual(&mut self, note: Note, roots: &mut [ObjPtr]) {
        if !self.config.manual_collect {
            self.collect_auto(note, roots);
        } else if roots.is_empty() {
            self.sweep_only(note, CollectMode::Manual);
        } else {
            self.collect_general(note, roots, CollectMode::Manual);
        }
    }

    /// A collection that only runs once usage since `note` reaches the
    /// threshold left by the previous one. Sweeps always run.
    pub fn collect_auto(&mut self, note: Note, roots: &mut [ObjPtr]) {
        if roots.is_empty() {
            self.sweep_only(note, CollectMode::Auto);
        } else if self.usage(note) >= self.min_usage {
            self.min_usage = self.collect_general(note, roots, CollectMode::Auto);
        }
    }

    /// A compiler-inserted collection; always runs.
    pub fn collect_runtime(&mut self, note: Note, roots: &mut [ObjPtr]) {
        if roots.is_empty() {
            self.sweep_only(note, CollectMode::Runtime);
        } else {
            self.collect_general(note, roots, CollectMode::Runtime);
        }
    }

    /// Usage below which automatic collections are skipped.
    pub fn auto_threshold(&self) -> usize {
        self.min_usage
    }

    fn collect_general(&mut self, note: Note, roots: &mut [ObjPtr], mode: CollectMode) -> usize {
        debug_assert!(note.pos() >= self.first_note.pos(), "note older than the arena");
        self.stats.count_collect(mode);
        Collector::new(self, note, mode).collect(roots)
    }

    fn sweep_only(&mut self, note: Note, mode: CollectMode) {
        if self.any_handles() {
            // Handles are roots; they need the walk.
            self.collect_general(note, &mut [], mode);
            return;
        }
        debug_assert!(note.pos() >= self.first_note.pos(), "note older than the arena");

        let pre_usage = self.usage(note);
        self.stats.count_sweep(mode);
        self.stats.gc_reclaim(pre_usage);

        let old_cursor = self.cursor.as_ptr() as usize;
        self.cursor = note.as_ptr();
        self.sweep(note, old_cursor);

        if self.config.verbosity >= 3 {
            tracing::info!(
                target: "rime_gc::collect",
                mode = mode.sweep_name(),
                eligible = pre_usage,
                above_min = pre_usage >= self.min_usage,
                min = self.min_usage,
                total = self.total_usage(),
                "sweep"
            );
        }
    }

    // =========================================================================
    // Sweeping
    // =========================================================================

    /// Release everything positioned at or after `note` that was not marked,
    /// and move marked large objects and extrefs to `note`.
    ///
    /// Chunks after the one holding `note` are returned to the pool, walking
    /// back from `old_cursor`. Extref decrefs run last, once the arena is
    /// consistent, since they may cascade. Returns the number of large
    /// objects kept.
    pub(crate) fn sweep(&mut self, note: Note, old_cursor: usize) -> usize {
        let collect_pos = note.pos();
        let mark_pos = collect_pos.prev();

        let kept_large = self.sweep_large(mark_pos, collect_pos);
        self.sweep_chunks(note.chunk(), old_cursor);

        let swept = self.extrefs.sweep(mark_pos, collect_pos);
        self.stats.modify_extrefs(-(swept.removed as isize));

        self.last_note = note;
        if kept_large > 0 || swept.survived {
            self.placeholder_after(collect_pos);
        }
        if self.config.verify_invariants {
            self.verify_invariants();
        }

        for delegate in swept.pending_decrefs {
            safe_decref(&*self.coordinator, &self.table, delegate);
        }
        kept_large
    }

    fn sweep_large(&mut self, mark_pos: Pos, collect_pos: Pos) -> usize {
        let split = self
            .large
            .iter()
            .rposition(|large| large.pos() < mark_pos)
            .map_or(0, |i| i + 1);
        if split == self.large.len() {
            return 0;
        }

        let young = self.large.split_off(split);
        let mut kept = 0;
        for large in young {
            if large.pos() > mark_pos {
                self.stats.modify_large(-1, -(large.size() as isize));
                // SAFETY: unmarked, so nothing live refers to it.
                unsafe { large.free() };
            } else {
                large.set_pos(collect_pos);
                self.large.push(large);
                kept += 1;
            }
        }
        kept
    }

    fn sweep_chunks(&mut self, collect_chunk: Chunk, old_cursor: usize) {
        // SAFETY: the old cursor's chunk is still linked.
        let mut chunk = unsafe { Chunk::containing(old_cursor) };
        let mut freed = 0;
        while chunk != collect_chunk {
            let Some(prev) = chunk.prev() else {
                unreachable!("collect note is not in this arena")
            };
            self.chunks.delete_chunk(chunk);
            freed += 1;
            chunk = prev;
        }
        if freed > 0 {
            self.stats.modify_chunks(-freed);
            self.chunks.collect_garbage();
        }
    }
}
