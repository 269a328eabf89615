//! References from an arena into interned storage.
//!
//! An arena holds one reference per refcount delegate it can reach, keyed by
//! identity. Each entry records the position it was taken at and links to
//! the previously added entry, so the list runs newest to oldest.

use super::Pos;
use crate::intern::refcount::decref_to_nonzero;
use rime_core::IObjPtr;
use rustc_hash::FxHashMap;

/// One tracked reference.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ExtRef {
    pub pos: Pos,
    pub prev: Option<IObjPtr>,
}

/// Outcome of sweeping young entries.
#[derive(Debug, Default)]
pub(crate) struct ExtRefSweep {
    /// Entries dropped from the arena.
    pub removed: usize,
    /// True if some marked entry was kept.
    pub survived: bool,
    /// Delegates whose last reference the arena held.
    pub pending_decrefs: Vec<IObjPtr>,
}

#[derive(Debug, Default)]
pub(crate) struct ExtRefs {
    map: FxHashMap<IObjPtr, ExtRef>,
    current: Option<IObjPtr>,
}

impl ExtRefs {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub fn contains(&self, delegate: IObjPtr) -> bool {
        self.map.contains_key(&delegate)
    }

    #[inline]
    pub fn get_mut(&mut self, delegate: IObjPtr) -> Option<&mut ExtRef> {
        self.map.get_mut(&delegate)
    }

    /// Track `delegate` at `pos` as the newest entry. Returns false, leaving
    /// the existing entry alone, if it was already tracked.
    pub fn insert(&mut self, delegate: IObjPtr, pos: Pos) -> bool {
        if self.map.contains_key(&delegate) {
            return false;
        }
        self.map.insert(
            delegate,
            ExtRef {
                pos,
                prev: self.current,
            },
        );
        self.current = Some(delegate);
        true
    }

    /// Visit entries newest to oldest.
    pub fn for_each(&self, mut f: impl FnMut(IObjPtr, &ExtRef)) {
        let mut cursor = self.current;
        while let Some(delegate) = cursor {
            let Some(entry) = self.map.get(&delegate) else {
                unreachable!("extref chain broken")
            };
            f(delegate, entry);
            cursor = entry.prev;
        }
    }

    /// Remove every entry, newest first.
    pub fn drain(&mut self) -> Vec<IObjPtr> {
        let mut out = Vec::with_capacity(self.map.len());
        self.for_each(|delegate, _| out.push(delegate));
        self.map.clear();
        self.current = None;
        out
    }

    /// Drop entries young relative to `collect_note` and rehome the ones
    /// marked at `mark_pos` to `collect_note`.
    ///
    /// Marked entries were moved by the collector without relinking, so the
    /// walk proceeds newest first until it meets an entry older than
    /// `mark_pos`. Dropped references are released with
    /// [`decref_to_nonzero`] where possible; the rest are returned for a
    /// full decref once the arena is consistent again.
    pub fn sweep(&mut self, mark_pos: Pos, collect_note: Pos) -> ExtRefSweep {
        let mut out = ExtRefSweep::default();
        let mut newest_kept: Option<IObjPtr> = None;
        let mut oldest_kept: Option<IObjPtr> = None;

        let mut cursor = self.current;
        while let Some(delegate) = cursor {
            let Some(entry) = self.map.get_mut(&delegate) else {
                unreachable!("extref chain broken")
            };
            if entry.pos < mark_pos {
                break;
            }
            cursor = entry.prev;

            if entry.pos >= collect_note {
                self.map.remove(&delegate);
                out.removed += 1;
                if !decref_to_nonzero(delegate.refcount_cell()) {
                    out.pending_decrefs.push(delegate);
                }
            } else {
                debug_assert_eq!(entry.pos, mark_pos);
                entry.pos = collect_note;
                // Survivors are relinked in reverse; they share a position.
                entry.prev = newest_kept;
                newest_kept = Some(delegate);
                oldest_kept.get_or_insert(delegate);
            }
        }

        match oldest_kept {
            Some(oldest) => {
                if let Some(entry) = self.map.get_mut(&oldest) {
                    entry.prev = cursor;
                }
                self.current = newest_kept;
                out.survived = true;
            }
            None => self.current = cursor,
        }
        out
    }

    /// Take over every entry of `source`, oldest first, at positions mapped
    /// through `rebase`.
    ///
    /// A delegate tracked by both gives back the reference `source` held.
    /// Returns the number of entries added.
    pub fn absorb(&mut self, source: &mut ExtRefs, rebase: impl Fn(Pos) -> Pos) -> usize {
        let mut entries = Vec::with_capacity(source.len());
        source.for_each(|delegate, entry| entries.push((delegate, entry.pos)));
        source.map.clear();
        source.current = None;

        let mut added = 0;
        for (delegate, pos) in entries.into_iter().rev() {
            if self.insert(delegate, rebase(pos)) {
                added += 1;
            } else {
                let released = decref_to_nonzero(delegate.refcount_cell());
                debug_assert!(released, "duplicate extref held the only reference");
            }
        }
        added
    }

    /// Number of entries reachable through the chain.
    pub fn chain_len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_, _| n += 1);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::storage;
    use rime_core::Type;

    static LEAF: Type = Type::class("Leaf", 8, &[]);

    fn leaf(refcount: u32) -> IObjPtr {
        let iobj = storage::alloc(&LEAF, 0);
        iobj.set_refcount(refcount);
        iobj
    }

    fn release(iobjs: &[IObjPtr]) {
        for &iobj in iobjs {
            // SAFETY: test objects are never published.
            unsafe { storage::free(iobj) };
        }
    }

    #[test]
    fn test_insert_threads_newest_first() {
        let (a, b, c) = (leaf(1), leaf(1), leaf(1));
        let mut refs = ExtRefs::new();
        assert!(refs.insert(a, Pos::new(0, 16)));
        assert!(refs.insert(b, Pos::new(0, 24)));
        assert!(!refs.insert(a, Pos::new(0, 32)));
        assert!(refs.insert(c, Pos::new(1, 16)));

        let mut order = Vec::new();
        refs.for_each(|delegate, _| order.push(delegate));
        assert_eq!(order, vec![c, b, a]);
        assert_eq!(refs.chain_len(), 3);
        assert_eq!(refs.drain(), vec![c, b, a]);
        assert_eq!(refs.len(), 0);
        release(&[a, b, c]);
    }

    #[test]
    fn test_sweep_drops_young_and_rehomes_marked() {
        let (old, young, marked) = (leaf(2), leaf(2), leaf(2));
        let note = Pos::new(1, 64);
        let mark = note.prev();
        let mut refs = ExtRefs::new();
        refs.insert(old, Pos::new(0, 16));
        refs.insert(young, Pos::new(2, 16));
        refs.insert(marked, mark);

        let out = refs.sweep(mark, note);
        assert_eq!(out.removed, 1);
        assert!(out.survived);
        assert!(out.pending_decrefs.is_empty());
        assert_eq!(young.refcount(), 1);
        assert!(!refs.contains(young));
        assert_eq!(refs.get_mut(marked).map(|e| e.pos), Some(note));
        assert_eq!(refs.chain_len(), 2);
        release(&[old, young, marked]);
    }

    #[test]
    fn test_sweep_returns_last_references() {
        let only = leaf(1);
        let mut refs = ExtRefs::new();
        refs.insert(only, Pos::new(1, 16));
        let note = Pos::new(0, 64);
        let out = refs.sweep(note.prev(), note);
        assert_eq!(out.pending_decrefs, vec![only]);
        assert_eq!(refs.len(), 0);
        release(&[only]);
    }

    #[test]
    fn test_absorb_keeps_order_and_returns_duplicates() {
        let (shared, mine, theirs) = (leaf(2), leaf(1), leaf(1));
        let mut parent = ExtRefs::new();
        parent.insert(shared, Pos::new(0, 16));
        parent.insert(mine, Pos::new(0, 24));

        let mut child = ExtRefs::new();
        child.insert(shared, Pos::new(1, 16));
        child.insert(theirs, Pos::new(1, 24));

        let added = parent.absorb(&mut child, |pos| Pos::new(pos.generation() + 2, pos.offset()));
        assert_eq!(added, 1);
        assert_eq!(child.len(), 0);
        assert_eq!(shared.refcount(), 1);
        assert_eq!(parent.get_mut(theirs).map(|e| e.pos), Some(Pos::new(3, 24)));
        assert_eq!(parent.get_mut(shared).map(|e| e.pos), Some(Pos::new(0, 16)));

        let mut order = Vec::new();
        parent.for_each(|delegate, _| order.push(delegate));
        assert_eq!(order, vec![theirs, mine, shared]);
        release(&[shared, mine, theirs]);
    }
}
