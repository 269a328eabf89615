//! The intern table.
//!
//! Buckets are keyed by structural hash and spread over dashmap shards.
//! Every lookup, insert and erase happens with the bucket's shard locked,
//! which is what makes `find or insert` atomic and lets a decref race
//! safely against a concurrent lookup of the same object.
//!
//! ```text
//!   hash ──► shard lock ──► SmallVec<[IObjPtr; 1]>
//!                             │
//!                             ├─ plain interned object (raw bytes hash)
//!                             └─ CycleHandle           (cycle hash)
//! ```

use super::compare::deep_equal;
use super::cycle_handle;
use super::refcount::{
    BEING_INTERNED, MAX_REFCOUNT, decref_to_nonzero, incref, is_cycle_member, is_definitely_acyclic,
    refcount_delegate,
};
use super::stats::{InternStats, TypeStats};
use super::storage;
use super::tarjan::Interner;
use crate::config::GcConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use rime_core::hash::raw_object_hash;
use rime_core::{IObjPtr, ObjPtr, StateChange};
use rustc_hash::FxHasher;
use smallvec::SmallVec;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

/// Objects sharing one structural hash.
pub(crate) type Bucket = SmallVec<[IObjPtr; 1]>;

static GLOBAL: LazyLock<Arc<InternTable>> = LazyLock::new(|| Arc::new(InternTable::with_config(GcConfig::global())));

/// Global registry of canonical interned objects.
pub struct InternTable {
    buckets: DashMap<u64, Bucket, BuildHasherDefault<FxHasher>>,
    size: AtomicUsize,
    force_collisions: AtomicBool,
    stats: Option<Mutex<InternStats>>,
}

impl InternTable {
    /// Create an empty table without statistics.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::with_hasher(BuildHasherDefault::default()),
            size: AtomicUsize::new(0),
            force_collisions: AtomicBool::new(false),
            stats: None,
        }
    }

    /// Create an empty table, collecting statistics if `config` asks for it.
    pub fn with_config(config: &GcConfig) -> Self {
        let mut table = Self::new();
        if config.intern_stats {
            table.stats = Some(Mutex::new(InternStats::default()));
        }
        table
    }

    /// The process-wide table.
    pub fn global() -> Arc<InternTable> {
        Arc::clone(&GLOBAL)
    }

    /// Number of published entries (plain objects and cycle handles).
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// True if nothing is published.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// True if `iobj` itself is a published entry.
    pub fn contains(&self, iobj: IObjPtr) -> bool {
        let hash = cycle_handle::object_hash(iobj);
        self.buckets.get(&hash).is_some_and(|bucket| bucket.contains(&iobj))
    }

    /// Make every local hash zero so that cycle partitioning degenerates
    /// to a single partition. Returns the previous setting.
    pub fn force_local_hash_collisions(&self, force: bool) -> bool {
        self.force_collisions.swap(force, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn local_hash_collisions_forced(&self) -> bool {
        self.force_collisions.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Interning
    // =========================================================================

    /// Return the canonical interned equivalent of the graph rooted at
    /// `obj`, with one reference owned by the caller.
    ///
    /// Already-interned objects are returned with an extra reference.
    pub fn intern(&self, obj: ObjPtr) -> IObjPtr {
        if let Some(iobj) = obj.as_interned() {
            incref(iobj);
            return iobj;
        }
        if let Some(iobj) = self.simple_intern(obj) {
            self.record_stats(obj);
            return iobj;
        }
        Interner::new(self).run(obj)
    }

    /// Intern `obj` if every reference it holds is definitely acyclic.
    pub(crate) fn simple_intern(&self, obj: ObjPtr) -> Option<IObjPtr> {
        debug_assert!(obj.as_interned().is_none());
        let maybe_cyclic = obj.any_ref(|_, target| target.as_interned().is_none_or(|i| !is_definitely_acyclic(i)));
        if maybe_cyclic {
            return None;
        }
        Some(self.intern_with_known_refs(obj))
    }

    /// Find or insert `obj`, whose references are final.
    ///
    /// `obj` is either an arena object, cloned on insert, or a clone still
    /// being interned, which is published as is or freed if redundant.
    pub(crate) fn intern_with_known_refs(&self, obj: ObjPtr) -> IObjPtr {
        let hash = raw_object_hash(obj);
        let clone = obj.as_interned();

        let (result, redundant) = self.with_bucket(hash, |bucket| {
            if let Some(existing) = find_in(bucket, obj) {
                incref(existing);
                return (existing, clone);
            }

            let iobj = match clone {
                Some(iobj) => {
                    debug_assert_eq!(iobj.refcount(), BEING_INTERNED);
                    iobj.set_refcount(1);
                    iobj
                }
                None => storage::shallow_clone(obj),
            };
            iobj.for_each_ref(|_, target| incref(storage::as_iobj(target)));

            // Nobody can see the object before its initializer ran.
            if let Some(handler) = iobj.ty().state_change() {
                handler(iobj, StateChange::Initialize);
            }
            self.insert_in(bucket, iobj);
            (iobj, None)
        });

        if let Some(dup) = redundant {
            debug_assert_eq!(dup.refcount(), BEING_INTERNED);
            // SAFETY: the clone was never published.
            unsafe { storage::free(dup) };
        }
        result
    }

    // =========================================================================
    // Buckets
    // =========================================================================

    /// Run `f` with the bucket for `hash` locked.
    pub(crate) fn with_bucket<R>(&self, hash: u64, f: impl FnOnce(&mut Bucket) -> R) -> R {
        let mut bucket = self.buckets.entry(hash).or_default();
        let result = f(&mut bucket);
        let empty = bucket.is_empty();
        drop(bucket);
        if empty {
            self.buckets.remove_if(&hash, |_, bucket| bucket.is_empty());
        }
        result
    }

    pub(crate) fn insert_in(&self, bucket: &mut Bucket, iobj: IObjPtr) {
        debug_assert!(!bucket.contains(&iobj));
        bucket.push(iobj);
        self.size.fetch_add(1, Ordering::Relaxed);
    }

    fn erase_in(&self, bucket: &mut Bucket, iobj: IObjPtr) {
        match bucket.iter().position(|&entry| entry == iobj) {
            Some(idx) => {
                bucket.swap_remove(idx);
                self.size.fetch_sub(1, Ordering::Relaxed);
            }
            None => panic!("{iobj:?} missing from its intern bucket"),
        }
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Drop a reference to `obj`, releasing everything that becomes
    /// unreachable.
    ///
    /// Dead objects are scanned before any is freed, so that all members
    /// of a dead cycle are found through intra-cycle references first.
    pub fn decref(&self, obj: IObjPtr) {
        let delegate = refcount_delegate(obj);
        if !self.decref_non_cycle_member(delegate) {
            return;
        }

        let mut scan = vec![delegate];
        while let Some(next) = scan.pop() {
            let mut scan_before_free = vec![next];
            let mut free_stack = Vec::new();

            while let Some(dead) = scan_before_free.pop() {
                debug_assert!(!is_cycle_member(dead));
                free_stack.push(dead);

                dead.for_each_ref(|_, target| {
                    let target = storage::as_iobj(target);
                    let counted = if is_cycle_member(target) {
                        let handle = refcount_delegate(target);
                        if handle.refcount() == 0 {
                            // Member of a dying cycle. The large count makes
                            // further intra-cycle decrefs no-ops.
                            target.set_refcount(MAX_REFCOUNT);
                            scan_before_free.push(target);
                            return;
                        }
                        handle
                    } else {
                        target
                    };
                    if self.decref_non_cycle_member(counted) {
                        scan.push(counted);
                    }
                });
            }

            for dead in free_stack {
                // SAFETY: erased from the table and unreferenced.
                unsafe { storage::release(dead) };
            }
        }
    }

    /// Decrement `obj`'s own count, erasing it from the table at zero.
    ///
    /// Returns true if the caller must now release `obj`.
    fn decref_non_cycle_member(&self, obj: IObjPtr) -> bool {
        debug_assert!(!is_cycle_member(obj));
        if decref_to_nonzero(obj.refcount_cell()) {
            return false;
        }

        // The table still holds a weak reference, so another thread may be
        // about to find and incref `obj`. The bucket lock settles the race.
        let hash = cycle_handle::object_hash(obj);
        self.with_bucket(hash, |bucket| {
            let rc = obj.refcount_cell().fetch_sub(1, Ordering::AcqRel) - 1;
            if rc == 0 {
                self.erase_in(bucket, obj);
                true
            } else {
                debug_assert!(rc < MAX_REFCOUNT);
                false
            }
        })
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    pub(crate) fn record_stats(&self, obj: ObjPtr) {
        if let Some(stats) = &self.stats {
            stats.lock().accrue(obj);
        }
    }

    /// Per-type counts of objects submitted for interning, largest first.
    ///
    /// Empty unless the table was created with `intern_stats`.
    pub fn stats(&self, sort_by_count: bool) -> Vec<TypeStats> {
        self.stats.as_ref().map_or_else(Vec::new, |stats| stats.lock().sorted(sort_by_count))
    }

    /// Log [`InternTable::stats`].
    pub fn dump_stats(&self, sort_by_count: bool) {
        for entry in self.stats(sort_by_count) {
            tracing::info!(
                target: "rime_gc::intern",
                name = entry.name,
                count = entry.count,
                bytes = entry.bytes,
                "interned"
            );
        }
    }

    /// Check bucket placement, refcounts and the size counter.
    ///
    /// Only meaningful while no other thread uses the table.
    pub fn verify_invariants(&self) {
        let mut count = 0;
        for entry in self.buckets.iter() {
            for &iobj in entry.value() {
                count += 1;
                assert_eq!(cycle_handle::object_hash(iobj), *entry.key(), "{iobj:?} filed under the wrong hash");
                let rc = iobj.refcount();
                assert!(rc >= 1 && rc <= MAX_REFCOUNT, "{iobj:?} published with refcount {rc}");
                if iobj.ty().is_cycle_handle() {
                    let root = cycle_handle::root(iobj);
                    assert!(is_cycle_member(root), "cycle root {root:?} is not a member");
                    assert_eq!(root.next(), Some(iobj), "cycle root delegates elsewhere");
                }
            }
        }
        assert_eq!(count, self.size(), "intern table size counter drifted");
    }
}

impl Default for InternTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InternTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternTable")
            .field("size", &self.size())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

pub(super) fn find_in(bucket: &Bucket, key: ObjPtr) -> Option<IObjPtr> {
    bucket.iter().copied().find(|&candidate| objects_equal(candidate, key))
}

/// Equality as the table sees it: bitwise for plain objects, whose
/// references are already canonical, and structural for cycle handles.
fn objects_equal(candidate: IObjPtr, key: ObjPtr) -> bool {
    if !std::ptr::eq(candidate.ty(), key.ty()) {
        return false;
    }
    if candidate.ty().is_cycle_handle() {
        let key = storage::as_iobj(key);
        cycle_handle::hash(candidate) == cycle_handle::hash(key)
            && deep_equal(cycle_handle::root(candidate), cycle_handle::root(key))
    } else {
        // SAFETY: both objects are live for the duration of the lookup.
        candidate.len() == key.len() && unsafe { candidate.user_bytes() == key.user_bytes() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Arena;
    use rime_core::{MemoryKind, Type};
    use std::sync::atomic::AtomicU32;

    static LEAF: Type = Type::class("Leaf", 8, &[]);
    static NODE: Type = Type::class("Node", 16, &[0]);
    static TEXT: Type = Type::array("Text", 1, &[]);

    fn arena(table: &Arc<InternTable>) -> Arena {
        Arena::with_table(GcConfig::default(), Arc::clone(table))
    }

    fn leaf(arena: &mut Arena, value: u64) -> ObjPtr {
        let obj = arena.alloc_object(&LEAF, 0);
        obj.write_u64(0, value);
        obj
    }

    fn node(arena: &mut Arena, value: u64, next: Option<ObjPtr>) -> ObjPtr {
        let obj = arena.alloc_object(&NODE, 0);
        obj.write_ref(0, next);
        obj.write_u64(8, value);
        obj
    }

    #[test]
    fn test_intern_is_idempotent() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let a = leaf(&mut arena, 5);
        let b = leaf(&mut arena, 5);

        let ia = table.intern(a);
        assert_eq!(table.size(), 1);
        let ib = table.intern(b);
        assert_eq!(ia, ib);
        assert_eq!(table.size(), 1);
        assert_eq!(ia.refcount(), 2);
        assert_eq!(ia.kind(), MemoryKind::Interned);
        assert!(table.contains(ia));
        table.verify_invariants();

        table.decref(ia);
        assert_eq!(table.size(), 1);
        table.decref(ib);
        assert!(table.is_empty());
    }

    #[test]
    fn test_interning_interned_object_increfs() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let iobj = table.intern(leaf(&mut arena, 1));
        let again = table.intern(iobj.obj());
        assert_eq!(again, iobj);
        assert_eq!(iobj.refcount(), 2);
        table.decref(iobj);
        table.decref(iobj);
        assert!(table.is_empty());
    }

    #[test]
    fn test_distinct_values_distinct_objects() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let a = table.intern(leaf(&mut arena, 1));
        let b = table.intern(leaf(&mut arena, 2));
        assert_ne!(a, b);
        assert_eq!(table.size(), 2);

        let short = arena.alloc_object(&TEXT, 3);
        let long = arena.alloc_object(&TEXT, 11);
        let s = table.intern(short);
        let l = table.intern(long);
        assert_ne!(s, l);
        assert_eq!(table.size(), 4);

        for iobj in [a, b, s, l] {
            table.decref(iobj);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_acyclic_chain_shares_structure() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);

        let c = node(&mut arena, 3, None);
        let b = node(&mut arena, 2, Some(c));
        let a = node(&mut arena, 1, Some(b));
        let first = table.intern(a);
        assert_eq!(table.size(), 3);

        let c2 = node(&mut arena, 3, None);
        let b2 = node(&mut arena, 2, Some(c2));
        let a2 = node(&mut arena, 1, Some(b2));
        let second = table.intern(a2);
        assert_eq!(first, second);
        assert_eq!(table.size(), 3);

        // The tail is shared too, and owned by its parent only.
        let tail = first.read_ref(0).and_then(ObjPtr::as_interned);
        assert!(tail.is_some_and(|t| t.refcount() == 1 && is_definitely_acyclic(t)));
        table.verify_invariants();

        table.decref(first);
        assert_eq!(table.size(), 3);
        table.decref(second);
        assert!(table.is_empty());
    }

    #[test]
    fn test_decref_cascades_through_chain() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let mut prev = None;
        for value in 0..50 {
            prev = Some(node(&mut arena, value, prev));
        }
        let Some(head) = prev else { unreachable!() };
        let iobj = table.intern(head);
        assert_eq!(table.size(), 50);
        table.decref(iobj);
        assert!(table.is_empty());
    }

    #[test]
    fn test_shared_child_survives_parent() {
        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let child = table.intern(leaf(&mut arena, 9));
        let parent_obj = node(&mut arena, 1, Some(child.obj()));
        let parent = table.intern(parent_obj);
        assert_eq!(child.refcount(), 2);

        table.decref(parent);
        assert_eq!(table.size(), 1);
        assert_eq!(child.refcount(), 1);
        table.decref(child);
        assert!(table.is_empty());
    }

    #[test]
    fn test_state_change_handlers() {
        static INITIALIZED: AtomicU32 = AtomicU32::new(0);
        static FINALIZED: AtomicU32 = AtomicU32::new(0);
        fn on_change(_: IObjPtr, change: StateChange) {
            match change {
                StateChange::Initialize => INITIALIZED.fetch_add(1, Ordering::Relaxed),
                StateChange::Finalize => FINALIZED.fetch_add(1, Ordering::Relaxed),
            };
        }
        static WATCHED: Type = Type::class("Watched", 8, &[]).with_state_change(on_change);

        let table = Arc::new(InternTable::new());
        let mut arena = arena(&table);
        let a = arena.alloc_object(&WATCHED, 0);
        let b = arena.alloc_object(&WATCHED, 0);
        let ia = table.intern(a);
        let ib = table.intern(b);
        assert_eq!(ia, ib);
        assert_eq!(INITIALIZED.load(Ordering::Relaxed), 1);

        table.decref(ia);
        assert_eq!(FINALIZED.load(Ordering::Relaxed), 0);
        table.decref(ib);
        assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stats_by_type() {
        let config = GcConfig {
            intern_stats: true,
            ..GcConfig::default()
        };
        let table = Arc::new(InternTable::with_config(&config));
        let mut arena = arena(&table);
        let mut interned = Vec::new();
        for value in 0..3 {
            interned.push(table.intern(leaf(&mut arena, value)));
        }
        interned.push(table.intern(node(&mut arena, 0, None)));

        let stats = table.stats(true);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0], TypeStats { name: "Leaf", count: 3, bytes: 24 });
        assert_eq!(stats[1].name, "Node");
        table.dump_stats(false);

        for iobj in interned {
            table.decref(iobj);
        }
        assert!(InternTable::new().stats(true).is_empty());
    }

    #[test]
    fn test_concurrent_interning_agrees() {
        let table = Arc::new(InternTable::new());
        let results: Vec<IObjPtr> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    scope.spawn(move || {
                        let mut arena = Arena::with_table(GcConfig::default(), Arc::clone(&table));
                        let mut last = None;
                        for value in 0..100 {
                            let iobj = table.intern(leaf(&mut arena, value % 10));
                            if let Some(prev) = last.replace(iobj) {
                                table.decref(prev);
                            }
                        }
                        last
                    })
                })
                .collect();
            workers.into_iter().filter_map(|w| w.join().ok().flatten()).collect()
        });

        assert_eq!(results.len(), 4);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.size(), 1);
        assert_eq!(results[0].refcount(), 4);
        table.verify_invariants();
        for iobj in results {
            table.decref(iobj);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_cycles_agree_and_release() {
        fn pair(arena: &mut Arena) -> (ObjPtr, ObjPtr) {
            let a = node(arena, 1, None);
            let b = node(arena, 2, Some(a));
            a.write_ref(0, Some(b));
            (a, b)
        }

        let table = Arc::new(InternTable::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let table = Arc::clone(&table);
                scope.spawn(move || {
                    let mut arena = arena(&table);
                    for i in 0..3000 {
                        let note = arena.note();
                        let ia = table.intern(pair(&mut arena).0);
                        let ib = table.intern(pair(&mut arena).1);
                        assert_eq!(ia.read_ref(0), Some(ib.obj()));
                        assert_eq!(ib.read_ref(0), Some(ia.obj()));

                        // An acyclic holder keeps the cycle alive past its
                        // own references.
                        let (member, _) = pair(&mut arena);
                        let holder = table.intern(node(&mut arena, 3, Some(member)));
                        assert_eq!(holder.read_ref(0), Some(ia.obj()));
                        if i % 2 == 0 {
                            table.decref(ia);
                            table.decref(ib);
                            table.decref(holder);
                        } else {
                            table.decref(holder);
                            table.decref(ib);
                            table.decref(ia);
                        }
                        arena.collect_sweep(note);
                    }
                });
            }
        });

        table.verify_invariants();
        assert!(table.is_empty());
    }
}
