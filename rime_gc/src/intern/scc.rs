//! Interning cyclic components.
//!
//! A component that may contain a cycle is interned in one of two ways:
//!
//! 1. It is isomorphic to an already interned cycle that one of its
//!    members points into. The whole component then maps onto that cycle.
//! 2. Otherwise duplicates are removed, a root is elected, and the
//!    component is looked up by a [`CycleHandle`](super::CYCLE_HANDLE)
//!    hashed from the root.
//!
//! Root election must not depend on which member the walk entered the
//! component from: it is the smallest member, under [`deep_compare`],
//! of the partition with the smallest local hash.

use super::compare::{deep_compare, deep_equal};
use super::cycle_handle;
use super::refcount::{
    CYCLE_MEMBER, incref, is_cycle_member, is_definitely_acyclic, is_fully_interned, refcount_delegate,
};
use super::storage;
use super::table::find_in;
use super::tarjan::Interner;
use rime_core::hash::{hash_bytes, hash_combine};
use rime_core::{IObjPtr, REF_SIZE, StateChange};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::cmp::Ordering;

type RefList = SmallVec<[(usize, IObjPtr); 4]>;

/// Non-null references held by an interned object or clone.
fn refs_of(iobj: IObjPtr) -> RefList {
    let mut refs = RefList::new();
    iobj.for_each_ref(|offset, target| refs.push((offset, storage::as_iobj(target))));
    refs
}

impl Interner<'_> {
    /// Hash of the bytes that cannot change however the component is
    /// interned: everything except references that are not definitely
    /// acyclic.
    pub(super) fn local_hash(&self, iobj: IObjPtr) -> u64 {
        if self.table.local_hash_collisions_forced() {
            return 0;
        }
        let ty = iobj.ty();
        let mut hash = ty as *const _ as usize as u64;
        if ty.is_array() {
            hash = hash_combine(hash, iobj.len() as u64);
        }

        // SAFETY: the clone is owned by this interner.
        let bytes = unsafe { iobj.user_bytes() };
        let mut prev_end = 0;
        for (offset, target) in refs_of(iobj) {
            if !is_definitely_acyclic(target) {
                if offset > prev_end {
                    hash = hash_bytes(hash, &bytes[prev_end..offset]);
                }
                prev_end = offset + REF_SIZE;
            }
        }
        if prev_end < bytes.len() {
            hash = hash_bytes(hash, &bytes[prev_end..]);
        }
        hash
    }

    /// Split the member list into lists of equal local hash.
    fn partition_by_local_hash(&mut self, head: usize) -> FxHashMap<u64, usize> {
        let mut partitions = FxHashMap::default();
        let mut cursor = Some(head);
        while let Some(n) = cursor {
            cursor = self.nodes[n].next;
            let hash = self.local_hash(self.nodes[n].interned);
            self.nodes[n].local_hash = hash;
            // Prepend, so the component's Tarjan root, listed last, ends up
            // first and is never discarded as a duplicate.
            self.nodes[n].next = partitions.insert(hash, n);
        }
        partitions
    }

    /// Quicksort `list` by [`deep_compare`], dropping members equal to a
    /// pivot, and chain the result in front of `following`.
    fn qsort_and_dedup(&mut self, list: Option<usize>, following: Option<usize>) -> Option<usize> {
        let Some(pivot) = list else {
            return following;
        };
        let mut cursor = self.nodes[pivot].next;
        self.nodes[pivot].next = None;
        let pivot_obj = self.nodes[pivot].interned;

        let mut less = None;
        let mut greater = None;
        while let Some(n) = cursor {
            cursor = self.nodes[n].next;
            match deep_compare(self.nodes[n].interned, pivot_obj) {
                Ordering::Less => {
                    self.nodes[n].next = less;
                    less = Some(n);
                }
                Ordering::Greater => {
                    self.nodes[n].next = greater;
                    greater = Some(n);
                }
                Ordering::Equal => {
                    self.clone_to_node.insert(self.nodes[n].interned, pivot);
                }
            }
        }

        let after = self.qsort_and_dedup(greater, following);
        self.nodes[pivot].next = after;
        self.qsort_and_dedup(less, Some(pivot))
    }

    /// Point intra-component references at the surviving clones and hash
    /// the component by a depth-first walk from `root`.
    fn canonicalize_refs_and_hash(&mut self, root: usize) -> u64 {
        let mut hash = self.nodes[root].local_hash;
        let mut order = 1;
        self.nodes[root].dfs_order = order;

        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            let holder = self.nodes[n].interned;
            for (offset, target) in refs_of(holder) {
                if is_fully_interned(target) {
                    continue;
                }
                let child = self.node_of(target);
                holder.write_ref(offset, Some(self.nodes[child].interned.obj()));
                if self.nodes[child].dfs_order == 0 {
                    order += 1;
                    self.nodes[child].dfs_order = order;
                    stack.push(child);
                }
                hash = hash_combine(hash, self.nodes[child].local_hash);
                // Visit order tells apart components whose members all
                // hash alike.
                hash = hash_combine(hash, order as u64);
            }
        }
        hash
    }

    /// Intern a component that does not map onto a cycle it points into.
    pub(super) fn intern_complex_scc(&mut self, head: usize) {
        let partitions = self.partition_by_local_hash(head);

        let mut root: Option<usize> = None;
        let mut list = None;
        for (&hash, &first) in &partitions {
            list = self.qsort_and_dedup(Some(first), list);
            if root.is_none_or(|r| hash < self.nodes[r].local_hash) {
                root = list;
            }
        }
        let Some(root) = root else {
            unreachable!("empty component")
        };

        let hash = self.canonicalize_refs_and_hash(root);
        let root_clone = self.nodes[root].interned;
        let handle = cycle_handle::new(hash, root_clone);

        let mut members: SmallVec<[IObjPtr; 8]> = SmallVec::new();
        let mut cursor = list;
        while let Some(n) = cursor {
            members.push(self.nodes[n].interned);
            cursor = self.nodes[n].next;
        }

        let table = self.table;
        let redundant = table.with_bucket(hash, |bucket| {
            if let Some(existing) = find_in(bucket, handle.obj()) {
                self.record_intern_mapping(root_clone, cycle_handle::root(existing));
                return true;
            }

            // References leaving the component are counted; internal ones
            // are not.
            for &member in &members {
                for (_, target) in refs_of(member) {
                    if is_fully_interned(target) {
                        incref(target);
                    }
                }
            }
            for &member in &members {
                member.set_refcount(CYCLE_MEMBER);
                member.set_next(Some(handle));
                if let Some(handler) = member.ty().state_change() {
                    handler(member, StateChange::Initialize);
                }
            }
            // Each node holds one reference until the interner finishes.
            handle.set_refcount(members.len() as u32);
            table.insert_in(bucket, handle);
            false
        });

        if redundant {
            // SAFETY: never published.
            unsafe { storage::free(handle) };
        }
    }

    /// Map the component onto an interned cycle if some member is
    /// isomorphic to a member of a cycle the component points into.
    pub(super) fn find_equal_neighbor(&mut self, head: usize) -> bool {
        let mut cycles_seen = FxHashSet::default();
        let mut cursor = Some(head);
        while let Some(n) = cursor {
            cursor = self.nodes[n].next;
            if !self.nodes[n].points_to_interned_cycle {
                continue;
            }
            let iobj = self.nodes[n].interned;
            for (_, target) in refs_of(iobj) {
                if is_cycle_member(target) && cycles_seen.insert(refcount_delegate(target)) {
                    if let Some(equal) = find_equal_predecessor(iobj, target) {
                        self.record_intern_mapping(iobj, equal);
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Record that the clone `dup` interns to `canonical`, and likewise
    /// for everything reachable from both in lock step.
    fn record_intern_mapping(&mut self, dup: IObjPtr, canonical: IObjPtr) {
        debug_assert!(!is_fully_interned(dup));
        debug_assert!(is_fully_interned(canonical));

        let first = self.node_of(dup);
        self.nodes[first].visited = true;
        let mut dead = Vec::new();
        let mut stack = vec![(dup, canonical)];

        while let Some((r1, r2)) = stack.pop() {
            debug_assert!(is_cycle_member(r2));
            debug_assert_eq!(refcount_delegate(r2), refcount_delegate(canonical));
            debug_assert!(std::ptr::eq(r1.ty(), r2.ty()));

            for (offset, n1) in refs_of(r1) {
                if is_fully_interned(n1) {
                    continue;
                }
                let x = self.node_of(n1);
                if self.nodes[x].visited {
                    continue;
                }
                self.nodes[x].visited = true;
                match r2.read_ref(offset) {
                    Some(n2) => stack.push((n1, storage::as_iobj(n2))),
                    None => unreachable!("isomorphic objects differ in shape"),
                }
            }

            let node = self.node_of(r1);
            self.nodes[node].interned = r2;
            incref(r2);
            dead.push(r1);
        }

        for clone in dead {
            self.clone_to_node.remove(&clone);
            // SAFETY: replaced by its interned equivalent everywhere.
            unsafe { storage::free(clone) };
        }
    }
}

/// A member of `member`'s cycle that points at `member` and is isomorphic
/// to `iobj`, which also points at `member`.
fn find_equal_predecessor(iobj: IObjPtr, member: IObjPtr) -> Option<IObjPtr> {
    let handle = refcount_delegate(member);
    debug_assert_ne!(handle, member);

    let mut seen = FxHashSet::default();
    seen.insert(member);
    let mut stack = vec![member];

    while let Some(n) = stack.pop() {
        let mut compared = false;
        for (_, target) in refs_of(n) {
            if refcount_delegate(target) != handle {
                continue;
            }
            if target == member && !compared {
                if deep_equal(iobj, n) {
                    return Some(n);
                }
                compared = true;
            }
            if seen.insert(target) {
                stack.push(target);
            }
        }
    }
    None
}
