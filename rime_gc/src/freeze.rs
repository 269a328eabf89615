//! Freezing object graphs.
//!
//! Freezing replaces a mutable graph with an immutable deep copy in the
//! same arena. Already-frozen objects, interned ones included, are shared
//! rather than copied, so freezing a frozen object is the identity.
//!
//! | root type hint        | strategy                                   |
//! |-----------------------|--------------------------------------------|
//! | `no_mutable_aliases`  | copy every mutable node, no copy map       |
//! | otherwise             | copy map, each mutable node copied once    |
//!
//! Types hinted `all_frozen_refs` are copied without scanning their
//! references.

use crate::heap::Arena;
use rime_core::ObjPtr;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

type Slots = SmallVec<[(usize, ObjPtr); 4]>;

/// Freeze the graph rooted at `obj`, returning the frozen root.
pub(crate) fn freeze(arena: &mut Arena, obj: ObjPtr) -> ObjPtr {
    if obj.is_frozen() {
        return obj;
    }
    if obj.ty().hints().no_mutable_aliases {
        NoAliasFreezer { arena }.freeze(obj)
    } else {
        Freezer::new(arena).freeze(obj)
    }
}

#[inline]
fn mutable_refs(obj: ObjPtr) -> Slots {
    let mut slots = Slots::new();
    obj.for_each_ref(|offset, target| {
        if !target.is_frozen() {
            slots.push((offset, target));
        }
    });
    slots
}

/// Shallow-copy `obj` and mark the copy frozen.
#[inline]
fn frozen_clone(arena: &mut Arena, obj: ObjPtr) -> ObjPtr {
    let copy = arena.shallow_clone(obj);
    copy.set_frozen();
    copy
}

/// General freezer, preserving sharing and cycles through a copy map.
struct Freezer<'a> {
    arena: &'a mut Arena,
    copies: FxHashMap<ObjPtr, ObjPtr>,
    /// Copies whose references still point at mutable originals.
    pending: Vec<ObjPtr>,
}

impl<'a> Freezer<'a> {
    fn new(arena: &'a mut Arena) -> Self {
        Self {
            arena,
            copies: FxHashMap::default(),
            pending: Vec::new(),
        }
    }

    fn freeze(mut self, root: ObjPtr) -> ObjPtr {
        let frozen = self.copy_object(root);
        while let Some(copy) = self.pending.pop() {
            for (offset, target) in mutable_refs(copy) {
                let target = self.copy_object(target);
                copy.write_ref(offset, Some(target));
            }
        }
        frozen
    }

    fn copy_object(&mut self, obj: ObjPtr) -> ObjPtr {
        if obj.is_frozen() {
            return obj;
        }
        if let Some(&copy) = self.copies.get(&obj) {
            return copy;
        }
        let copy = frozen_clone(self.arena, obj);
        self.copies.insert(obj, copy);
        if !copy.ty().is_all_frozen_refs() {
            self.pending.push(copy);
        }
        copy
    }
}

/// Freezer for graphs known to be trees of mutable nodes.
struct NoAliasFreezer<'a> {
    arena: &'a mut Arena,
}

impl NoAliasFreezer<'_> {
    fn freeze(self, root: ObjPtr) -> ObjPtr {
        let frozen = frozen_clone(self.arena, root);
        let mut stack = vec![frozen];
        while let Some(copy) = stack.pop() {
            if copy.ty().is_all_frozen_refs() {
                continue;
            }
            for (offset, target) in mutable_refs(copy) {
                let child = frozen_clone(self.arena, target);
                copy.write_ref(offset, Some(child));
                stack.push(child);
            }
        }
        frozen
    }
}
