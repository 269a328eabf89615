//! Deep structural comparison.
//!
//! Two objects are equal when no chain of references followed in lock step
//! from both reaches a difference in type, length or non-reference bytes.
//! The walk is breadth first and never queues a pair twice, so it
//! terminates on cyclic graphs: a pair met again is assumed equal, and if
//! it is not, its earlier copy in the queue finds the difference first.
//!
//! The queue must stay FIFO. With a stack the ordering returned by
//! [`deep_compare`] would not be transitive.

use rime_core::{IObjPtr, ObjPtr, REF_SIZE};
use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// Total order on object graphs, `Equal` exactly for isomorphic graphs.
pub fn deep_compare(a: IObjPtr, b: IObjPtr) -> Ordering {
    Walk::new(true).compare(a, b)
}

/// True if the graphs rooted at `a` and `b` are isomorphic.
pub fn deep_equal(a: IObjPtr, b: IObjPtr) -> bool {
    Walk::new(false).compare(a, b) == Ordering::Equal
}

struct Walk {
    pending: VecDeque<(IObjPtr, IObjPtr)>,
    /// Pairs ever queued, smaller address first.
    seen: FxHashSet<(IObjPtr, IObjPtr)>,
    need_ordering: bool,
}

impl Walk {
    fn new(need_ordering: bool) -> Self {
        Self {
            pending: VecDeque::new(),
            seen: FxHashSet::default(),
            need_ordering,
        }
    }

    fn compare(mut self, a: IObjPtr, b: IObjPtr) -> Ordering {
        let first = self.quick_compare_or_defer(Some(a.obj()), Some(b.obj()));
        if first != Ordering::Equal {
            return first;
        }

        while let Some((x, y)) = self.pending.pop_front() {
            let (tx, ty) = (x.ty(), y.ty());
            if !std::ptr::eq(tx, ty) {
                return (tx as *const _ as usize).cmp(&(ty as *const _ as usize));
            }
            let size = x.user_size();
            match size.cmp(&y.user_size()) {
                Ordering::Equal => {}
                other => return other,
            }

            // SAFETY: interned objects are immutable and outlive the walk.
            let (bx, by) = unsafe { (x.user_bytes(), y.user_bytes()) };
            let mut prev_end = 0;
            let mut result = Ordering::Equal;
            tx.any_ref_offset(x.len(), |off| {
                result = bx[prev_end..off].cmp(&by[prev_end..off]);
                if result != Ordering::Equal {
                    return true;
                }
                prev_end = off + REF_SIZE;
                result = self.quick_compare_or_defer(x.read_ref(off), y.read_ref(off));
                result != Ordering::Equal
            });
            if result != Ordering::Equal {
                return result;
            }
            match bx[prev_end..].cmp(&by[prev_end..]) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Settle a pair of references right away if possible, else queue it
    /// and assume equality for now.
    fn quick_compare_or_defer(&mut self, a: Option<ObjPtr>, b: Option<ObjPtr>) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (Some(x), Some(y)) = (a.and_then(ObjPtr::as_interned), b.and_then(ObjPtr::as_interned)) else {
            return addr_of(a).cmp(&addr_of(b));
        };
        // Distinct published objects are never isomorphic.
        if !self.need_ordering && is_published(x) && is_published(y) {
            return x.addr().cmp(&y.addr());
        }
        let key = if x < y { (x, y) } else { (y, x) };
        if self.seen.insert(key) {
            self.pending.push_back((x, y));
        }
        Ordering::Equal
    }
}

#[inline]
fn addr_of(obj: Option<ObjPtr>) -> usize {
    obj.map_or(0, ObjPtr::addr)
}

#[inline]
fn is_published(obj: IObjPtr) -> bool {
    super::refcount::is_fully_interned(obj)
}
