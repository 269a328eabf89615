//! Interning arbitrary graphs.
//!
//! The graph is split into strongly connected components with an
//! iterative Tarjan walk. Components close in reverse topological order,
//! so when one closes everything it points to outside itself is already
//! interned and its own references can be made final.
//!
//! ```text
//!   refs stack:  [None, slot, slot, None, slot, ...]
//!                  │                 │
//!                  └ backtrack mark  └ backtrack mark of the child
//! ```
//!
//! Every visited arena object gets a [`TarjanNode`]. Nodes that may be
//! cyclic own a frozen clone with refcount `BEING_INTERNED`; the clone's
//! reference slots are rewritten in place as targets get interned.

use super::InternTable;
use super::refcount::{BEING_INTERNED, incref, is_cycle_member, is_fully_interned};
use super::storage;
use rime_core::{IObjPtr, ObjPtr};
use rustc_hash::FxHashMap;

/// Per-object interning state.
#[derive(Debug)]
pub(super) struct TarjanNode {
    /// The clone being interned, or the final interned object.
    pub(super) interned: IObjPtr,
    /// DFS discovery order.
    pub(super) index: usize,
    /// Smallest index reachable through the DFS subtree.
    pub(super) lowlink: usize,
    /// Tarjan stack link, later the component member list.
    pub(super) next: Option<usize>,
    /// DFS parent.
    pub(super) prev: Option<usize>,
    /// Found a back edge, so the component is cyclic even with one node.
    pub(super) in_cycle: bool,
    /// Used by the lock-step mapping.
    pub(super) visited: bool,
    /// Directly references a member of an already interned cycle.
    pub(super) points_to_interned_cycle: bool,
    /// Visit order while hashing a component, zero if unvisited.
    pub(super) dfs_order: usize,
    pub(super) local_hash: u64,
}

impl TarjanNode {
    fn new(index: usize, interned: IObjPtr) -> Self {
        Self {
            interned,
            index,
            lowlink: index,
            next: None,
            prev: None,
            in_cycle: false,
            visited: false,
            points_to_interned_cycle: false,
            dfs_order: 0,
            local_hash: 0,
        }
    }
}

/// A reference slot of a clone, waiting to be visited.
#[derive(Debug, Clone, Copy)]
struct RefSlot {
    holder: IObjPtr,
    offset: usize,
    target: ObjPtr,
}

/// One slow-path intern operation.
pub(crate) struct Interner<'t> {
    pub(super) table: &'t InternTable,
    pub(super) nodes: Vec<TarjanNode>,
    obj_to_node: FxHashMap<ObjPtr, usize>,
    pub(super) clone_to_node: FxHashMap<IObjPtr, usize>,
}

impl<'t> Interner<'t> {
    pub(crate) fn new(table: &'t InternTable) -> Self {
        Self {
            table,
            nodes: Vec::new(),
            obj_to_node: FxHashMap::default(),
            clone_to_node: FxHashMap::default(),
        }
    }

    /// Intern the graph rooted at `root`, which must not be interned.
    pub(crate) fn run(mut self, root: ObjPtr) -> IObjPtr {
        debug_assert!(root.as_interned().is_none());

        let mut refs: Vec<Option<RefSlot>> = Vec::new();
        let root_node = self.populate(root);
        self.push_refs(root_node, &mut refs);

        let mut curr = root_node;
        let mut stack = Some(curr);

        loop {
            match refs.last().copied() {
                Some(Some(slot)) => {
                    let interned = match slot.target.as_interned() {
                        Some(iobj) => iobj,
                        None => match self.obj_to_node.get(&slot.target).copied() {
                            None => {
                                if let Some(easy) = self.table.simple_intern(slot.target) {
                                    self.add_interned(slot.target, easy);
                                    easy
                                } else {
                                    let child = self.populate(slot.target);
                                    self.push_refs(child, &mut refs);
                                    self.nodes[child].prev = Some(curr);
                                    self.nodes[child].next = stack;
                                    stack = Some(child);
                                    curr = child;
                                    continue;
                                }
                            }
                            Some(seen) => self.revisit(curr, seen),
                        },
                    };
                    slot.holder.write_ref(slot.offset, Some(interned.obj()));
                    self.nodes[curr].points_to_interned_cycle |= is_cycle_member(interned);
                }
                Some(None) => {
                    refs.pop();
                    if self.nodes[curr].lowlink == self.nodes[curr].index {
                        let Some(head) = stack else {
                            unreachable!("component closed with an empty stack")
                        };
                        stack = self.nodes[curr].next;
                        self.nodes[curr].next = None;
                        self.intern_scc(head, curr);
                        debug_assert!(is_fully_interned(self.nodes[curr].interned));
                    }

                    let Some(parent) = self.nodes[curr].prev else {
                        break;
                    };
                    let interned = self.nodes[curr].interned;
                    match refs.last() {
                        Some(Some(slot)) => slot.holder.write_ref(slot.offset, Some(interned.obj())),
                        _ => unreachable!("backtrack without a parent slot"),
                    }
                    let lowlink = self.nodes[curr].lowlink;
                    let parent_node = &mut self.nodes[parent];
                    parent_node.points_to_interned_cycle |= is_cycle_member(interned);
                    parent_node.lowlink = parent_node.lowlink.min(lowlink);
                    curr = parent;
                }
                None => unreachable!("reference stack underflow"),
            }

            // Advance to the next slot.
            refs.pop();
        }

        let mut root_node = root_node;
        if !is_fully_interned(self.nodes[root_node].interned) {
            root_node = self.node_of(self.nodes[root_node].interned);
        }
        let ret = self.nodes[root_node].interned;
        incref(ret);

        // Drop the references held by the nodes and discard the duplicates.
        for (&obj, &idx) in &self.obj_to_node {
            self.table.record_stats(obj);
            let iobj = self.nodes[idx].interned;
            if is_fully_interned(iobj) {
                self.table.decref(iobj);
            } else {
                // SAFETY: a duplicate clone that nothing published refers to.
                unsafe { storage::free(iobj) };
            }
        }

        debug_assert!(is_fully_interned(ret));
        ret
    }

    /// A slot points at an object visited before. Returns what the slot
    /// should hold, noting a back edge if the target is still on the stack.
    fn revisit(&mut self, curr: usize, seen: usize) -> IObjPtr {
        let mut seen = seen;
        if !is_fully_interned(self.nodes[seen].interned) {
            // Follow a possible merge into another node.
            seen = self.node_of(self.nodes[seen].interned);
            if !is_fully_interned(self.nodes[seen].interned) {
                let index = self.nodes[seen].index;
                let node = &mut self.nodes[curr];
                node.lowlink = node.lowlink.min(index);
                node.in_cycle = true;
            }
        }
        self.nodes[seen].interned
    }

    /// Intern the component `head..` whose Tarjan root is `root`.
    fn intern_scc(&mut self, head: usize, root: usize) {
        if self.find_equal_neighbor(head) {
            return;
        }
        let single = self.nodes[head].next.is_none();
        if single && !self.nodes[head].in_cycle {
            debug_assert_eq!(head, root);
            let clone = self.nodes[root].interned;
            let iobj = self.table.intern_with_known_refs(clone.obj());
            if iobj != clone {
                self.clone_to_node.remove(&clone);
            }
            self.nodes[root].interned = iobj;
        } else {
            self.intern_complex_scc(head);
        }
    }

    /// Create a node owning a fresh clone of `obj`.
    fn populate(&mut self, obj: ObjPtr) -> usize {
        let idx = self.nodes.len();
        let clone = storage::shallow_clone(obj);
        clone.set_refcount(BEING_INTERNED);
        self.nodes.push(TarjanNode::new(idx, clone));
        self.obj_to_node.insert(obj, idx);
        self.clone_to_node.insert(clone, idx);
        idx
    }

    /// Create a node for `obj`, already interned as `iobj`.
    fn add_interned(&mut self, obj: ObjPtr, iobj: IObjPtr) {
        let idx = self.nodes.len();
        self.nodes.push(TarjanNode::new(idx, iobj));
        self.obj_to_node.insert(obj, idx);
    }

    fn push_refs(&self, idx: usize, refs: &mut Vec<Option<RefSlot>>) {
        refs.push(None);
        let holder = self.nodes[idx].interned;
        holder.for_each_ref(|offset, target| refs.push(Some(RefSlot { holder, offset, target })));
    }

    /// The node owning a clone that is still being interned.
    #[inline]
    pub(super) fn node_of(&self, clone: IObjPtr) -> usize {
        match self.clone_to_node.get(&clone) {
            Some(&idx) => idx,
            None => unreachable!("{clone:?} has no interning node"),
        }
    }
}
