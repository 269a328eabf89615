//! Interning Engine
//!
//! Turns a freshly allocated object graph, cycles included, into its
//! unique canonical, immutable and reference-counted representative.
//!
//! # Paths
//!
//! - **Fast path**: an object whose references all target definitely
//!   acyclic interned objects is hashed as raw bytes and looked up
//!   directly. Most allocations take this path.
//!
//! - **General path**: the graph is split into strongly connected
//!   components with an iterative Tarjan walk. Single acyclic nodes take the fast path once
//!   their children are final. True cycles are deduplicated, given a root
//!   that does not depend on the entry point, and published through one
//!   [`CycleHandle`](CYCLE_HANDLE) that owns the refcount of all members.
//!
//! # Equality
//!
//! Two graphs intern to the same object iff they are isomorphic, i.e.
//! [`deep_equal`]. Object identity inside the input never matters.
//!
//! # Release
//!
//! [`InternTable::decref`] cascades: an object reaching zero drops its own
//! references, and a cycle handle reaching zero takes all members with it.
//!
//! # Usage
//!
//! ```ignore
//! let table = InternTable::global();
//! let iobj = table.intern(obj);
//! assert_eq!(table.intern(copy_of_obj), iobj);
//! table.decref(iobj);
//! table.decref(iobj);
//! ```

mod compare;
pub mod cycle_handle;
pub mod refcount;
mod scc;
mod stats;
pub(crate) mod storage;
mod table;
mod tarjan;

pub use compare::{deep_compare, deep_equal};
pub use cycle_handle::CYCLE_HANDLE;
pub use stats::TypeStats;
pub use table::InternTable;
