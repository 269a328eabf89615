//! Rime Memory System
//!
//! Memory management for a runtime whose computations are scoped: each one
//! allocates into its own arena, keeps a small part of what it built and
//! publishes immutable results through a process-wide intern table.
//!
//! # Architecture
//!
//! - **Arena**: bump allocation through a chain of pooled chunks. Positions
//!   in an arena are totally ordered, and a [`Note`] checkpoints the
//!   cursor.
//!
//! - **Collector**: copying collection relative to a note. Everything
//!   allocated after the note that the roots and handles do not reach is
//!   reclaimed; everything older is left untouched.
//!
//! - **Freezer**: deep-copies a mutable graph into an immutable one,
//!   sharing what is already frozen.
//!
//! - **Interning Engine**: maps any frozen or fresh graph, cycles
//!   included, to its unique canonical representative with a shared
//!   reference count.
//!
//! - **Deferred work**: decrefs requested while a [`WorkCoordinator`]
//!   holds locks are queued and replayed once the last lock is released.
//!
//! # Usage
//!
//! ```ignore
//! use rime_gc::Arena;
//!
//! let mut arena = Arena::new();
//! let note = arena.note();
//! let obj = build(&mut arena);
//! let shared = arena.intern(obj);
//! let mut roots = [obj];
//! arena.collect(note, &mut roots);
//! ```
//!
//! # Safety
//!
//! Objects are raw pointers into arena memory. Callers must:
//! - Pass every live pointer into a collection as a root or hold it
//!   through a [`Handle`]
//! - Never use a pointer into an arena after the arena is dropped
//! - Never mutate a frozen or interned object

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod deferred;
pub mod heap;
pub mod intern;
pub mod roots;

mod freeze;
mod stats;
mod steal;

// Re-exports for convenient access
pub use collector::CollectMode;
pub use config::{ConfigError, GcConfig};
pub use deferred::{InvalidationEdge, LockCoordinator, LockToken, WorkCoordinator, safe_decref};
pub use heap::{Arena, CHUNK_CAPACITY, CHUNK_SIZE, LARGE_ALLOC_SIZE, Note, Pos};
pub use intern::{CYCLE_HANDLE, InternTable, TypeStats, deep_compare, deep_equal};
pub use roots::{Handle, Process};
pub use stats::AllocStats;
