//! Root tracking and ownership.
//!
//! Collections trace from two kinds of roots:
//! - Explicit root slots passed to `collect`
//! - [`Handle`]s registered with the arena
//!
//! Every arena belongs to a [`Process`], the unit of ownership that a
//! handle follows when its arena is stolen into a parent.

mod handles;

pub use handles::Handle;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one owner of arenas and handles.
#[derive(Debug)]
pub struct Process {
    id: u64,
}

impl Process {
    /// Create a process with a fresh identifier.
    pub fn new() -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Unique identifier.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}
