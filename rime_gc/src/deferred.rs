//! Deferred reclamation.
//!
//! Releasing an interned object can cascade through arbitrarily many other
//! objects. While the current worker holds any lock that work is postponed
//! and queued on a [`WorkCoordinator`], then drained explicitly once no
//! locks are held.
//!
//! ```text
//!   note_locked() ──► depth 1 ──► queue_decref(obj) ──► pending
//!   drop(token)   ──► depth 0 ──► pending decrefs run
//!   run_pending() ──► remaining decrefs run, invalidations returned
//! ```

use crate::intern::InternTable;
use parking_lot::Mutex;
use rime_core::IObjPtr;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An invalidation to deliver to the memoization layer.
///
/// The core never inspects edges; they are produced and consumed by the
/// layer above and only pass through the coordinator's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvalidationEdge {
    /// Opaque identifier of the invalidated target.
    pub target: u64,
    /// Input slot of the target that became stale.
    pub index: u32,
}

/// Collaborator that decides when reclamation may run.
pub trait WorkCoordinator: Send + Sync + fmt::Debug {
    /// True if reclamation must be postponed right now.
    fn defer_work(&self) -> bool;

    /// Queue a decref of `obj` in `table`.
    fn queue_decref(&self, table: Arc<InternTable>, obj: IObjPtr);

    /// Queue an invalidation for the memoization layer.
    fn queue_invalidation(&self, edge: InvalidationEdge);
}

/// Decref `obj` now, or queue it if `coordinator` is deferring work.
pub fn safe_decref(coordinator: &dyn WorkCoordinator, table: &Arc<InternTable>, obj: IObjPtr) {
    if coordinator.defer_work() {
        coordinator.queue_decref(Arc::clone(table), obj);
    } else {
        table.decref(obj);
    }
}

#[derive(Default)]
struct Pending {
    decrefs: Vec<(Arc<InternTable>, IObjPtr)>,
    invalidations: Vec<InvalidationEdge>,
}

/// Coordinator that defers work while any lock is noted as held.
///
/// One coordinator is meant to be shared by everything one worker owns.
#[derive(Default)]
pub struct LockCoordinator {
    locks_held: AtomicUsize,
    pending: Mutex<Pending>,
}

impl LockCoordinator {
    /// Create a coordinator with no locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a lock was taken. Dropping the token records the unlock
    /// and drains queued decrefs if it was the last lock.
    pub fn note_locked(&self) -> LockToken<'_> {
        self.locks_held.fetch_add(1, Ordering::AcqRel);
        LockToken { coordinator: self }
    }

    /// Number of locks currently held.
    pub fn locks_held(&self) -> usize {
        self.locks_held.load(Ordering::Acquire)
    }

    /// Number of queued decrefs.
    pub fn pending_decrefs(&self) -> usize {
        self.pending.lock().decrefs.len()
    }

    /// Number of queued invalidations.
    pub fn pending_invalidations(&self) -> usize {
        self.pending.lock().invalidations.len()
    }

    /// Run queued decrefs and hand back queued invalidations.
    ///
    /// Does nothing while a lock is held.
    pub fn run_pending(&self) -> Vec<InvalidationEdge> {
        if self.defer_work() {
            return Vec::new();
        }
        self.drain_decrefs();
        std::mem::take(&mut self.pending.lock().invalidations)
    }

    fn drain_decrefs(&self) {
        // Pop one at a time so the queue lock is never held across a decref.
        loop {
            let next = self.pending.lock().decrefs.pop();
            match next {
                Some((table, obj)) => table.decref(obj),
                None => break,
            }
        }
        let mut pending = self.pending.lock();
        pending.decrefs.shrink_to(64);
    }

    fn note_unlocked(&self) {
        let prev = self.locks_held.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unlock without lock");
        if prev == 1 {
            self.drain_decrefs();
        }
    }
}

impl WorkCoordinator for LockCoordinator {
    fn defer_work(&self) -> bool {
        self.locks_held() != 0
    }

    fn queue_decref(&self, table: Arc<InternTable>, obj: IObjPtr) {
        self.pending.lock().decrefs.push((table, obj));
    }

    fn queue_invalidation(&self, edge: InvalidationEdge) {
        self.pending.lock().invalidations.push(edge);
    }
}

impl fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("LockCoordinator")
            .field("locks_held", &self.locks_held())
            .field("pending_decrefs", &pending.decrefs.len())
            .field("pending_invalidations", &pending.invalidations.len())
            .finish()
    }
}

/// RAII record of one held lock.
#[must_use = "dropping the token immediately records the unlock"]
pub struct LockToken<'a> {
    coordinator: &'a LockCoordinator,
}

impl Drop for LockToken<'_> {
    fn drop(&mut self) {
        self.coordinator.note_unlocked();
    }
}
