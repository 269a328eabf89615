//! External roots.
//!
//! A [`Handle`] lets code outside the arena hold on to an object across
//! collections. The arena keeps a weak list of its handles and rewrites
//! their targets whenever it moves the objects they point at.

use super::Process;
use parking_lot::Mutex;
use rime_core::ObjPtr;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A root registered with an arena.
///
/// Dropping the last `Arc<Handle>` unregisters it; the arena prunes dead
/// entries lazily.
///
/// # Example
///
/// ```ignore
/// let handle = arena.make_handle(obj);
/// arena.collect(note, &mut []);
/// let moved = handle.get(); // still live, possibly relocated
/// ```
pub struct Handle {
    target: AtomicPtr<u8>,
    /// Held only while the owner is swapped.
    owner: Mutex<Arc<Process>>,
}

impl Handle {
    pub(crate) fn new(target: Option<ObjPtr>, owner: Arc<Process>) -> Self {
        Self {
            target: AtomicPtr::new(target.map_or(std::ptr::null_mut(), ObjPtr::as_ptr)),
            owner: Mutex::new(owner),
        }
    }

    /// The current target.
    #[inline]
    pub fn get(&self) -> Option<ObjPtr> {
        // SAFETY: only object pointers or null are ever stored.
        unsafe { ObjPtr::from_raw_opt(self.target.load(Ordering::Acquire)) }
    }

    #[inline]
    pub(crate) fn set(&self, target: Option<ObjPtr>) {
        let raw = target.map_or(std::ptr::null_mut(), ObjPtr::as_ptr);
        self.target.store(raw, Ordering::Release);
    }

    /// The process currently owning the handle.
    pub fn owner(&self) -> Arc<Process> {
        Arc::clone(&self.owner.lock())
    }

    /// True if `process` owns the handle.
    pub fn is_owned_by(&self, process: &Arc<Process>) -> bool {
        Arc::ptr_eq(&self.owner.lock(), process)
    }

    /// Move the handle to `dest`.
    ///
    /// The previous owner is released after the lock is dropped, so a
    /// final `Process` drop never runs under it.
    pub(crate) fn transfer_to(&self, dest: &Arc<Process>) {
        let mut owner = Arc::clone(dest);
        {
            let mut guard = self.owner.lock();
            std::mem::swap(&mut *guard, &mut owner);
        }
        drop(owner);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("target", &self.get())
            .field("owner", &self.owner.lock().id())
            .finish()
    }
}
