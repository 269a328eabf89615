//! Slab allocation and the process-wide memory-kind registry.
//!
//! Chunks are carved out of 2 MiB slabs aligned to their own size, so the
//! slab owning any chunk address is found by masking. Every live slab is
//! recorded in a registry so that an arbitrary address can be classified
//! without touching the memory it points at.

use dashmap::DashMap;
use rime_core::MemoryKind;
use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;
use std::sync::LazyLock;

/// Size and alignment of one slab.
pub const SLAB_SIZE: usize = 2 * 1024 * 1024;

static REGISTRY: LazyLock<DashMap<usize, MemoryKind>> = LazyLock::new(DashMap::new);

#[inline]
fn slab_layout() -> Layout {
    // SLAB_SIZE is a non-zero power of two.
    match Layout::from_size_align(SLAB_SIZE, SLAB_SIZE) {
        Ok(layout) => layout,
        Err(_) => unreachable!("invalid slab layout"),
    }
}

/// Allocate and register a slab. Aborts on allocation failure.
pub(crate) fn alloc_slab() -> NonNull<u8> {
    let layout = slab_layout();
    // SAFETY: the layout has non-zero size.
    let raw = unsafe { alloc(layout) };
    let Some(slab) = NonNull::new(raw) else {
        handle_alloc_error(layout)
    };
    REGISTRY.insert(slab.as_ptr() as usize, MemoryKind::Arena);
    tracing::trace!(target: "rime_gc::page", slab = ?slab, "slab allocated");
    slab
}

/// Unregister and release a slab.
///
/// # Safety
///
/// `slab` must come from [`alloc_slab`] and hold no live chunks.
pub(crate) unsafe fn free_slab(slab: NonNull<u8>) {
    REGISTRY.remove(&(slab.as_ptr() as usize));
    tracing::trace!(target: "rime_gc::page", slab = ?slab, "slab freed");
    // SAFETY: allocated with the same layout in alloc_slab.
    unsafe { dealloc(slab.as_ptr(), slab_layout()) }
}

/// Base address of the slab that would contain `addr`.
#[inline]
pub fn slab_base(addr: usize) -> usize {
    addr & !(SLAB_SIZE - 1)
}

/// Classify an address by the slab registry.
///
/// Only chunk memory is registered; large and interned objects are
/// classified through their object headers instead.
pub fn memory_kind_of(addr: usize) -> MemoryKind {
    REGISTRY
        .get(&slab_base(addr))
        .map_or(MemoryKind::Unknown, |kind| *kind)
}
