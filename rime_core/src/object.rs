//! Object layout and pointer types.
//!
//! Every managed object is laid out as a header followed by user data:
//!
//! ```text
//!              uninterned                          interned
//!   ┌──────────────────────────┐      ┌──────────────────────────┐
//!   │                          │      │ InternHeader (16 bytes)  │
//!   │                          │      │  next | refcount         │
//!   ├──────────────────────────┤      ├──────────────────────────┤
//!   │ ObjectHeader (16 bytes)  │      │ ObjectHeader (16 bytes)  │
//!   │  type/forward | len |    │      │  type | len | kind |     │
//!   │  kind | flags            │      │  flags                   │
//!   ├──────────────────────────┤ ◄─── ├──────────────────────────┤ ◄─── ObjPtr
//!   │ user data                │      │ user data                │
//!   └──────────────────────────┘      └──────────────────────────┘
//! ```
//!
//! [`ObjPtr`] always points at the first byte of user data so that
//! reference slots can be stored and compared without adjustment.

use crate::types::{REF_SIZE, Type};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Alignment of every managed allocation.
pub const ALLOC_ALIGN: usize = 8;

/// Round `size` up to [`ALLOC_ALIGN`].
#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Where an object's storage came from.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Not produced by a rime allocator.
    Unknown = 0,
    /// Bump-allocated inside an arena chunk.
    Arena = 1,
    /// Individually allocated large object owned by an arena.
    Large = 2,
    /// Individually allocated interned object owned by the global table.
    Interned = 3,
}

impl MemoryKind {
    #[inline]
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => MemoryKind::Arena,
            2 => MemoryKind::Large,
            3 => MemoryKind::Interned,
            _ => MemoryKind::Unknown,
        }
    }
}

const FLAG_FROZEN: u8 = 1;
const FLAG_FORWARDED: u8 = 2;

/// Per-object header preceding user data.
#[repr(C)]
#[derive(Debug)]
pub struct ObjectHeader {
    /// Address of the object's [`Type`], or of the new location once
    /// the object has been forwarded by the collector.
    tag: usize,
    /// Element count for arrays, zero otherwise.
    len: u32,
    kind: u8,
    flags: u8,
    _reserved: u16,
}

/// Size of [`ObjectHeader`].
pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    /// Build a header for a freshly allocated object.
    #[inline]
    pub fn new(ty: &'static Type, len: u32, kind: MemoryKind) -> Self {
        Self {
            tag: ty as *const Type as usize,
            len,
            kind: kind as u8,
            flags: 0,
            _reserved: 0,
        }
    }
}

/// Extra header present only on interned objects.
#[repr(C)]
#[derive(Debug, Default)]
pub struct InternHeader {
    /// Cycle handle of a cycle member, zero otherwise.
    pub next: AtomicUsize,
    /// Reference count or one of the reserved sentinel values.
    pub refcount: AtomicU32,
    _reserved: u32,
}

/// Size of [`InternHeader`].
pub const INTERN_HEADER_SIZE: usize = std::mem::size_of::<InternHeader>();

const _: () = assert!(OBJECT_HEADER_SIZE == 16);
const _: () = assert!(INTERN_HEADER_SIZE == 16);

// =============================================================================
// ObjPtr
// =============================================================================

/// Untyped pointer to a managed object's user data.
///
/// `ObjPtr` is a plain pointer: it does not keep the object alive. Holders
/// must pass it as a root to any collection that could move or free it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjPtr(NonNull<u8>);

impl ObjPtr {
    /// Wrap a pointer to user data.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the user data of a live object whose header was
    /// initialized by a rime allocator.
    #[inline]
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        // SAFETY: callers pass a non-null object pointer.
        Self(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Wrap a possibly-null pointer.
    ///
    /// # Safety
    ///
    /// If non-null, same as [`ObjPtr::from_raw`].
    #[inline]
    pub unsafe fn from_raw_opt(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Initialize a header at `start` and return the object pointer after it.
    ///
    /// # Safety
    ///
    /// `start` must be 8-aligned and valid for writes of the header plus
    /// the user size of `ty` with `len` elements.
    #[inline]
    pub unsafe fn init_at(start: *mut u8, ty: &'static Type, len: u32, kind: MemoryKind) -> Self {
        unsafe {
            (start as *mut ObjectHeader).write(ObjectHeader::new(ty, len, kind));
            Self::from_raw(start.add(OBJECT_HEADER_SIZE))
        }
    }

    /// Raw user-data pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// User-data address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn header_ptr(self) -> *mut ObjectHeader {
        // SAFETY: every ObjPtr is preceded by its header.
        unsafe { self.0.as_ptr().sub(OBJECT_HEADER_SIZE) as *mut ObjectHeader }
    }

    /// Object header.
    #[inline]
    pub fn header(&self) -> &ObjectHeader {
        // SAFETY: the header lives as long as the object.
        unsafe { &*self.header_ptr() }
    }

    /// The object's type. Must not be called on forwarded objects.
    #[inline]
    pub fn ty(self) -> &'static Type {
        debug_assert!(!self.is_forwarded(), "type of forwarded object");
        // SAFETY: the tag of an unforwarded object is a 'static Type.
        unsafe { &*(self.header().tag as *const Type) }
    }

    /// Storage kind recorded at allocation time.
    #[inline]
    pub fn kind(self) -> MemoryKind {
        MemoryKind::from_u8(self.header().kind)
    }

    /// Overwrite the storage kind.
    #[inline]
    pub fn set_kind(self, kind: MemoryKind) {
        // SAFETY: header writes are confined to the owning thread.
        unsafe { (*self.header_ptr()).kind = kind as u8 }
    }

    /// Element count for arrays, zero otherwise.
    #[inline]
    pub fn len(self) -> usize {
        self.header().len as usize
    }

    /// True if the object has zero elements.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// True once the object has been frozen or interned.
    #[inline]
    pub fn is_frozen(self) -> bool {
        self.header().flags & FLAG_FROZEN != 0
    }

    /// Mark the object frozen.
    #[inline]
    pub fn set_frozen(self) {
        // SAFETY: see set_kind.
        unsafe { (*self.header_ptr()).flags |= FLAG_FROZEN }
    }

    /// True if the collector has moved this object.
    #[inline]
    pub fn is_forwarded(self) -> bool {
        self.header().flags & FLAG_FORWARDED != 0
    }

    /// The new location of a forwarded object.
    #[inline]
    pub fn forwarded(self) -> Option<ObjPtr> {
        if self.is_forwarded() {
            // SAFETY: forwarding tags hold a valid object address.
            Some(unsafe { ObjPtr::from_raw(self.header().tag as *mut u8) })
        } else {
            None
        }
    }

    /// Record that the object now lives at `to`.
    #[inline]
    pub fn set_forwarded(self, to: ObjPtr) {
        // SAFETY: see set_kind.
        unsafe {
            let header = &mut *self.header_ptr();
            header.tag = to.addr();
            header.flags |= FLAG_FORWARDED;
        }
    }

    /// Size of the user data in bytes.
    #[inline]
    pub fn user_size(self) -> usize {
        self.ty().user_byte_size(self.len())
    }

    /// Size of the metadata preceding user data.
    #[inline]
    pub fn metadata_size(self) -> usize {
        if self.kind() == MemoryKind::Interned {
            INTERN_HEADER_SIZE + OBJECT_HEADER_SIZE
        } else {
            OBJECT_HEADER_SIZE
        }
    }

    /// Total footprint: metadata plus user data.
    #[inline]
    pub fn total_size(self) -> usize {
        self.metadata_size() + self.user_size()
    }

    /// Address of the first metadata byte.
    #[inline]
    pub fn start(self) -> *mut u8 {
        // SAFETY: metadata precedes user data within the same allocation.
        unsafe { self.as_ptr().sub(self.metadata_size()) }
    }

    /// Borrow the user data as bytes.
    ///
    /// # Safety
    ///
    /// The object must stay alive and unmodified for `'a`.
    #[inline]
    pub unsafe fn user_bytes<'a>(self) -> &'a [u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.user_size()) }
    }

    // =========================================================================
    // Reference slots
    // =========================================================================

    /// Read the reference stored at byte offset `off`.
    #[inline]
    pub fn read_ref(self, off: usize) -> Option<ObjPtr> {
        debug_assert!(off + REF_SIZE <= self.user_size());
        // SAFETY: offsets come from the type and lie inside user data.
        unsafe { ObjPtr::from_raw_opt(*(self.as_ptr().add(off) as *const *mut u8)) }
    }

    /// Store a reference at byte offset `off`.
    #[inline]
    pub fn write_ref(self, off: usize, value: Option<ObjPtr>) {
        debug_assert!(off + REF_SIZE <= self.user_size());
        let raw = value.map_or(std::ptr::null_mut(), ObjPtr::as_ptr);
        // SAFETY: see read_ref.
        unsafe { *(self.as_ptr().add(off) as *mut *mut u8) = raw }
    }

    /// Visit every non-null reference with its offset.
    #[inline]
    pub fn for_each_ref(self, mut f: impl FnMut(usize, ObjPtr)) {
        let ty = self.ty();
        ty.for_each_ref_offset(self.len(), |off| {
            if let Some(target) = self.read_ref(off) {
                f(off, target);
            }
        });
    }

    /// Visit every reference slot, including null ones.
    #[inline]
    pub fn for_each_ref_slot(self, mut f: impl FnMut(usize, Option<ObjPtr>)) {
        let ty = self.ty();
        ty.for_each_ref_offset(self.len(), |off| f(off, self.read_ref(off)));
    }

    /// True if `f` holds for some non-null reference.
    #[inline]
    pub fn any_ref(self, mut f: impl FnMut(usize, ObjPtr) -> bool) -> bool {
        let ty = self.ty();
        ty.any_ref_offset(self.len(), |off| self.read_ref(off).is_some_and(|t| f(off, t)))
    }

    // =========================================================================
    // Scalar access
    // =========================================================================

    /// Read a `u64` at byte offset `off`.
    #[inline]
    pub fn read_u64(self, off: usize) -> u64 {
        debug_assert!(off + 8 <= self.user_size());
        // SAFETY: in bounds and 8-aligned.
        unsafe { *(self.as_ptr().add(off) as *const u64) }
    }

    /// Write a `u64` at byte offset `off`.
    #[inline]
    pub fn write_u64(self, off: usize, value: u64) {
        debug_assert!(!self.is_frozen(), "write to frozen object");
        debug_assert!(off + 8 <= self.user_size());
        // SAFETY: in bounds and 8-aligned.
        unsafe { *(self.as_ptr().add(off) as *mut u64) = value }
    }

    /// Read byte `idx` of the user data.
    #[inline]
    pub fn read_byte(self, idx: usize) -> u8 {
        debug_assert!(idx < self.user_size());
        // SAFETY: in bounds.
        unsafe { *self.as_ptr().add(idx) }
    }

    /// Write byte `idx` of the user data.
    #[inline]
    pub fn write_byte(self, idx: usize, value: u8) {
        debug_assert!(!self.is_frozen(), "write to frozen object");
        debug_assert!(idx < self.user_size());
        // SAFETY: in bounds.
        unsafe { *self.as_ptr().add(idx) = value }
    }

    /// View as an interned object, if it is one.
    #[inline]
    pub fn as_interned(self) -> Option<IObjPtr> {
        (self.kind() == MemoryKind::Interned).then_some(IObjPtr(self))
    }
}

impl fmt::Debug for ObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjPtr({:p})", self.0)
    }
}

// =============================================================================
// IObjPtr
// =============================================================================

/// Pointer to an interned object.
///
/// Interned objects are immutable and owned by the global intern table, so
/// unlike [`ObjPtr`] they may be shared across threads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct IObjPtr(ObjPtr);

// Safety: interned objects are immutable apart from their atomic
// InternHeader fields.
unsafe impl Send for IObjPtr {}
unsafe impl Sync for IObjPtr {}

impl IObjPtr {
    /// Wrap an object pointer known to be interned.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated with an [`InternHeader`].
    #[inline]
    pub unsafe fn from_obj(obj: ObjPtr) -> Self {
        Self(obj)
    }

    /// The plain object pointer.
    #[inline]
    pub fn obj(self) -> ObjPtr {
        self.0
    }

    #[inline]
    fn intern_header(&self) -> &InternHeader {
        // SAFETY: interned objects carry the extra header before ObjectHeader.
        unsafe { &*(self.0.as_ptr().sub(OBJECT_HEADER_SIZE + INTERN_HEADER_SIZE) as *const InternHeader) }
    }

    /// Current reference count or sentinel.
    #[inline]
    pub fn refcount(self) -> u32 {
        self.intern_header().refcount.load(Ordering::Acquire)
    }

    /// Replace the reference count.
    #[inline]
    pub fn set_refcount(self, value: u32) {
        self.intern_header().refcount.store(value, Ordering::Release)
    }

    /// Atomic access to the reference count.
    #[inline]
    pub fn refcount_cell(&self) -> &AtomicU32 {
        &self.intern_header().refcount
    }

    /// The cycle handle, for cycle members.
    #[inline]
    pub fn next(self) -> Option<IObjPtr> {
        let raw = self.intern_header().next.load(Ordering::Acquire);
        // SAFETY: only interned object addresses are ever stored.
        unsafe { ObjPtr::from_raw_opt(raw as *mut u8) }.map(IObjPtr)
    }

    /// Set the cycle handle.
    #[inline]
    pub fn set_next(self, next: Option<IObjPtr>) {
        let raw = next.map_or(0, |n| n.addr());
        self.intern_header().next.store(raw, Ordering::Release)
    }
}

impl Deref for IObjPtr {
    type Target = ObjPtr;

    #[inline]
    fn deref(&self) -> &ObjPtr {
        &self.0
    }
}

impl From<IObjPtr> for ObjPtr {
    #[inline]
    fn from(value: IObjPtr) -> Self {
        value.0
    }
}

impl fmt::Debug for IObjPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IObjPtr({:p})", self.0.as_ptr())
    }
}
