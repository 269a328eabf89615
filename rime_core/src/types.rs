//! Type descriptors.
//!
//! Every managed object carries a pointer to a [`Type`] in its header. The
//! type tells the arena how large the object is, where its managed
//! references live, and which fast paths the freezer and interner may take.
//!
//! Types are immutable once constructed and must outlive every object that
//! points at them, which in practice means `'static`. The `const fn`
//! constructors allow declaring them as statics:
//!
//! ```ignore
//! static PAIR: Type = Type::class("Pair", 16, &[0, 8]);
//! static BYTES: Type = Type::array("Bytes", 1, &[]);
//! ```

use crate::object::IObjPtr;

/// Size of one reference slot in bytes.
pub const REF_SIZE: usize = std::mem::size_of::<usize>();

/// Shape of a type's instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// Fixed-size record; `user_size` is the instance size.
    Class,
    /// Variable-length array; `user_size` is the element size and the
    /// element count lives in the object header.
    Array,
    /// Internal handle naming an interned strongly connected component.
    CycleHandle,
}

/// Per-type optimization hints.
///
/// Hints are promises made by whoever defines the type; the runtime does
/// not verify them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeHints {
    /// Every reference held by an instance is already frozen.
    pub all_frozen_refs: bool,
    /// Instances never share mutable subobjects, so freezing needs no
    /// copy map.
    pub no_mutable_aliases: bool,
}

/// Lifecycle notification delivered to a type's state-change handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// An interned object has been published in the global table.
    Initialize,
    /// An interned object is about to be released.
    Finalize,
}

/// Handler invoked on interned-object lifecycle transitions.
pub type StateChangeFn = fn(IObjPtr, StateChange);

/// An immutable type descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Type {
    name: &'static str,
    kind: TypeKind,
    user_size: usize,
    ref_offsets: &'static [usize],
    hints: TypeHints,
    state_change: Option<StateChangeFn>,
}

impl Type {
    /// Create a fixed-size class type.
    ///
    /// # Panics
    ///
    /// Panics (at compile time for statics) if a reference offset is not
    /// slot aligned or does not fit inside `user_size`, or if the offsets
    /// are not strictly increasing.
    pub const fn class(name: &'static str, user_size: usize, ref_offsets: &'static [usize]) -> Self {
        validate_offsets(user_size, ref_offsets);
        Self {
            name,
            kind: TypeKind::Class,
            user_size,
            ref_offsets,
            hints: TypeHints {
                all_frozen_refs: false,
                no_mutable_aliases: false,
            },
            state_change: None,
        }
    }

    /// Create an array type with elements of `elem_size` bytes.
    ///
    /// `ref_offsets` are offsets within one element.
    pub const fn array(name: &'static str, elem_size: usize, ref_offsets: &'static [usize]) -> Self {
        assert!(elem_size > 0, "array element size must be non-zero");
        validate_offsets(elem_size, ref_offsets);
        Self {
            name,
            kind: TypeKind::Array,
            user_size: elem_size,
            ref_offsets,
            hints: TypeHints {
                all_frozen_refs: false,
                no_mutable_aliases: false,
            },
            state_change: None,
        }
    }

    /// Create a cycle-handle type. Only the interning engine needs this.
    pub const fn cycle_handle(name: &'static str, user_size: usize, ref_offsets: &'static [usize]) -> Self {
        validate_offsets(user_size, ref_offsets);
        Self {
            name,
            kind: TypeKind::CycleHandle,
            user_size,
            ref_offsets,
            hints: TypeHints {
                all_frozen_refs: false,
                no_mutable_aliases: false,
            },
            state_change: None,
        }
    }

    /// Replace the hints.
    pub const fn with_hints(self, hints: TypeHints) -> Self {
        Self { hints, ..self }
    }

    /// Install a state-change handler.
    pub const fn with_state_change(self, handler: StateChangeFn) -> Self {
        Self {
            state_change: Some(handler),
            ..self
        }
    }

    /// Leak a descriptor built at runtime so objects may point at it.
    pub fn leak(self) -> &'static Type {
        Box::leak(Box::new(self))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Human-readable name, used in stats and diagnostics.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instance shape.
    #[inline]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Instance size for classes, element size for arrays.
    #[inline]
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    /// Reference offsets (per element for arrays).
    #[inline]
    pub fn ref_offsets(&self) -> &'static [usize] {
        self.ref_offsets
    }

    /// Optimization hints.
    #[inline]
    pub fn hints(&self) -> TypeHints {
        self.hints
    }

    /// Lifecycle handler, if any.
    #[inline]
    pub fn state_change(&self) -> Option<StateChangeFn> {
        self.state_change
    }

    /// True for array types.
    #[inline]
    pub fn is_array(&self) -> bool {
        self.kind == TypeKind::Array
    }

    /// True for the interner's cycle-handle type.
    #[inline]
    pub fn is_cycle_handle(&self) -> bool {
        self.kind == TypeKind::CycleHandle
    }

    /// True if instances can hold managed references.
    #[inline]
    pub fn has_refs(&self) -> bool {
        !self.ref_offsets.is_empty()
    }

    /// True if every reference an instance holds is guaranteed frozen.
    #[inline]
    pub fn is_all_frozen_refs(&self) -> bool {
        !self.has_refs() || self.hints.all_frozen_refs
    }

    /// Size in bytes of the user data of an instance with `len` elements.
    ///
    /// `len` is ignored for non-array types. The result is rounded up to
    /// the slot size so that objects stay slot aligned.
    #[inline]
    pub fn user_byte_size(&self, len: usize) -> usize {
        let raw = match self.kind {
            TypeKind::Array => self.user_size * len,
            _ => self.user_size,
        };
        (raw + REF_SIZE - 1) & !(REF_SIZE - 1)
    }

    /// Visit every reference offset of an instance with `len` elements.
    #[inline]
    pub fn for_each_ref_offset(&self, len: usize, mut f: impl FnMut(usize)) {
        self.any_ref_offset(len, |off| {
            f(off);
            false
        });
    }

    /// Visit reference offsets until `f` returns true.
    pub fn any_ref_offset(&self, len: usize, mut f: impl FnMut(usize) -> bool) -> bool {
        if self.ref_offsets.is_empty() {
            return false;
        }
        match self.kind {
            TypeKind::Array => {
                for i in 0..len {
                    let base = i * self.user_size;
                    for &off in self.ref_offsets {
                        if f(base + off) {
                            return true;
                        }
                    }
                }
                false
            }
            _ => self.ref_offsets.iter().any(|&off| f(off)),
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Type {}

const fn validate_offsets(size: usize, offsets: &[usize]) {
    let mut i = 0;
    while i < offsets.len() {
        let off = offsets[i];
        assert!(off % REF_SIZE == 0, "reference offset must be slot aligned");
        assert!(off + REF_SIZE <= size, "reference offset out of bounds");
        assert!(i == 0 || offsets[i - 1] < off, "reference offsets must be strictly increasing");
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PAIR: Type = Type::class("Pair", 24, &[0, 16]);
    static REFS: Type = Type::array("Refs", 8, &[0]);
    static BYTES: Type = Type::array("Bytes", 1, &[]);

    #[test]
    fn test_class_sizes() {
        assert_eq!(PAIR.user_byte_size(0), 24);
        assert_eq!(PAIR.user_byte_size(100), 24);
        assert!(PAIR.has_refs());
        assert!(!PAIR.is_array());
    }

    #[test]
    fn test_array_sizes_round_up() {
        assert_eq!(BYTES.user_byte_size(0), 0);
        assert_eq!(BYTES.user_byte_size(1), 8);
        assert_eq!(BYTES.user_byte_size(9), 16);
        assert_eq!(REFS.user_byte_size(3), 24);
    }

    #[test]
    fn test_ref_offsets_for_arrays() {
        let mut seen = Vec::new();
        REFS.for_each_ref_offset(3, |off| seen.push(off));
        assert_eq!(seen, vec![0, 8, 16]);

        let mut none = Vec::new();
        BYTES.for_each_ref_offset(10, |off| none.push(off));
        assert!(none.is_empty());
    }

    #[test]
    fn test_any_ref_offset_stops_early() {
        let mut visited = 0;
        let hit = PAIR.any_ref_offset(0, |off| {
            visited += 1;
            off == 0
        });
        assert!(hit);
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_all_frozen_refs() {
        assert!(BYTES.is_all_frozen_refs());
        assert!(!PAIR.is_all_frozen_refs());
        let hinted = PAIR.with_hints(TypeHints {
            all_frozen_refs: true,
            no_mutable_aliases: false,
        });
        assert!(hinted.is_all_frozen_refs());
    }

    #[test]
    fn test_identity_equality() {
        let a = Type::class("A", 8, &[]).leak();
        let b = Type::class("A", 8, &[]).leak();
        assert_eq!(a, a);
        assert_ne!(a, b);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_rejects_out_of_bounds_offset() {
        let _ = Type::class("Bad", 8, &[8]);
    }
}
