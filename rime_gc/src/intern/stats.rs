//! Per-type interning counters.

use rime_core::ObjPtr;
use rustc_hash::FxHashMap;

/// Objects and bytes submitted for interning, for one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStats {
    /// Type name.
    pub name: &'static str,
    /// Objects submitted.
    pub count: u64,
    /// User bytes submitted.
    pub bytes: u64,
}

/// Counters keyed by type identity.
#[derive(Debug, Default)]
pub(crate) struct InternStats {
    by_type: FxHashMap<usize, TypeStats>,
}

impl InternStats {
    pub(crate) fn accrue(&mut self, obj: ObjPtr) {
        let ty = obj.ty();
        let entry = self.by_type.entry(ty as *const _ as usize).or_insert(TypeStats {
            name: ty.name(),
            count: 0,
            bytes: 0,
        });
        entry.count += 1;
        entry.bytes += obj.user_size() as u64;
    }

    /// Snapshot, largest first by count or by bytes.
    pub(crate) fn sorted(&self, by_count: bool) -> Vec<TypeStats> {
        let mut all: Vec<_> = self.by_type.values().cloned().collect();
        if by_count {
            all.sort_by(|a, b| b.count.cmp(&a.count).then(a.name.cmp(b.name)));
        } else {
            all.sort_by(|a, b| b.bytes.cmp(&a.bytes).then(a.name.cmp(b.name)));
        }
        all
    }
}
