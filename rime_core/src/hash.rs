//! Hashing helpers shared by the interner and deep comparison.

use crate::object::ObjPtr;
use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Mix `value` into `seed`.
#[inline]
pub fn hash_combine(seed: u64, value: u64) -> u64 {
    seed ^ value
        .wrapping_add(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2)
}

/// Hash a byte slice, starting from `seed`.
#[inline]
pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(bytes);
    hasher.finish()
}

/// Hash an object's type, length and raw user bytes.
///
/// Reference slots are hashed as whatever addresses they currently hold,
/// so callers must canonicalize them first for the result to be stable.
pub fn raw_object_hash(obj: ObjPtr) -> u64 {
    let ty = obj.ty();
    let mut seed = ty as *const _ as usize as u64;
    if ty.is_array() {
        seed = hash_combine(seed, obj.len() as u64);
    }
    // SAFETY: the caller holds the object alive for the duration.
    hash_bytes(seed, unsafe { obj.user_bytes() })
}
