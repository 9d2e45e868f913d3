// SPDX-License-Identifier: MIT OR Apache-2.0
//! Order-sensitive Merkle root over canonical leaf hashes.

use crate::{CanonicalError, hash_bytes, hash_canonical};
use serde::Serialize;

/// Compute the Merkle root of a sequence of values.
///
/// Each leaf is hashed through the canonical serializer, then pairs are
/// combined level by level; an odd trailing leaf is duplicated. The root is
/// order-sensitive: permuting leaves changes it.
///
/// An empty sequence yields the hash of the empty byte string.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if any leaf cannot be serialized.
pub fn merkle_root<T: Serialize>(leaves: &[T]) -> Result<String, CanonicalError> {
    let hashes = leaves
        .iter()
        .map(hash_canonical)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(merkle_root_hex(&hashes))
}

/// Compute the Merkle root over pre-hashed hex leaves.
///
/// Combination hashes the UTF-8 concatenation of the two child hex digests.
#[must_use]
pub fn merkle_root_hex(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return hash_bytes(b"");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut combined = String::with_capacity(left.len() + right.len());
            combined.push_str(left);
            combined.push_str(right);
            next.push(hash_bytes(combined.as_bytes()));
        }
        level = next;
    }
    level.pop().expect("non-empty level")
}
