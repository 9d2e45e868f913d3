// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Canonical JSON serialization, SHA-256 fingerprinting, and Merkle roots."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Single source of truth for every hash in Reach.
//!
//! The canonical form is compact UTF-8 JSON with mapping keys sorted
//! recursively by Unicode code point. Sequences keep their order. Numbers
//! render through `serde_json`'s shortest-roundtrip formatter, which is
//! bit-identical across platforms for the finite range Reach uses.
//! Non-finite floats never reach a hash: they are rejected at the
//! [`fixed_float`] gate with a serialization error.

mod canonical;
mod merkle;

pub use canonical::{canonical_bytes, canonical_string, fixed_float};
pub use merkle::{merkle_root, merkle_root_hex};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Algorithm tag embedded in every transcript that carries a hash.
///
/// A bump is required on any change to the algorithm, the input set, the
/// serialization, or the key ordering.
pub const HASH_ALG: &str = "sha256-cjson-v1";

/// Errors from canonical serialization.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// A float was not finite (`NaN` or infinity).
    #[error("non-finite float cannot be canonicalized")]
    NonFiniteFloat,

    /// The value could not be serialized to JSON.
    #[error("canonical serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Compute the hex-encoded SHA-256 of raw bytes.
///
/// # Examples
///
/// ```
/// let h = reach_hash::hash_bytes(b"");
/// assert_eq!(
///     h,
///     "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
/// );
/// ```
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the hex-encoded SHA-256 of a value's canonical JSON form.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if the value cannot be serialized.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let a = reach_hash::hash_canonical(&json!({"a": 1, "b": 2})).unwrap();
/// let b = reach_hash::hash_canonical(&json!({"b": 2, "a": 1})).unwrap();
/// assert_eq!(a, b);
/// ```
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(hash_bytes(&canonical_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Golden vectors pinned to sha256-cjson-v1. Changing any of these means
    // the hash version must bump and downstream fixtures are invalid.
    #[test]
    fn golden_object_hash() {
        let v = json!({"environment": "production", "action": "deploy"});
        assert_eq!(
            hash_canonical(&v).unwrap(),
            "165b836d9d6e803d5ce1bb8b7a01437ff68928f549887360cf13a0d551a66e85"
        );
    }

    #[test]
    fn golden_empty_object_hash() {
        assert_eq!(
            hash_canonical(&json!({})).unwrap(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn golden_nested_object_hash() {
        let v = json!({"b": 2, "c": {"z": 26, "a": 1}, "a": 1});
        assert_eq!(
            hash_canonical(&v).unwrap(),
            "24e4db09ae0e40a93e391725f9290725f3a8ffd15d33ed0bb39c394319087492"
        );
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"x": [1, 2, 3], "y": {"k": "v", "a": null}});
        let b = json!({"y": {"a": null, "k": "v"}, "x": [1, 2, 3]});
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn sequences_preserve_order() {
        let a = json!([1, 2]);
        let b = json!([2, 1]);
        assert_ne!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn alg_tag_is_pinned() {
        assert_eq!(HASH_ALG, "sha256-cjson-v1");
    }
}
