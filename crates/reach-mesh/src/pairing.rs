// SPDX-License-Identifier: MIT OR Apache-2.0
//! Short-lived pairing codes and their QR-equivalent payloads.

use crate::features::FeatureFlags;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Alphabet for pairing codes; ambiguous glyphs (0/O, 1/I/L) are omitted.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// What a pairing code resolves to, carried either as raw JSON or inside a
/// QR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingPayload {
    /// The publishing node.
    pub node_id: String,
    /// Hex-encoded public key of the publishing node.
    pub public_key: String,
    /// Reachable endpoints, in preference order.
    pub endpoints: Vec<String>,
    /// Feature flags the publisher is running with.
    pub features: FeatureFlags,
    /// The short code mapped to this payload.
    pub code: String,
    /// When the code stops redeeming.
    pub expires_at: DateTime<Utc>,
    /// Payload format version.
    pub version: u32,
}

/// Generate a pairing code of the given length (6–8 characters).
#[must_use]
pub fn generate_pairing_code(rng: &mut impl Rng, len: usize) -> String {
    let len = len.clamp(6, 8);
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Server-side map of outstanding pairing codes.
///
/// Codes are one-shot: redeeming removes the mapping.
#[derive(Default)]
pub struct PairingBook {
    codes: Mutex<BTreeMap<String, PairingPayload>>,
}

impl PairingBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload under its code.
    pub fn publish(&self, payload: PairingPayload) {
        let mut codes = self.codes.lock().expect("pairing book lock poisoned");
        codes.insert(payload.code.clone(), payload);
    }

    /// Redeem a code. Expired or unknown codes return `None`; a redeemed
    /// code is consumed.
    pub fn redeem(&self, code: &str, now: DateTime<Utc>) -> Option<PairingPayload> {
        let mut codes = self.codes.lock().expect("pairing book lock poisoned");
        match codes.get(code) {
            Some(payload) if payload.expires_at > now => codes.remove(code),
            Some(_) => {
                codes.remove(code);
                None
            }
            None => None,
        }
    }

    /// Drop every expired code.
    pub fn prune_expired(&self, now: DateTime<Utc>) {
        let mut codes = self.codes.lock().expect("pairing book lock poisoned");
        codes.retain(|_, payload| payload.expires_at > now);
    }

    /// Number of outstanding codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.codes.lock().expect("pairing book lock poisoned").len()
    }

    /// Whether no codes are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
