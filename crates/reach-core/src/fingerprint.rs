// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event-log fingerprinting.

use crate::EventRecord;
use reach_hash::CanonicalError;
use serde_json::json;
use uuid::Uuid;

/// Compute the fingerprint of a run's event log.
///
/// The fingerprint is `SHA256(canonical({event_log, run_id}))` over the
/// hash-input projection of each event (`{id, type, payload}`; `created_at`
/// is informational and excluded). It is written to the run exactly once,
/// after the log is complete, and is what a capsule's verification
/// recomputes.
///
/// # Errors
///
/// Returns [`CanonicalError`] if an event payload cannot be serialized.
pub fn run_fingerprint(run_id: Uuid, event_log: &[EventRecord]) -> Result<String, CanonicalError> {
    reach_hash::hash_canonical(&json!({
        "event_log": event_log,
        "run_id": run_id,
    }))
}
