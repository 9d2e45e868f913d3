// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded exponential backoff with deterministic jitter.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Compute the retry delay for attempt `n` (1-based) of a job.
///
/// `min(cap, base * 2^(n-1)) + jitter`, where the jitter is derived from
/// `SHA256(job_id || n)` and scaled into `[0, base)`. The same (job, attempt)
/// pair always waits the same amount, so retry schedules replay exactly.
#[must_use]
pub fn backoff_ms(base_ms: u64, cap_ms: u64, attempt: u32, job_id: Uuid) -> u64 {
    let attempt = attempt.max(1);
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX));
    exp.min(cap_ms) + jitter_ms(base_ms, attempt, job_id)
}

fn jitter_ms(base_ms: u64, attempt: u32, job_id: Uuid) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(attempt.to_be_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(word) % base_ms
}
