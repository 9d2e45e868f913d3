// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Capsule lifecycle: build, verify, and replay portable run transcripts."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! A capsule is a self-contained archive of one run: a manifest plus the
//! complete event log. Verification recomputes the fingerprint from the
//! capsule's own bytes and never consults the engine's database. Replay
//! additionally folds the log back into run state; recorded AI proposals
//! are read from the log, never re-issued.

use reach_core::{Capsule, CancelToken, CapsuleManifest, EventRecord, run_fingerprint};
use reach_engine::RunState;
use reach_store::{Store, StoreError};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Errors from the capsule lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CapsuleError {
    /// The capsule's event log does not reproduce its manifest fingerprint.
    #[error("capsule tampered: manifest claims {expected}, log hashes to {actual}")]
    Tampered {
        /// Fingerprint stored in the manifest.
        expected: String,
        /// Fingerprint recomputed from the embedded log.
        actual: String,
    },

    /// The run has no fingerprint yet; only completed runs are archivable.
    #[error("run {0} has no fingerprint; cannot build a capsule from an incomplete run")]
    IncompleteRun(Uuid),

    /// The run does not exist.
    #[error("unknown run {0}")]
    UnknownRun(Uuid),

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Canonical serialization failure.
    #[error(transparent)]
    Canonical(#[from] reach_hash::CanonicalError),

    /// Capsule file I/O failure.
    #[error("capsule io: {0}")]
    Io(#[from] std::io::Error),

    /// The capsule file does not parse.
    #[error("malformed capsule: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl CapsuleError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> reach_core::ErrorKind {
        match self {
            CapsuleError::Tampered { .. } => reach_core::ErrorKind::InvariantViolation,
            CapsuleError::IncompleteRun(_) | CapsuleError::UnknownRun(_) => {
                reach_core::ErrorKind::ValidationFailure
            }
            CapsuleError::Store(e) => e.kind(),
            CapsuleError::Canonical(_) | CapsuleError::Malformed(_) => {
                reach_core::ErrorKind::ValidationFailure
            }
            CapsuleError::Io(_) => reach_core::ErrorKind::TransientIo,
        }
    }
}

impl From<CapsuleError> for reach_core::ReachError {
    fn from(err: CapsuleError) -> Self {
        reach_core::ReachError::new(err.kind(), err.to_string())
    }
}

/// Inputs to capsule construction beyond what the run row carries.
#[derive(Debug, Clone, Default)]
pub struct CapsuleContext {
    /// The pack manifest that was executed, as JSON.
    pub pack: serde_json::Value,
    /// The governance policy in force, if any.
    pub policy: Option<serde_json::Value>,
    /// Canonical hash of the registry index at execution time.
    pub registry_snapshot_hash: Option<String>,
}

/// Result of a successful replay.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    /// The fingerprint recomputed from the capsule's log.
    pub fingerprint: String,
    /// The state reconstructed by folding the log.
    pub state: RunState,
}

/// Build a capsule from a completed run.
///
/// The fingerprint is recomputed from the stored event log and must equal
/// the fingerprint written at run completion; divergence means the event
/// store was mutated after the fact.
///
/// # Errors
///
/// Fails for unknown or incomplete runs and on any storage error.
pub fn build(
    store: &Store,
    run_id: Uuid,
    context: CapsuleContext,
    ctx: &CancelToken,
) -> Result<Capsule, CapsuleError> {
    let run = store
        .get_run(run_id, ctx)?
        .ok_or(CapsuleError::UnknownRun(run_id))?;
    let stored_fingerprint = run
        .fingerprint
        .clone()
        .ok_or(CapsuleError::IncompleteRun(run_id))?;
    let event_log: Vec<EventRecord> = store
        .list_events(run_id, 0, ctx)?
        .iter()
        .map(reach_core::Event::to_record)
        .collect();
    let recomputed = run_fingerprint(run_id, &event_log)?;
    if recomputed != stored_fingerprint {
        return Err(CapsuleError::Tampered {
            expected: stored_fingerprint,
            actual: recomputed,
        });
    }
    let audit_entries = store.list_audit(run_id, ctx)?;
    let audit_leaves: Vec<serde_json::Value> = audit_entries
        .iter()
        .map(|entry| {
            serde_json::json!({
                "type": entry.entry_type,
                "payload": entry.payload,
                "tenant_id": entry.tenant_id,
            })
        })
        .collect();
    let audit_root = reach_hash::merkle_root(&audit_leaves)?;

    Ok(Capsule {
        manifest: CapsuleManifest {
            spec_version: reach_core::CAPSULE_SPEC_VERSION.to_string(),
            run_id,
            run_fingerprint: stored_fingerprint,
            hash_alg: reach_hash::HASH_ALG.to_string(),
            registry_snapshot_hash: context.registry_snapshot_hash,
            pack: context.pack,
            policy: context.policy,
            federation_path: run.federation_path,
            trust_scores: run.trust_scores,
            audit_root,
            environment: run.environment,
            created_at: reach_core::EPOCH_ZERO.to_string(),
        },
        event_log,
    })
}

/// Verify a capsule against its own contents.
///
/// # Errors
///
/// Returns [`CapsuleError::Tampered`] when the embedded log does not hash
/// to the manifest fingerprint.
pub fn verify(capsule: &Capsule) -> Result<(), CapsuleError> {
    let actual = run_fingerprint(capsule.manifest.run_id, &capsule.event_log)?;
    if actual != capsule.manifest.run_fingerprint {
        return Err(CapsuleError::Tampered {
            expected: capsule.manifest.run_fingerprint.clone(),
            actual,
        });
    }
    Ok(())
}

/// Replay a capsule: verify the fingerprint and reconstruct the final state
/// by folding the event log through the deterministic engine.
///
/// AI proposals present in the log are consumed as recorded; no provider is
/// ever contacted here.
///
/// # Errors
///
/// Returns [`CapsuleError::Tampered`] on fingerprint divergence.
pub fn replay(capsule: &Capsule) -> Result<ReplayReport, CapsuleError> {
    verify(capsule)?;
    let state = RunState::replay(&capsule.event_log);
    tracing::debug!(
        run = %capsule.manifest.run_id,
        nodes = state.results.len(),
        "capsule replayed"
    );
    Ok(ReplayReport {
        fingerprint: capsule.manifest.run_fingerprint.clone(),
        state,
    })
}

/// Serialize a capsule to its on-disk form: pretty-printed UTF-8 JSON with
/// canonically ordered keys, newline-terminated.
///
/// # Errors
///
/// Fails if the capsule cannot be serialized.
pub fn to_file_bytes(capsule: &Capsule) -> Result<Vec<u8>, CapsuleError> {
    // Round-trip through Value so keys are sorted regardless of struct
    // field order.
    let value = serde_json::to_value(capsule)?;
    let mut bytes = serde_json::to_vec_pretty(&value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write a capsule to `<dir>/<run_id>.capsule.json` atomically.
///
/// # Errors
///
/// Fails on serialization or filesystem error.
pub fn write_file(capsule: &Capsule, dir: &Path) -> Result<std::path::PathBuf, CapsuleError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.capsule.json", capsule.manifest.run_id));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&to_file_bytes(capsule)?)?;
    tmp.persist(&path).map_err(|e| e.error)?;
    Ok(path)
}

/// Read a capsule file.
///
/// # Errors
///
/// Fails on I/O or parse error. Reading does not verify; call [`verify`].
pub fn read_file(path: &Path) -> Result<Capsule, CapsuleError> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
