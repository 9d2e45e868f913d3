// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Proof of external execution: delegation envelopes, proofs, and the delegation ledger."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Delegation hands a pack to a trusted peer under a signed envelope; the
//! peer returns a proof binding its signature to the original envelope
//! hash. The verifier never trusts a proof whose envelope it does not hold
//! locally, and a peer whose proofs keep failing erodes to `untrusted`.

mod envelope;
mod ledger;

pub use envelope::{DelegationEnvelope, ExecutionProof, envelope_hash, fulfill, issue, proof_message};
pub use ledger::{DelegationLedger, DelegationRecord, DelegationStatus};

use reach_core::{CancelToken, ErrorKind, ReachError};
use reach_mesh::{MeshError, PeerStore, TrustLevel};
use reach_store::StoreError;

/// Errors from delegation and proof verification.
#[derive(Debug, thiserror::Error)]
pub enum PoeeError {
    /// The peer is not eligible for delegation or the envelope is absent.
    #[error("trust refused: {0}")]
    TrustRefused(String),

    /// The proof does not bind to the issued envelope.
    #[error("proof invariant violated: {0}")]
    InvariantViolation(String),

    /// Mesh-level failure (keys, peer store).
    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Canonical serialization failure.
    #[error(transparent)]
    Canonical(#[from] reach_hash::CanonicalError),

    /// Ledger file I/O failure.
    #[error("ledger io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse or serialize failure.
    #[error("ledger json: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoeeError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoeeError::TrustRefused(_) => ErrorKind::TrustRefused,
            PoeeError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            PoeeError::Mesh(e) => e.kind(),
            PoeeError::Store(e) => e.kind(),
            PoeeError::Canonical(_) | PoeeError::Json(_) => ErrorKind::ValidationFailure,
            PoeeError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<PoeeError> for ReachError {
    fn from(err: PoeeError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}

/// Verification configuration.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Consecutive failed verifications before the peer erodes to
    /// `untrusted`.
    pub proof_failure_threshold: u32,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            proof_failure_threshold: 3,
        }
    }
}

/// Verify a returned proof against the local ledger and peer store.
///
/// Requirements, in order: the envelope must exist locally; the proof's
/// `execution_envelope_hash` must equal the envelope's hash; the signer
/// must be the delegated peer; the signature must verify against that
/// peer's published key. Success records `completed`; any failure records
/// `failed` with the reason and counts toward trust erosion.
///
/// # Errors
///
/// Returns [`PoeeError::TrustRefused`] or [`PoeeError::InvariantViolation`]
/// describing the first failed requirement.
pub fn verify_proof(
    ledger: &DelegationLedger,
    peers: &PeerStore,
    proof: &ExecutionProof,
    options: VerifyOptions,
    ctx: &CancelToken,
) -> Result<(), PoeeError> {
    match check_proof(ledger, peers, proof, ctx) {
        Ok(peer_id) => {
            ledger.set_status(
                proof.delegation_id,
                DelegationStatus::Completed,
                None,
                ctx,
            )?;
            peers.reset_proof_failures(&peer_id, ctx)?;
            tracing::info!(delegation = %proof.delegation_id, peer = %peer_id, "proof verified");
            Ok(())
        }
        Err(err) => {
            let reason = err.to_string();
            ledger.set_status(
                proof.delegation_id,
                DelegationStatus::Failed,
                Some(&reason),
                ctx,
            )?;
            if let Ok(Some(record)) = ledger.get(proof.delegation_id, ctx) {
                let level = peers.record_proof_failure(
                    &record.peer_id,
                    options.proof_failure_threshold,
                    ctx,
                )?;
                if level == TrustLevel::Untrusted {
                    tracing::warn!(peer = %record.peer_id, "peer trust eroded after repeated proof failures");
                }
            }
            Err(err)
        }
    }
}

/// The pure checks, returning the delegated peer id on success.
fn check_proof(
    ledger: &DelegationLedger,
    peers: &PeerStore,
    proof: &ExecutionProof,
    ctx: &CancelToken,
) -> Result<String, PoeeError> {
    let record = ledger
        .get(proof.delegation_id, ctx)?
        .ok_or_else(|| {
            PoeeError::TrustRefused(format!(
                "no local envelope for delegation {}",
                proof.delegation_id
            ))
        })?;
    if proof.execution_envelope_hash != record.envelope.envelope_hash {
        return Err(PoeeError::InvariantViolation(format!(
            "proof envelope hash {} does not match issued envelope {}",
            proof.execution_envelope_hash, record.envelope.envelope_hash
        )));
    }
    if proof.signer_node_id != record.peer_id {
        return Err(PoeeError::TrustRefused(format!(
            "proof signed by {} but delegation was issued to {}",
            proof.signer_node_id, record.peer_id
        )));
    }
    let peer = peers
        .get(&proof.signer_node_id, ctx)?
        .ok_or_else(|| {
            PoeeError::TrustRefused(format!("unknown signer {}", proof.signer_node_id))
        })?;
    let message = proof_message(proof)?;
    let valid = reach_mesh::verify_hex(&peer.public_key, &message, &proof.signature)?;
    if !valid {
        return Err(PoeeError::InvariantViolation(
            "proof signature does not verify against the signer's published key".into(),
        ));
    }
    Ok(record.peer_id)
}

#[cfg(test)]
mod tests;
