// SPDX-License-Identifier: MIT OR Apache-2.0
//! Delegation envelopes and execution proofs.

use crate::PoeeError;
use chrono::{DateTime, Utc};
use reach_mesh::{NodeIdentity, PeerIdentity, TrustLevel};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// A signed statement issuing work to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationEnvelope {
    /// Delegation identifier.
    pub delegation_id: Uuid,
    /// Content hash of the pack being delegated.
    pub pack_hash: String,
    /// Canonical hash of the inputs.
    pub input_hash: String,
    /// Optional hash of the scheduler state pinned by the issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_hash: Option<String>,
    /// The issuing node.
    pub issuer_node_id: String,
    /// Canonical hash over the envelope minus `envelope_hash` and
    /// `signature`.
    pub envelope_hash: String,
    /// Issuer's hex-encoded signature over `envelope_hash`.
    pub signature: String,
    /// When the envelope was issued.
    pub issued_at: DateTime<Utc>,
}

/// The peer's signed statement that it executed a delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProof {
    /// The delegation being proven.
    pub delegation_id: Uuid,
    /// Must equal the issued envelope's `envelope_hash`.
    pub execution_envelope_hash: String,
    /// Canonical hash of the execution result.
    pub result_hash: String,
    /// The executing node.
    pub signer_node_id: String,
    /// Signer's hex-encoded signature over the proof body.
    pub signature: String,
}

/// Compute the canonical hash of an envelope's signed body.
///
/// The body excludes `envelope_hash` and `signature`, so the hash is
/// well-defined before signing.
///
/// # Errors
///
/// Fails if the body cannot be serialized.
pub fn envelope_hash(
    delegation_id: Uuid,
    pack_hash: &str,
    input_hash: &str,
    scheduler_hash: Option<&str>,
    issuer_node_id: &str,
    issued_at: DateTime<Utc>,
) -> Result<String, PoeeError> {
    let body = json!({
        "delegation_id": delegation_id,
        "pack_hash": pack_hash,
        "input_hash": input_hash,
        "scheduler_hash": scheduler_hash,
        "issuer_node_id": issuer_node_id,
        "issued_at": issued_at.to_rfc3339(),
    });
    Ok(reach_hash::hash_canonical(&body)?)
}

/// The byte message a proof signature covers: the proof minus its
/// signature, canonically serialized.
///
/// # Errors
///
/// Fails if the body cannot be serialized.
pub fn proof_message(proof: &ExecutionProof) -> Result<Vec<u8>, PoeeError> {
    let body = json!({
        "delegation_id": proof.delegation_id,
        "execution_envelope_hash": proof.execution_envelope_hash,
        "result_hash": proof.result_hash,
        "signer_node_id": proof.signer_node_id,
    });
    Ok(reach_hash::canonical_bytes(&body)?)
}

/// Issue a signed delegation envelope to a peer.
///
/// The peer must be `trusted` and not quarantined.
///
/// # Errors
///
/// Returns [`PoeeError::TrustRefused`] for ineligible peers.
pub fn issue(
    identity: &NodeIdentity,
    peer: &PeerIdentity,
    pack_hash: &str,
    input_hash: &str,
    scheduler_hash: Option<&str>,
    issued_at: DateTime<Utc>,
) -> Result<DelegationEnvelope, PoeeError> {
    if peer.quarantined {
        return Err(PoeeError::TrustRefused(format!(
            "peer {} is quarantined",
            peer.node_id
        )));
    }
    if peer.trust_level != TrustLevel::Trusted {
        return Err(PoeeError::TrustRefused(format!(
            "peer {} is {}, delegation requires trusted",
            peer.node_id,
            peer.trust_level.as_str()
        )));
    }
    let delegation_id = Uuid::new_v4();
    let hash = envelope_hash(
        delegation_id,
        pack_hash,
        input_hash,
        scheduler_hash,
        &identity.node_id,
        issued_at,
    )?;
    let signature = identity.sign_hex(hash.as_bytes());
    Ok(DelegationEnvelope {
        delegation_id,
        pack_hash: pack_hash.to_string(),
        input_hash: input_hash.to_string(),
        scheduler_hash: scheduler_hash.map(String::from),
        issuer_node_id: identity.node_id.clone(),
        envelope_hash: hash,
        signature,
        issued_at,
    })
}

/// The executing peer's half: build and sign a proof for an envelope it
/// just executed.
///
/// # Errors
///
/// Fails if the proof body cannot be serialized.
pub fn fulfill(
    executor: &NodeIdentity,
    envelope: &DelegationEnvelope,
    result_hash: &str,
) -> Result<ExecutionProof, PoeeError> {
    let mut proof = ExecutionProof {
        delegation_id: envelope.delegation_id,
        execution_envelope_hash: envelope.envelope_hash.clone(),
        result_hash: result_hash.to_string(),
        signer_node_id: executor.node_id.clone(),
        signature: String::new(),
    };
    let message = proof_message(&proof)?;
    proof.signature = executor.sign_hex(&message);
    Ok(proof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn trusted_peer(identity: &NodeIdentity) -> PeerIdentity {
        PeerIdentity {
            node_id: identity.node_id.clone(),
            public_key: identity.public_key_hex(),
            device_info: Value::Null,
            trust_level: TrustLevel::Trusted,
            quarantined: false,
            proof_failures: 0,
            last_seen: None,
        }
    }

    #[test]
    fn issue_requires_trusted_peer() {
        let issuer = NodeIdentity::generate();
        let executor = NodeIdentity::generate();
        let mut peer = trusted_peer(&executor);
        peer.trust_level = TrustLevel::Provisional;
        let err = issue(&issuer, &peer, "ph", "ih", None, Utc::now()).unwrap_err();
        assert!(matches!(err, PoeeError::TrustRefused(_)));
    }

    #[test]
    fn issue_refuses_quarantined_peer() {
        let issuer = NodeIdentity::generate();
        let executor = NodeIdentity::generate();
        let mut peer = trusted_peer(&executor);
        peer.quarantined = true;
        assert!(issue(&issuer, &peer, "ph", "ih", None, Utc::now()).is_err());
    }

    #[test]
    fn envelope_hash_excludes_signature_fields() {
        let issuer = NodeIdentity::generate();
        let executor = NodeIdentity::generate();
        let peer = trusted_peer(&executor);
        let envelope = issue(&issuer, &peer, "ph", "ih", Some("sh"), Utc::now()).unwrap();
        let recomputed = envelope_hash(
            envelope.delegation_id,
            &envelope.pack_hash,
            &envelope.input_hash,
            envelope.scheduler_hash.as_deref(),
            &envelope.issuer_node_id,
            envelope.issued_at,
        )
        .unwrap();
        assert_eq!(recomputed, envelope.envelope_hash);
    }

    #[test]
    fn issuer_signature_verifies_over_envelope_hash() {
        let issuer = NodeIdentity::generate();
        let executor = NodeIdentity::generate();
        let peer = trusted_peer(&executor);
        let envelope = issue(&issuer, &peer, "ph", "ih", None, Utc::now()).unwrap();
        assert!(reach_mesh::verify_hex(
            &issuer.public_key_hex(),
            envelope.envelope_hash.as_bytes(),
            &envelope.signature,
        )
        .unwrap());
    }

    #[test]
    fn fulfilled_proof_binds_to_envelope() {
        let issuer = NodeIdentity::generate();
        let executor = NodeIdentity::generate();
        let peer = trusted_peer(&executor);
        let envelope = issue(&issuer, &peer, "ph", "ih", None, Utc::now()).unwrap();
        let proof = fulfill(&executor, &envelope, "result-hash").unwrap();
        assert_eq!(proof.execution_envelope_hash, envelope.envelope_hash);
        let message = proof_message(&proof).unwrap();
        assert!(reach_mesh::verify_hex(&executor.public_key_hex(), &message, &proof.signature)
            .unwrap());
    }
}
