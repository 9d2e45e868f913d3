// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;
use chrono::Utc;
use reach_core::FixedClock;
use reach_mesh::NodeIdentity;
use reach_store::{CasOptions, Store};
use serde_json::json;
use std::sync::Arc;

struct Mesh {
    _dir: tempfile::TempDir,
    ledger: DelegationLedger,
    peers: PeerStore,
    issuer: NodeIdentity,
    executor: NodeIdentity,
}

fn mesh() -> Mesh {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        Store::open(
            &dir.path().join("reach.db"),
            &dir.path().join("cas"),
            CasOptions::default(),
            Arc::new(FixedClock::from_epoch_secs(1_700_000_000)),
        )
        .unwrap(),
    );
    let ledger = DelegationLedger::new(store.clone(), dir.path());
    let peers = PeerStore::new(store);
    let issuer = NodeIdentity::generate();
    let executor = NodeIdentity::generate();
    Mesh {
        _dir: dir,
        ledger,
        peers,
        issuer,
        executor,
    }
}

fn trust_executor(m: &Mesh, ctx: &CancelToken) {
    m.peers
        .import(
            &m.executor.node_id,
            &m.executor.public_key_hex(),
            &json!({"device": "test"}),
            ctx,
        )
        .unwrap();
    m.peers.mark_provisional(&m.executor.node_id, ctx).unwrap();
    m.peers.confirm(&m.executor.node_id, ctx).unwrap();
}

fn issue_to_executor(m: &Mesh, ctx: &CancelToken) -> DelegationEnvelope {
    let peer = m.peers.get(&m.executor.node_id, ctx).unwrap().unwrap();
    let envelope = issue(&m.issuer, &peer, "pack-hash", "input-hash", None, Utc::now()).unwrap();
    m.ledger.record(&envelope, &peer.node_id, ctx).unwrap();
    envelope
}

#[test]
fn delegation_round_trip_verifies() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let envelope = issue_to_executor(&m, &ctx);
    let proof = fulfill(&m.executor, &envelope, "result-hash").unwrap();
    verify_proof(&m.ledger, &m.peers, &proof, VerifyOptions::default(), &ctx).unwrap();
    let record = m.ledger.get(envelope.delegation_id, &ctx).unwrap().unwrap();
    assert_eq!(record.status, DelegationStatus::Completed);
    assert!(m.ledger.mirror_path(envelope.delegation_id).exists());
}

#[test]
fn flipped_envelope_hash_is_rejected() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let envelope = issue_to_executor(&m, &ctx);
    let mut proof = fulfill(&m.executor, &envelope, "result-hash").unwrap();
    // Flip one character of the bound hash.
    let mut chars: Vec<char> = proof.execution_envelope_hash.chars().collect();
    chars[0] = if chars[0] == 'a' { 'b' } else { 'a' };
    proof.execution_envelope_hash = chars.into_iter().collect();
    let err = verify_proof(&m.ledger, &m.peers, &proof, VerifyOptions::default(), &ctx)
        .unwrap_err();
    assert!(matches!(err, PoeeError::InvariantViolation(_)));
    let record = m.ledger.get(envelope.delegation_id, &ctx).unwrap().unwrap();
    assert_eq!(record.status, DelegationStatus::Failed);
    assert!(record.reason.is_some());
}

#[test]
fn proof_without_local_envelope_is_refused() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let peer = m.peers.get(&m.executor.node_id, &ctx).unwrap().unwrap();
    let envelope = issue(&m.issuer, &peer, "ph", "ih", None, Utc::now()).unwrap();
    // Envelope never recorded locally.
    let proof = fulfill(&m.executor, &envelope, "result-hash").unwrap();
    let err = check_proof(&m.ledger, &m.peers, &proof, &ctx).unwrap_err();
    assert!(matches!(err, PoeeError::TrustRefused(_)));
}

#[test]
fn wrong_signer_is_refused() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let envelope = issue_to_executor(&m, &ctx);
    let impostor = NodeIdentity::generate();
    let proof = fulfill(&impostor, &envelope, "result-hash").unwrap();
    let err = verify_proof(&m.ledger, &m.peers, &proof, VerifyOptions::default(), &ctx)
        .unwrap_err();
    assert!(matches!(err, PoeeError::TrustRefused(_)));
}

#[test]
fn tampered_result_hash_fails_signature() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let envelope = issue_to_executor(&m, &ctx);
    let mut proof = fulfill(&m.executor, &envelope, "result-hash").unwrap();
    proof.result_hash = "forged-result".into();
    let err = verify_proof(&m.ledger, &m.peers, &proof, VerifyOptions::default(), &ctx)
        .unwrap_err();
    assert!(matches!(err, PoeeError::InvariantViolation(_)));
}

#[test]
fn repeated_failures_erode_peer_trust() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let options = VerifyOptions {
        proof_failure_threshold: 2,
    };
    for _ in 0..2 {
        let envelope = issue_to_executor(&m, &ctx);
        let mut proof = fulfill(&m.executor, &envelope, "result-hash").unwrap();
        proof.result_hash = "forged".into();
        let _ = verify_proof(&m.ledger, &m.peers, &proof, options, &ctx);
    }
    let peer = m.peers.get(&m.executor.node_id, &ctx).unwrap().unwrap();
    assert_eq!(peer.trust_level, reach_mesh::TrustLevel::Untrusted);
    assert!(peer.quarantined);
    // Further delegation to this peer is refused at issue time.
    assert!(issue(&m.issuer, &peer, "ph", "ih", None, Utc::now()).is_err());
}

#[test]
fn successful_verification_resets_erosion() {
    let m = mesh();
    let ctx = CancelToken::new();
    trust_executor(&m, &ctx);
    let options = VerifyOptions {
        proof_failure_threshold: 3,
    };
    let envelope = issue_to_executor(&m, &ctx);
    let mut bad = fulfill(&m.executor, &envelope, "result-hash").unwrap();
    bad.result_hash = "forged".into();
    let _ = verify_proof(&m.ledger, &m.peers, &bad, options, &ctx);

    let envelope2 = issue_to_executor(&m, &ctx);
    let good = fulfill(&m.executor, &envelope2, "result-hash").unwrap();
    verify_proof(&m.ledger, &m.peers, &good, options, &ctx).unwrap();
    let peer = m.peers.get(&m.executor.node_id, &ctx).unwrap().unwrap();
    assert_eq!(peer.proof_failures, 0);
}
