// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations. Every command returns a JSON value so `--json`
//! output and human output share one code path.

use chrono::Duration;
use reach_capsule::CapsuleContext;
use reach_config::Config;
use reach_core::{CancelToken, ErrorKind, JobSpec, ReachError};
use reach_engine::{DagExecutor, ExecutionRequest, RegistryToolClient, builtin_registry};
use reach_mesh::{NodeIdentity, PairingPayload, PeerStore, generate_pairing_code};
use reach_poee::{DelegationLedger, ExecutionProof, VerifyOptions};
use reach_policy::{Policy, RunFacts, Verdict};
use reach_queue::{JobQueue, QueueOptions};
use reach_registry::{ArchiveLimits, IngestSource, PackRegistry, ValidationOptions};
use reach_store::Store;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

fn wrap<E: Into<ReachError>>(err: E) -> ReachError {
    err.into()
}

fn io_error(err: std::io::Error) -> ReachError {
    ReachError::new(ErrorKind::TransientIo, err.to_string())
}

fn parse_error(err: serde_json::Error) -> ReachError {
    ReachError::new(ErrorKind::ValidationFailure, err.to_string())
}

fn open_store(config: &Config) -> Result<Arc<Store>, ReachError> {
    let layout = config.layout();
    let store = Store::open(
        &layout.db_path(),
        &layout.cas_dir(),
        config.cas_options(),
        config.clock(),
    )
    .map_err(wrap)?;
    Ok(Arc::new(store))
}

fn open_registry(config: &Config) -> Result<PackRegistry, ReachError> {
    let registry = builtin_registry(None);
    let options = ValidationOptions {
        available_caps: registry.names().iter().map(|s| (*s).to_string()).collect(),
        require_signature: config.require_pack_signature,
        ..ValidationOptions::default()
    };
    PackRegistry::open(&config.data_dir, options, ArchiveLimits::default()).map_err(wrap)
}

// ── pack / packs ────────────────────────────────────────────────────────

pub fn pack_validate(config: &Config, source: &str) -> Result<Value, ReachError> {
    let manifest = reach_registry::ingest(
        &IngestSource::infer(source),
        &ArchiveLimits::default(),
    )
    .map_err(wrap)?;
    let registry = builtin_registry(None);
    let options = ValidationOptions {
        available_caps: registry.names().iter().map(|s| (*s).to_string()).collect(),
        require_signature: config.require_pack_signature,
        ..ValidationOptions::default()
    };
    reach_registry::validate_manifest(&manifest, &options).map_err(wrap)?;
    Ok(json!({
        "name": manifest.name,
        "version": manifest.version,
        "valid": true,
    }))
}

pub fn pack_hash(_config: &Config, source: &str) -> Result<Value, ReachError> {
    let manifest = reach_registry::ingest(
        &IngestSource::infer(source),
        &ArchiveLimits::default(),
    )
    .map_err(wrap)?;
    let hash = reach_registry::content_hash(&manifest).map_err(wrap)?;
    Ok(json!({
        "name": manifest.name,
        "alg": reach_hash::HASH_ALG,
        "content_hash": hash,
    }))
}

pub fn pack_add(config: &Config, source: &str, replace: bool) -> Result<Value, ReachError> {
    let registry = open_registry(config)?;
    let (manifest, entry) = registry
        .add_pack(&IngestSource::infer(source), replace)
        .map_err(wrap)?;
    Ok(json!({
        "name": manifest.name,
        "version": entry.version,
        "content_hash": entry.content_hash,
        "source": entry.source,
    }))
}

pub fn packs_list(config: &Config) -> Result<Value, ReachError> {
    let registry = open_registry(config)?;
    let entries: Vec<Value> = registry
        .list()
        .map_err(wrap)?
        .into_iter()
        .map(|(name, entry)| {
            json!({
                "name": name,
                "version": entry.version,
                "content_hash": entry.content_hash,
                "source": entry.source,
            })
        })
        .collect();
    Ok(json!({ "packs": entries }))
}

// ── run / runs ──────────────────────────────────────────────────────────

pub async fn run_pack(
    config: &Config,
    pack_name: &str,
    tenant: &str,
    environment: &str,
) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let registry = open_registry(config)?;
    let manifest = registry.get(pack_name).map_err(wrap)?;
    let executor = DagExecutor::new(
        store.clone(),
        Arc::new(RegistryToolClient::new(builtin_registry(None))),
    );
    let ctx = CancelToken::new();
    let outcome = executor
        .execute(
            ExecutionRequest {
                run_id: Uuid::new_v4(),
                tenant_id: tenant.to_string(),
                pack: manifest,
                environment: environment.to_string(),
                federation_path: vec![],
                trust_scores: BTreeMap::new(),
            },
            &ctx,
        )
        .await
        .map_err(wrap)?;

    // Mirror the run row into runs/<run_id>.json for external observers.
    let runs_dir = config.layout().runs_dir();
    std::fs::create_dir_all(&runs_dir).map_err(io_error)?;
    let mut bytes = serde_json::to_vec_pretty(&outcome.run).map_err(parse_error)?;
    bytes.push(b'\n');
    std::fs::write(
        runs_dir.join(format!("{}.json", outcome.run.id)),
        bytes,
    )
    .map_err(io_error)?;

    Ok(json!({
        "run_id": outcome.run.id,
        "fingerprint": outcome.fingerprint,
        "deterministic": config.deterministic(),
        "nodes": outcome.state.results.len(),
        "latency_ms": outcome.state.latency_ms,
    }))
}

pub fn runs_list(config: &Config, tenant: &str) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let runs: Vec<Value> = store
        .list_runs(tenant, &CancelToken::new())
        .map_err(wrap)?
        .into_iter()
        .map(|run| {
            json!({
                "run_id": run.id,
                "pack_ref": run.pack_ref,
                "fingerprint": run.fingerprint,
                "environment": run.environment,
                "created_at": run.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(json!({ "runs": runs }))
}

pub fn runs_show(config: &Config, run_id: Uuid) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let run = store
        .get_run(run_id, &CancelToken::new())
        .map_err(wrap)?
        .ok_or_else(|| {
            ReachError::new(ErrorKind::ValidationFailure, format!("unknown run {run_id}"))
        })?;
    serde_json::to_value(&run).map_err(parse_error)
}

// ── capsule ─────────────────────────────────────────────────────────────

pub fn capsule_build(config: &Config, run_id: Uuid) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let registry = open_registry(config)?;
    let ctx = CancelToken::new();
    let run = store
        .get_run(run_id, &ctx)
        .map_err(wrap)?
        .ok_or_else(|| {
            ReachError::new(ErrorKind::ValidationFailure, format!("unknown run {run_id}"))
        })?;
    let pack_name = run.pack_ref.split('@').next().unwrap_or(&run.pack_ref);
    let pack = registry
        .get(pack_name)
        .ok()
        .and_then(|manifest| serde_json::to_value(manifest).ok())
        .unwrap_or(Value::Null);
    let capsule = reach_capsule::build(
        &store,
        run_id,
        CapsuleContext {
            pack,
            policy: None,
            registry_snapshot_hash: registry.snapshot_hash().ok(),
        },
        &ctx,
    )
    .map_err(wrap)?;
    let path = reach_capsule::write_file(&capsule, &config.layout().capsules_dir())
        .map_err(wrap)?;
    Ok(json!({
        "run_id": run_id,
        "fingerprint": capsule.manifest.run_fingerprint,
        "audit_root": capsule.manifest.audit_root,
        "path": path.display().to_string(),
    }))
}

pub fn capsule_verify(path: &Path) -> Result<Value, ReachError> {
    let capsule = reach_capsule::read_file(path).map_err(wrap)?;
    reach_capsule::verify(&capsule).map_err(wrap)?;
    Ok(json!({
        "run_id": capsule.manifest.run_id,
        "fingerprint": capsule.manifest.run_fingerprint,
        "verified": true,
    }))
}

pub fn capsule_replay(path: &Path) -> Result<Value, ReachError> {
    let capsule = reach_capsule::read_file(path).map_err(wrap)?;
    let report = reach_capsule::replay(&capsule).map_err(wrap)?;
    Ok(json!({
        "run_id": capsule.manifest.run_id,
        "fingerprint": report.fingerprint,
        "nodes": report.state.results.len(),
        "completed": report.state.completed,
        "replayed": true,
    }))
}

// ── queue ───────────────────────────────────────────────────────────────

pub fn queue_enqueue(
    config: &Config,
    pack: &str,
    tenant: &str,
    session: Option<&str>,
    priority: i64,
    idempotency_key: Option<&str>,
    max_attempts: u32,
) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let queue = JobQueue::new(store, QueueOptions::default());
    let job = queue
        .enqueue(
            &JobSpec {
                tenant_id: tenant.to_string(),
                session_id: session.map(String::from),
                priority,
                pack_ref: pack.to_string(),
                idempotency_key: idempotency_key
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                max_attempts,
            },
            &CancelToken::new(),
        )
        .map_err(wrap)?;
    Ok(json!({
        "job_id": job.id,
        "status": job.status.as_str(),
        "next_visible_at": job.next_visible_at.to_rfc3339(),
    }))
}

pub fn queue_stats(config: &Config) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let queue = JobQueue::new(store, QueueOptions::default());
    let stats: BTreeMap<String, i64> = queue
        .stats(&CancelToken::new())
        .map_err(wrap)?
        .into_iter()
        .collect();
    Ok(json!({ "jobs": stats }))
}

// ── mesh ────────────────────────────────────────────────────────────────

pub fn mesh_init(config: &Config) -> Result<Value, ReachError> {
    let identity =
        NodeIdentity::load_or_generate(&config.layout().keys_dir()).map_err(wrap)?;
    Ok(json!({
        "node_id": identity.node_id,
        "public_key": identity.public_key_hex(),
    }))
}

pub fn mesh_peers(config: &Config) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let peers = PeerStore::new(store);
    let listed: Vec<Value> = peers
        .list(&CancelToken::new())
        .map_err(wrap)?
        .into_iter()
        .map(|peer| {
            json!({
                "node_id": peer.node_id,
                "trust_level": peer.trust_level.as_str(),
                "quarantined": peer.quarantined,
                "proof_failures": peer.proof_failures,
            })
        })
        .collect();
    Ok(json!({ "peers": listed }))
}

pub fn mesh_pair(config: &Config, import: Option<&Path>) -> Result<Value, ReachError> {
    match import {
        Some(path) => {
            let bytes = std::fs::read(path).map_err(io_error)?;
            let payload: PairingPayload = serde_json::from_slice(&bytes).map_err(parse_error)?;
            let store = open_store(config)?;
            let peers = PeerStore::new(store);
            let ctx = CancelToken::new();
            peers
                .import(
                    &payload.node_id,
                    &payload.public_key,
                    &json!({"endpoints": payload.endpoints}),
                    &ctx,
                )
                .map_err(wrap)?;
            peers.mark_provisional(&payload.node_id, &ctx).map_err(wrap)?;
            Ok(json!({
                "imported": payload.node_id,
                "trust_level": "provisional",
                "note": "confirm on both sides with `reach mesh trust`",
            }))
        }
        None => {
            let identity =
                NodeIdentity::load_or_generate(&config.layout().keys_dir()).map_err(wrap)?;
            let code = generate_pairing_code(&mut rand::thread_rng(), 8);
            let expires_at = config.clock().now() + Duration::minutes(10);
            let payload = PairingPayload {
                node_id: identity.node_id.clone(),
                public_key: identity.public_key_hex(),
                endpoints: config
                    .server_url
                    .clone()
                    .map(|url| vec![url])
                    .unwrap_or_default(),
                features: reach_mesh::FeatureFlags::default(),
                code: code.clone(),
                expires_at,
                version: 1,
            };
            Ok(json!({
                "code": code,
                "expires_at": expires_at.to_rfc3339(),
                "payload": payload,
            }))
        }
    }
}

pub fn mesh_trust(config: &Config, node_id: &str) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let peers = PeerStore::new(store);
    peers.confirm(node_id, &CancelToken::new()).map_err(wrap)?;
    Ok(json!({
        "node_id": node_id,
        "trust_level": "trusted",
    }))
}

// ── delegation / proofs ─────────────────────────────────────────────────

pub fn delegate(
    config: &Config,
    peer_id: &str,
    pack_name: &str,
    input: &str,
) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let registry = open_registry(config)?;
    let identity =
        NodeIdentity::load_or_generate(&config.layout().keys_dir()).map_err(wrap)?;
    let peers = PeerStore::new(store.clone());
    let ledger = DelegationLedger::new(store.clone(), &config.data_dir);
    let ctx = CancelToken::new();

    let peer = peers
        .get(peer_id, &ctx)
        .map_err(wrap)?
        .ok_or_else(|| {
            ReachError::new(ErrorKind::TrustRefused, format!("unknown peer {peer_id}"))
        })?;
    let manifest = registry.get(pack_name).map_err(wrap)?;
    let pack_hash = reach_registry::content_hash(&manifest).map_err(wrap)?;
    let inputs: Value = serde_json::from_str(input).map_err(parse_error)?;
    let input_hash = reach_hash::hash_canonical(&inputs)?;

    let envelope = reach_poee::issue(
        &identity,
        &peer,
        &pack_hash,
        &input_hash,
        None,
        store.now(),
    )
    .map_err(wrap)?;
    ledger.record(&envelope, peer_id, &ctx).map_err(wrap)?;
    serde_json::to_value(&envelope).map_err(parse_error)
}

pub fn verify_proof(config: &Config, proof_path: &Path) -> Result<Value, ReachError> {
    let bytes = std::fs::read(proof_path).map_err(io_error)?;
    let proof: ExecutionProof = serde_json::from_slice(&bytes).map_err(parse_error)?;
    let store = open_store(config)?;
    let peers = PeerStore::new(store.clone());
    let ledger = DelegationLedger::new(store, &config.data_dir);
    reach_poee::verify_proof(
        &ledger,
        &peers,
        &proof,
        VerifyOptions::default(),
        &CancelToken::new(),
    )
    .map_err(wrap)?;
    Ok(json!({
        "delegation_id": proof.delegation_id,
        "signer": proof.signer_node_id,
        "verified": true,
    }))
}

// ── policy ──────────────────────────────────────────────────────────────

pub fn policy_eval(policy_path: &Path, facts_path: &Path) -> Result<Value, ReachError> {
    let policy: Policy =
        serde_json::from_slice(&std::fs::read(policy_path).map_err(io_error)?)
            .map_err(parse_error)?;
    let facts: RunFacts =
        serde_json::from_slice(&std::fs::read(facts_path).map_err(io_error)?)
            .map_err(parse_error)?;
    match reach_policy::evaluate(&policy, &facts) {
        Verdict::Allow => Ok(json!({"verdict": "allow"})),
        Verdict::Deny { reasons } => Err(reach_policy::denial_error(&reasons)),
    }
}

pub fn policy_fingerprint(policy_path: &Path) -> Result<Value, ReachError> {
    let policy: Policy =
        serde_json::from_slice(&std::fs::read(policy_path).map_err(io_error)?)
            .map_err(parse_error)?;
    Ok(json!({
        "alg": reach_hash::HASH_ALG,
        "fingerprint": policy.fingerprint()?,
    }))
}

// ── signing ─────────────────────────────────────────────────────────────

pub fn sign_run(config: &Config, run_id: Uuid) -> Result<Value, ReachError> {
    let store = open_store(config)?;
    let ctx = CancelToken::new();
    let run = store
        .get_run(run_id, &ctx)
        .map_err(wrap)?
        .ok_or_else(|| {
            ReachError::new(ErrorKind::ValidationFailure, format!("unknown run {run_id}"))
        })?;
    let fingerprint = run.fingerprint.ok_or_else(|| {
        ReachError::new(
            ErrorKind::ValidationFailure,
            format!("run {run_id} has no fingerprint to sign"),
        )
    })?;
    let identity =
        NodeIdentity::load_or_generate(&config.layout().keys_dir()).map_err(wrap)?;
    let signature = identity.sign_run(run_id, &fingerprint, store.now());

    let dir = config.layout().signatures_dir();
    std::fs::create_dir_all(&dir).map_err(io_error)?;
    let mut bytes = serde_json::to_vec_pretty(&signature).map_err(parse_error)?;
    bytes.push(b'\n');
    let path = dir.join(format!("{run_id}.sig.json"));
    std::fs::write(&path, bytes).map_err(io_error)?;
    Ok(json!({
        "run_id": run_id,
        "proof_hash": signature.proof_hash,
        "public_key": signature.public_key,
        "path": path.display().to_string(),
    }))
}

// ── self-test ───────────────────────────────────────────────────────────

pub async fn self_test(config: &Config) -> Result<Value, ReachError> {
    // Golden canonical-hash vectors.
    let golden = [
        (
            json!({"action": "deploy", "environment": "production"}),
            "165b836d9d6e803d5ce1bb8b7a01437ff68928f549887360cf13a0d551a66e85",
        ),
        (
            json!({}),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
        ),
        (
            json!({"a": 1, "b": 2, "c": {"z": 26, "a": 1}}),
            "24e4db09ae0e40a93e391725f9290725f3a8ffd15d33ed0bb39c394319087492",
        ),
    ];
    for (value, expected) in &golden {
        let actual = reach_hash::hash_canonical(value)?;
        if actual != *expected {
            return Err(ReachError::new(
                ErrorKind::InvariantViolation,
                format!("golden hash mismatch: expected {expected}, got {actual}"),
            ));
        }
    }

    // A throwaway end-to-end run against an in-memory-style store.
    let staging = tempfile_dir()?;
    let store = Arc::new(
        Store::open(
            &staging.join("selftest.db"),
            &staging.join("cas"),
            config.cas_options(),
            Arc::new(reach_core::FixedClock::from_epoch_secs(0)),
        )
        .map_err(wrap)?,
    );
    let executor = DagExecutor::new(
        store.clone(),
        Arc::new(RegistryToolClient::new(builtin_registry(None))),
    );
    let pack = self_test_pack();
    let run_id = Uuid::new_v4();
    let ctx = CancelToken::new();
    let outcome = executor
        .execute(
            ExecutionRequest {
                run_id,
                tenant_id: "self-test".into(),
                pack: pack.clone(),
                environment: "self-test".into(),
                federation_path: vec![],
                trust_scores: BTreeMap::new(),
            },
            &ctx,
        )
        .await
        .map_err(wrap)?;
    let capsule = reach_capsule::build(
        &store,
        run_id,
        CapsuleContext {
            pack: serde_json::to_value(&pack).map_err(parse_error)?,
            policy: None,
            registry_snapshot_hash: None,
        },
        &ctx,
    )
    .map_err(wrap)?;
    let report = reach_capsule::replay(&capsule).map_err(wrap)?;
    if report.fingerprint != outcome.fingerprint {
        return Err(ReachError::new(
            ErrorKind::InvariantViolation,
            "replay fingerprint diverged from execution fingerprint",
        ));
    }
    let _ = std::fs::remove_dir_all(&staging);
    Ok(json!({
        "golden_hashes": "ok",
        "execute_build_replay": "ok",
        "fingerprint": outcome.fingerprint,
    }))
}

fn tempfile_dir() -> Result<std::path::PathBuf, ReachError> {
    let dir = std::env::temp_dir().join(format!("reach-selftest-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).map_err(io_error)?;
    Ok(dir)
}

fn self_test_pack() -> reach_core::PackManifest {
    reach_core::PackManifest {
        spec_version: reach_core::SPEC_VERSION.into(),
        name: "self-test".into(),
        version: "0.0.0".into(),
        author: "reach".into(),
        compatibility: reach_core::Compatibility {
            engine_range: "*".into(),
            schema_range: "*".into(),
            required_caps: vec![],
        },
        metadata: BTreeMap::new(),
        dag: reach_core::PackDag {
            nodes: vec![
                reach_core::PackNode {
                    id: "echo".into(),
                    node_type: "task".into(),
                    action: "core.echo".into(),
                    inputs: json!({"probe": true}),
                },
                reach_core::PackNode {
                    id: "sum".into(),
                    node_type: "task".into(),
                    action: "core.checksum".into(),
                    inputs: json!({"probe": true}),
                },
            ],
            edges: vec![reach_core::PackEdge {
                from: "echo".into(),
                to: "sum".into(),
            }],
        },
        signing: None,
    }
}
