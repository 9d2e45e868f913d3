// SPDX-License-Identifier: MIT OR Apache-2.0
//! The whole pipeline in one place: register a pack, enqueue a job, lease
//! it as a worker, execute the DAG, ack with the fingerprint, archive the
//! capsule, and gate the result through governance.

use chrono::Duration;
use reach_capsule::CapsuleContext;
use reach_core::{CancelToken, FixedClock, JobSpec, JobStatus};
use reach_engine::{DagExecutor, ExecutionRequest, RegistryToolClient, builtin_registry};
use reach_policy::{Policy, RunFacts, Verdict};
use reach_queue::{JobQueue, LeaseOutcome, QueueOptions};
use reach_registry::{ArchiveLimits, IngestSource, PackRegistry, ValidationOptions};
use reach_store::{CasOptions, Store};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

const PACK_JSON: &str = r#"{
    "spec_version": "1.0",
    "name": "pipeline-demo",
    "version": "0.1.0",
    "author": "tests",
    "compatibility": {"engine_range": "*", "schema_range": "*", "required_caps": ["core.echo"]},
    "dag": {
        "nodes": [
            {"id": "fetch", "type": "task", "action": "core.echo", "inputs": {"payload": "data"}},
            {"id": "digest", "type": "task", "action": "core.checksum", "inputs": {"of": "data"}}
        ],
        "edges": [{"from": "fetch", "to": "digest"}]
    }
}"#;

#[tokio::test]
async fn pack_to_verified_capsule() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancelToken::new();

    // Register the pack.
    let pack_src = dir.path().join("pack-src");
    std::fs::create_dir_all(&pack_src).unwrap();
    std::fs::write(pack_src.join("pack.json"), PACK_JSON).unwrap();
    let capability_names: Vec<String> = builtin_registry(None)
        .names()
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let registry = PackRegistry::open(
        dir.path(),
        ValidationOptions {
            available_caps: capability_names,
            ..ValidationOptions::default()
        },
        ArchiveLimits::default(),
    )
    .unwrap();
    let (manifest, entry) = registry
        .add_pack(&IngestSource::Directory(pack_src), false)
        .unwrap();
    assert_eq!(entry.content_hash.len(), 64);

    // Enqueue a job for it.
    let store = Arc::new(
        Store::open(
            &dir.path().join("reach.db"),
            &dir.path().join("cas"),
            CasOptions::default(),
            Arc::new(FixedClock::from_epoch_secs(0)),
        )
        .unwrap(),
    );
    let queue = JobQueue::new(store.clone(), QueueOptions::default());
    queue
        .enqueue(
            &JobSpec {
                tenant_id: "t1".into(),
                session_id: None,
                priority: 1,
                pack_ref: format!("{}@{}", manifest.name, manifest.version),
                idempotency_key: "pipeline-1".into(),
                max_attempts: 3,
            },
            &ctx,
        )
        .unwrap();

    // A worker leases, executes, and acks with the fingerprint.
    let leased = match queue.lease("worker-1", Duration::seconds(60), &ctx).unwrap() {
        LeaseOutcome::Leased(leased) => *leased,
        LeaseOutcome::Empty { .. } => panic!("job should lease"),
    };
    let executor = DagExecutor::new(
        store.clone(),
        Arc::new(RegistryToolClient::new(builtin_registry(None))),
    );
    let run_id = Uuid::new_v4();
    store
        .append_audit("t1", Some(run_id), "job_leased", &json!({"job_id": leased.job.id}), &ctx)
        .unwrap();
    let outcome = executor
        .execute(
            ExecutionRequest {
                run_id,
                tenant_id: "t1".into(),
                pack: manifest.clone(),
                environment: "ci".into(),
                federation_path: vec![],
                trust_scores: BTreeMap::new(),
            },
            &ctx,
        )
        .await
        .unwrap();
    let acked = queue
        .ack(
            leased.lease_id,
            &json!({"run_id": run_id, "fingerprint": outcome.fingerprint}),
            &ctx,
        )
        .unwrap();
    assert_eq!(acked.status, JobStatus::Completed);

    // Archive and verify the capsule.
    let capsule = reach_capsule::build(
        &store,
        run_id,
        CapsuleContext {
            pack: serde_json::to_value(&manifest).unwrap(),
            policy: None,
            registry_snapshot_hash: Some(registry.snapshot_hash().unwrap()),
        },
        &ctx,
    )
    .unwrap();
    reach_capsule::verify(&capsule).unwrap();
    let report = reach_capsule::replay(&capsule).unwrap();
    assert_eq!(report.fingerprint, outcome.fingerprint);
    assert_eq!(report.state.results["fetch"], json!({"payload": "data"}));

    // Capsule file round-trip.
    let path = reach_capsule::write_file(&capsule, &dir.path().join("capsules")).unwrap();
    let loaded = reach_capsule::read_file(&path).unwrap();
    reach_capsule::verify(&loaded).unwrap();

    // Governance allows this deterministic, quiet run.
    let verdict = reach_policy::evaluate(
        &Policy::baseline(),
        &RunFacts {
            deterministic: true,
            signed: false,
            external_deps: 0,
            plugins_pinned: true,
            reproducibility: 1.0,
            branch: "main".into(),
            chaos_enabled: false,
        },
    );
    assert_eq!(verdict, Verdict::Allow);
}

#[tokio::test]
async fn audit_chain_binds_into_the_capsule_root() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = CancelToken::new();
    let store = Arc::new(
        Store::open(
            &dir.path().join("reach.db"),
            &dir.path().join("cas"),
            CasOptions::default(),
            Arc::new(FixedClock::from_epoch_secs(0)),
        )
        .unwrap(),
    );
    let executor = DagExecutor::new(
        store.clone(),
        Arc::new(RegistryToolClient::new(builtin_registry(None))),
    );
    let run_id = Uuid::new_v4();
    store
        .append_audit("t1", Some(run_id), "run_submitted", &json!({"by": "tests"}), &ctx)
        .unwrap();
    let manifest: reach_core::PackManifest = serde_json::from_str(PACK_JSON).unwrap();
    executor
        .execute(
            ExecutionRequest {
                run_id,
                tenant_id: "t1".into(),
                pack: manifest,
                environment: "ci".into(),
                federation_path: vec![],
                trust_scores: BTreeMap::new(),
            },
            &ctx,
        )
        .await
        .unwrap();
    let capsule =
        reach_capsule::build(&store, run_id, CapsuleContext::default(), &ctx).unwrap();
    // One audit entry: root equals the single leaf hash.
    let leaf = json!({
        "type": "run_submitted",
        "payload": {"by": "tests"},
        "tenant_id": "t1",
    });
    assert_eq!(
        capsule.manifest.audit_root,
        reach_hash::merkle_root(&[leaf]).unwrap()
    );
}
