// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "The stable contract for the Reach deterministic execution runner."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! reach-core
//!
//! Wire-facing contract types shared by every Reach subsystem: packs, jobs,
//! runs, events, snapshots, capsules, and the error taxonomy. If you only
//! take one dependency, take this one.

/// Cancellation primitives propagated through all I/O.
pub mod cancel;
/// Deterministic and system clocks.
pub mod clock;
/// Pack DAG ordering and well-formedness.
pub mod dag;
/// Structured error taxonomy with stable kinds and correlation ids.
pub mod error;
/// Event-log fingerprinting.
pub mod fingerprint;

pub use cancel::CancelToken;
pub use clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use dag::topo_order;
pub use error::{ErrorKind, ReachError};
pub use fingerprint::run_fingerprint;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Pack manifest schema version currently supported by this engine.
pub const SPEC_VERSION: &str = "1.0";

/// Capsule format version written by this engine.
pub const CAPSULE_SPEC_VERSION: &str = "capsule/v1";

/// The fixed timestamp written into capsule manifests.
///
/// Capsule creation time is excluded from hash inputs; pinning it to epoch
/// zero keeps capsule bytes reproducible.
pub const EPOCH_ZERO: &str = "1970-01-01T00:00:00Z";

// ---------------------------------------------------------------------------
// Packs
// ---------------------------------------------------------------------------

/// A declarative, hash-identified DAG of actions.
///
/// Packs are immutable by content hash: two manifests with the same
/// canonical form are the same pack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PackManifest {
    /// Manifest schema version; must equal [`SPEC_VERSION`].
    pub spec_version: String,
    /// Pack name, unique within a registry.
    pub name: String,
    /// Pack version string.
    pub version: String,
    /// Author attribution.
    #[serde(default)]
    pub author: String,
    /// Engine and schema compatibility constraints.
    pub compatibility: Compatibility,
    /// Free-form metadata; keys are sorted for deterministic hashing.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// The workload graph.
    pub dag: PackDag,
    /// Optional signing requirements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<PackSigning>,
}

/// Compatibility ranges a pack declares against the host.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Compatibility {
    /// Semver range the engine version must satisfy.
    pub engine_range: String,
    /// Semver range the manifest schema version must satisfy.
    pub schema_range: String,
    /// Capabilities the executing node must expose.
    #[serde(default)]
    pub required_caps: Vec<String>,
}

/// Signing requirements carried by a pack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PackSigning {
    /// Whether the pack must be signed before it is runnable.
    pub required: bool,
}

/// The DAG portion of a pack manifest.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PackDag {
    /// Executable nodes.
    pub nodes: Vec<PackNode>,
    /// Directed edges between node ids.
    #[serde(default)]
    pub edges: Vec<PackEdge>,
}

/// A single executable node in a pack DAG.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PackNode {
    /// Node identifier, unique within the pack.
    pub id: String,
    /// Node kind discriminator (e.g. `"task"`).
    #[serde(rename = "type")]
    pub node_type: String,
    /// Action name resolved through the capability registry.
    pub action: String,
    /// Inputs passed to the action.
    #[serde(default)]
    pub inputs: serde_json::Value,
}

/// A directed edge `from → to` in a pack DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PackEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
}

/// One lockfile entry: a pinned pack resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LockEntry {
    /// Resolved version.
    pub version: String,
    /// Canonical content hash of the manifest.
    pub content_hash: String,
    /// Where the pack came from (path, archive, git URL).
    pub source: String,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Lifecycle states of a durable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be leased.
    Pending,
    /// Exclusively claimed by a worker until the lease expires.
    Leased,
    /// Failed and waiting out its backoff window.
    RetryWait,
    /// Exhausted its retry budget; terminal.
    DeadLetter,
    /// Crashed its worker on every lease cycle; terminal, alert raised.
    Quarantined,
    /// Acked by a worker; terminal.
    Completed,
}

impl JobStatus {
    /// Returns `true` for states a job can never leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::DeadLetter | JobStatus::Quarantined | JobStatus::Completed
        )
    }

    /// The stable string stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::RetryWait => "retry_wait",
            JobStatus::DeadLetter => "dead_letter",
            JobStatus::Quarantined => "quarantined",
            JobStatus::Completed => "completed",
        }
    }

    /// Parse the stable database string form.
    ///
    /// # Errors
    ///
    /// Returns the offending string if it is not a known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "leased" => Ok(JobStatus::Leased),
            "retry_wait" => Ok(JobStatus::RetryWait),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            "quarantined" => Ok(JobStatus::Quarantined),
            "completed" => Ok(JobStatus::Completed),
            other => Err(other.to_string()),
        }
    }
}

/// What a caller submits to the queue.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Owning tenant.
    pub tenant_id: String,
    /// Optional session grouping for fairness and budgets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Lower number leases first.
    pub priority: i64,
    /// Reference to the pack to execute (name or content hash).
    pub pack_ref: String,
    /// Dedupe key; `(tenant_id, idempotency_key)` is globally unique.
    pub idempotency_key: String,
    /// Retry budget before the job dead-letters.
    pub max_attempts: u32,
}

/// A durable job row.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Job identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Optional session grouping.
    pub session_id: Option<String>,
    /// Scheduling priority; lower leases first.
    pub priority: i64,
    /// Pack reference.
    pub pack_ref: String,
    /// Dedupe key.
    pub idempotency_key: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Retries consumed so far.
    pub attempts: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// Earliest instant the job is eligible for leasing.
    pub next_visible_at: DateTime<Utc>,
    /// Active lease, if any.
    pub lease_id: Option<Uuid>,
    /// When the active lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// One attempt in a job's append-only attempt history.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobAttempt {
    /// Owning job.
    pub job_id: Uuid,
    /// Monotonic attempt number, starting at 1.
    pub attempt_no: u32,
    /// When the worker started the attempt.
    pub started_at: DateTime<Utc>,
    /// When the attempt ended, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Outcome string (`acked`, `nacked`, `lease_expired`, `crashed`).
    pub outcome: String,
    /// Failure classification supplied on nack.
    pub failure_class: Option<String>,
}

/// Why an otherwise-eligible job was passed over by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeferralReason {
    /// The session has exhausted its concurrent-lease budget.
    SessionBudget,
    /// The node is at its concurrent-lease capacity.
    NodeCapacity,
}

// ---------------------------------------------------------------------------
// Runs, events, snapshots
// ---------------------------------------------------------------------------

/// One execution of a pack.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    /// Run identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// The pack that was executed.
    pub pack_ref: String,
    /// Event-log fingerprint; written exactly once, after the log completes.
    pub fingerprint: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Environment label (e.g. `production`).
    pub environment: String,
    /// Nodes the run was delegated through, in order.
    #[serde(default)]
    pub federation_path: Vec<String>,
    /// Peer trust scores observed at execution time.
    #[serde(default)]
    pub trust_scores: BTreeMap<String, f64>,
}

/// An immutable, ordered event row.
///
/// `id` is the only authoritative ordering; `created_at` is informational.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    /// Monotonic id assigned by the database. No reuse, no gaps.
    pub id: i64,
    /// Owning run.
    pub run_id: Uuid,
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Wall-clock time of the append. Never used for ordering.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Project this event to its hash-input form.
    #[must_use]
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            id: self.id,
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// The portion of an event that contributes to fingerprints and capsules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EventRecord {
    /// Monotonic event id.
    pub id: i64,
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
}

/// A point-in-time materialization of run state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Snapshot {
    /// Owning run.
    pub run_id: Uuid,
    /// Highest event id folded into `state_payload`.
    pub last_event_id: i64,
    /// Materialized state.
    pub state_payload: serde_json::Value,
    /// Canonical hash of `state_payload`; verified on every read.
    pub state_hash: String,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// One append-only audit entry. Audit rows are never pruned.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    /// Owning tenant.
    pub tenant_id: String,
    /// Related run, if any.
    pub run_id: Option<Uuid>,
    /// Entry type discriminator.
    #[serde(rename = "type")]
    pub entry_type: String,
    /// Entry payload.
    pub payload: serde_json::Value,
    /// Wall-clock time of the append.
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Capsules
// ---------------------------------------------------------------------------

/// Capsule manifest: everything needed to verify a run without the engine's
/// database.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapsuleManifest {
    /// Capsule format version.
    pub spec_version: String,
    /// The run this capsule archives.
    pub run_id: Uuid,
    /// Fingerprint of the embedded event log.
    pub run_fingerprint: String,
    /// Hash algorithm tag ([`reach_hash::HASH_ALG`]).
    pub hash_alg: String,
    /// Canonical hash of the registry index at execution time.
    pub registry_snapshot_hash: Option<String>,
    /// The pack manifest that was executed.
    pub pack: serde_json::Value,
    /// The governance policy in force, if any.
    pub policy: Option<serde_json::Value>,
    /// Delegation hops, in order.
    #[serde(default)]
    pub federation_path: Vec<String>,
    /// Peer trust scores observed at execution time.
    #[serde(default)]
    pub trust_scores: BTreeMap<String, f64>,
    /// Merkle root over the run's audit chain.
    pub audit_root: String,
    /// Environment label.
    pub environment: String,
    /// Always [`EPOCH_ZERO`]; excluded from hash inputs.
    pub created_at: String,
}

/// Portable, self-verifying archive of a run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Capsule {
    /// Verification metadata.
    pub manifest: CapsuleManifest,
    /// The complete event log, in id order.
    pub event_log: Vec<EventRecord>,
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

/// Detached signature over a run proof, as written to
/// `signatures/<run_id>.sig.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunSignature {
    /// The signed run.
    pub run_id: Uuid,
    /// Hash being attested (the run fingerprint).
    pub proof_hash: String,
    /// Signature algorithm (`ed25519`).
    pub algorithm: String,
    /// Hex-encoded public key of the signer.
    pub public_key: String,
    /// Hex-encoded signature over `run_id || proof_hash`.
    pub signature_hex: String,
    /// When the signature was produced.
    pub signed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_db_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Leased,
            JobStatus::RetryWait,
            JobStatus::DeadLetter,
            JobStatus::Quarantined,
            JobStatus::Completed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("nonsense").is_err());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(JobStatus::Quarantined.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Leased.is_terminal());
        assert!(!JobStatus::RetryWait.is_terminal());
    }

    #[test]
    fn event_record_drops_created_at() {
        let event = Event {
            id: 7,
            run_id: Uuid::nil(),
            event_type: "node_completed".into(),
            payload: serde_json::json!({"node_id": "a"}),
            created_at: Utc::now(),
        };
        let record = event.to_record();
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("created_at").is_none());
        assert_eq!(value["type"], "node_completed");
    }

    #[test]
    fn manifest_serde_round_trip() {
        let manifest = PackManifest {
            spec_version: SPEC_VERSION.into(),
            name: "hello".into(),
            version: "0.1.0".into(),
            author: "tests".into(),
            compatibility: Compatibility {
                engine_range: ">=0.1".into(),
                schema_range: "^1.0".into(),
                required_caps: vec!["echo".into()],
            },
            metadata: BTreeMap::new(),
            dag: PackDag {
                nodes: vec![PackNode {
                    id: "n1".into(),
                    node_type: "task".into(),
                    action: "echo".into(),
                    inputs: serde_json::json!({"msg": "hi"}),
                }],
                edges: vec![],
            },
            signing: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: PackManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "hello");
        assert_eq!(back.dag.nodes[0].action, "echo");
    }
}
