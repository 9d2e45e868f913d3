// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scheduler scenarios: fair ordering, retry redelivery,
//! poison-pill quarantine, and concurrent lease disjointness.

use chrono::Duration;
use reach_core::{CancelToken, JobSpec, JobStatus, ManualClock};
use reach_queue::{JobQueue, LeaseOutcome, QueueOptions, SchedulerLimits};
use reach_store::{CasOptions, Store};
use std::collections::BTreeSet;
use std::sync::Arc;

fn queue() -> (tempfile::TempDir, Arc<JobQueue>, Arc<ManualClock>) {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::from_epoch_secs(1_700_000_000));
    let store = Store::open(
        &dir.path().join("reach.db"),
        &dir.path().join("cas"),
        CasOptions::default(),
        clock.clone(),
    )
    .unwrap();
    let queue = JobQueue::new(
        Arc::new(store),
        QueueOptions {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            default_max_attempts: 3,
            limits: SchedulerLimits::default(),
        },
    );
    (dir, Arc::new(queue), clock)
}

fn spec(tenant: &str, session: Option<&str>, priority: i64, key: &str) -> JobSpec {
    JobSpec {
        tenant_id: tenant.into(),
        session_id: session.map(String::from),
        priority,
        pack_ref: "demo@0.1.0".into(),
        idempotency_key: key.into(),
        max_attempts: 3,
    }
}

// S6: six jobs lease back in the exact total tie-break order.
#[test]
fn lease_fairness_follows_the_total_order() {
    let (_dir, queue, clock) = queue();
    let ctx = CancelToken::new();
    let inserts = [
        (1, "T1", "S1"),
        (1, "T1", "S2"),
        (1, "T2", "S1"),
        (0, "T2", "S1"),
        (0, "T1", "S1"),
        (1, "T1", "S1"),
    ];
    let mut ids = Vec::new();
    for (i, (priority, tenant, session)) in inserts.iter().enumerate() {
        let job = queue
            .enqueue(&spec(tenant, Some(session), *priority, &format!("k{i}")), &ctx)
            .unwrap();
        ids.push(job.id);
        clock.advance(Duration::milliseconds(5));
    }
    let mut order = Vec::new();
    for _ in 0..6 {
        match queue.lease("w", Duration::seconds(60), &ctx).unwrap() {
            LeaseOutcome::Leased(leased) => order.push(leased.job.id),
            LeaseOutcome::Empty { .. } => panic!("expected six leasable jobs"),
        }
    }
    // (priority, tenant, session, created_at, id): indexes into `inserts`.
    let expected = vec![ids[4], ids[3], ids[0], ids[5], ids[1], ids[2]];
    assert_eq!(order, expected);
    // Duplicates impossible.
    let unique: BTreeSet<_> = order.iter().collect();
    assert_eq!(unique.len(), 6);
}

// S2: a job that crashes its worker on every lease is quarantined after
// max_attempts cycles and never blocks the next valid job.
#[test]
fn poison_pill_quarantines_and_unblocks_the_queue() {
    let (_dir, queue, clock) = queue();
    let ctx = CancelToken::new();
    let poison = queue
        .enqueue(&spec("t1", None, 0, "malicious-pack-v1"), &ctx)
        .unwrap();
    for _ in 0..3 {
        match queue.lease("w", Duration::seconds(5), &ctx).unwrap() {
            LeaseOutcome::Leased(leased) => assert_eq!(leased.job.id, poison.id),
            LeaseOutcome::Empty { .. } => panic!("poison job should lease"),
        }
        clock.advance(Duration::seconds(6));
        queue.sweep_expired(true, &ctx).unwrap();
    }
    assert_eq!(
        queue.get_job(poison.id, &ctx).unwrap().unwrap().status,
        JobStatus::Quarantined
    );
    let valid = queue.enqueue(&spec("t1", None, 1, "valid"), &ctx).unwrap();
    match queue.lease("w", Duration::seconds(5), &ctx).unwrap() {
        LeaseOutcome::Leased(leased) => assert_eq!(leased.job.id, valid.id),
        LeaseOutcome::Empty { .. } => panic!("valid job should lease after quarantine"),
    }
}

// Invariant 8: nack then lease after backoff returns the same job;
// attempts strictly increase; dead_letter is terminal.
#[test]
fn retry_cycle_returns_the_same_job_until_dead_letter() {
    let (_dir, queue, clock) = queue();
    let ctx = CancelToken::new();
    let job = queue.enqueue(&spec("t1", None, 1, "retry-me"), &ctx).unwrap();
    let mut last_attempts = 0;
    for round in 1..=3 {
        let leased = match queue.lease("w", Duration::seconds(60), &ctx).unwrap() {
            LeaseOutcome::Leased(leased) => *leased,
            LeaseOutcome::Empty { .. } => panic!("round {round}: job should be visible"),
        };
        assert_eq!(leased.job.id, job.id);
        let after = queue.nack(leased.lease_id, "boom", &ctx).unwrap();
        assert!(after.attempts > last_attempts);
        last_attempts = after.attempts;
        clock.advance(Duration::seconds(60));
    }
    let settled = queue.get_job(job.id, &ctx).unwrap().unwrap();
    assert_eq!(settled.status, JobStatus::DeadLetter);
    assert_eq!(settled.attempts, 3);
    assert!(matches!(
        queue.lease("w", Duration::seconds(60), &ctx).unwrap(),
        LeaseOutcome::Empty { .. }
    ));
}

// Invariant 6: concurrent lease calls return disjoint jobs.
#[test]
fn concurrent_workers_lease_disjoint_jobs() {
    let (_dir, queue, _clock) = queue();
    let ctx = CancelToken::new();
    for i in 0..20 {
        queue
            .enqueue(&spec("t1", None, 1, &format!("job-{i}")), &ctx)
            .unwrap();
    }
    let mut handles = Vec::new();
    for worker in 0..4 {
        let queue = queue.clone();
        handles.push(std::thread::spawn(move || {
            let ctx = CancelToken::new();
            let mut mine = Vec::new();
            loop {
                match queue
                    .lease(&format!("w{worker}"), Duration::seconds(60), &ctx)
                    .unwrap()
                {
                    LeaseOutcome::Leased(leased) => mine.push(leased.job.id),
                    LeaseOutcome::Empty { .. } => break,
                }
            }
            mine
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    assert_eq!(all.len(), 20, "every job leased exactly once");
    let unique: BTreeSet<_> = all.iter().collect();
    assert_eq!(unique.len(), 20, "no job leased twice");
}

// Idempotent submission across the full cycle.
#[test]
fn resubmission_is_idempotent_even_after_completion() {
    let (_dir, queue, _clock) = queue();
    let ctx = CancelToken::new();
    let first = queue.enqueue(&spec("t1", None, 1, "once"), &ctx).unwrap();
    let leased = match queue.lease("w", Duration::seconds(60), &ctx).unwrap() {
        LeaseOutcome::Leased(leased) => *leased,
        LeaseOutcome::Empty { .. } => panic!("job should lease"),
    };
    queue
        .ack(leased.lease_id, &serde_json::json!({"ok": true}), &ctx)
        .unwrap();
    let again = queue.enqueue(&spec("t1", None, 1, "once"), &ctx).unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(again.status, JobStatus::Completed);
}
