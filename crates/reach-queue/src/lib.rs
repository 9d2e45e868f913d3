// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Durable job queue with leasing, fair ordering, deterministic backoff, and quarantine."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The queue is backed by the Reach store's jobs tables. Selection order is
//! the total order `(priority, tenant_id, session_id, created_at, id)`, all
//! ascending, so tenant and session fairness follow from the projection.
//! Leases are flipped under a conditional update inside an immediate
//! transaction: two workers leasing concurrently always receive disjoint
//! jobs.
//!
//! Failure accounting keeps two ledgers. Retries consumed by `nack` and by
//! cleanly expired leases increment `attempts` toward `dead_letter`. Worker
//! crashes (unclean shutdown) increment a separate `crash_count` toward
//! `quarantined`, so a deterministic poison pill terminates without eating
//! the retry budget of jobs that merely hit infrastructure trouble.

mod backoff;

pub use backoff::backoff_ms;

use chrono::{DateTime, Duration, Utc};
use reach_core::{CancelToken, DeferralReason, ErrorKind, Job, JobSpec, JobStatus, ReachError};
use reach_store::{Store, StoreError};
use rusqlite::{OptionalExtension, Transaction, params};
use std::sync::Arc;
use uuid::Uuid;

/// Errors from queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No leased job matches the lease id.
    #[error("unknown or expired lease {0}")]
    UnknownLease(Uuid),

    /// A row failed to decode.
    #[error("corrupt job row: {0}")]
    Corrupt(String),
}

impl QueueError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Store(e) => e.kind(),
            QueueError::UnknownLease(_) => ErrorKind::ValidationFailure,
            QueueError::Corrupt(_) => ErrorKind::ValidationFailure,
        }
    }
}

impl From<QueueError> for ReachError {
    fn from(err: QueueError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}

/// Concurrency ceilings consulted during lease selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerLimits {
    /// Max jobs leased at once across the node.
    pub max_leased_total: Option<u32>,
    /// Max jobs leased at once per session.
    pub max_leased_per_session: Option<u32>,
}

/// Queue tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// First retry delay.
    pub backoff_base_ms: u64,
    /// Retry delay ceiling (before jitter).
    pub backoff_cap_ms: u64,
    /// Retry budget used when a [`JobSpec`] leaves `max_attempts` at zero.
    pub default_max_attempts: u32,
    /// Concurrency ceilings.
    pub limits: SchedulerLimits,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            default_max_attempts: 5,
            limits: SchedulerLimits::default(),
        }
    }
}

/// A job handed to a worker together with its lease.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    /// The leased job snapshot.
    pub job: Job,
    /// Exclusive claim id; pass back to `ack`/`nack`.
    pub lease_id: Uuid,
    /// Deadline for the work.
    pub lease_expires_at: DateTime<Utc>,
}

/// Why an eligible job was passed over in this lease call.
#[derive(Debug, Clone)]
pub struct Deferral {
    /// The deferred job.
    pub job_id: Uuid,
    /// The ceiling that deferred it.
    pub reason: DeferralReason,
}

/// Result of a lease call.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// A job was claimed.
    Leased(Box<LeasedJob>),
    /// Nothing claimable right now.
    Empty {
        /// Jobs that were eligible but deferred by a ceiling.
        deferrals: Vec<Deferral>,
    },
}

/// What the sweeper did to expired leases.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Returned to `pending` with attempts untouched (worker crash).
    pub requeued: Vec<Uuid>,
    /// Moved to `retry_wait` after a clean lease expiry.
    pub retried: Vec<Uuid>,
    /// Moved to `dead_letter`.
    pub dead_lettered: Vec<Uuid>,
    /// Moved to `quarantined` with an alert raised.
    pub quarantined: Vec<Uuid>,
}

/// Handle to the durable queue.
pub struct JobQueue {
    store: Arc<Store>,
    options: QueueOptions,
}

impl JobQueue {
    /// Create a queue over the given store.
    #[must_use]
    pub fn new(store: Arc<Store>, options: QueueOptions) -> Self {
        Self { store, options }
    }

    /// Submit a job.
    ///
    /// `(tenant_id, idempotency_key)` is globally unique: resubmitting
    /// returns the existing job and never creates a second one.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or storage error.
    pub fn enqueue(&self, spec: &JobSpec, ctx: &CancelToken) -> Result<Job, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        let now = self.store.now();
        let job = Job {
            id: Uuid::new_v4(),
            tenant_id: spec.tenant_id.clone(),
            session_id: spec.session_id.clone(),
            priority: spec.priority,
            pack_ref: spec.pack_ref.clone(),
            idempotency_key: spec.idempotency_key.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: if spec.max_attempts == 0 {
                self.options.default_max_attempts
            } else {
                spec.max_attempts
            },
            next_visible_at: now,
            lease_id: None,
            lease_expires_at: None,
            created_at: now,
        };
        let inserted = self.store.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO jobs \
                 (id, tenant_id, session_id, priority, pack_ref, idempotency_key, status, \
                  attempts, max_attempts, next_visible_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id.to_string(),
                    job.tenant_id,
                    job.session_id,
                    job.priority,
                    job.pack_ref,
                    job.idempotency_key,
                    job.status.as_str(),
                    job.attempts,
                    job.max_attempts,
                    fmt_ts(job.next_visible_at),
                    fmt_ts(job.created_at)
                ],
            )?;
            Ok(changed == 1)
        })?;
        if inserted {
            tracing::debug!(job_id = %job.id, tenant = %job.tenant_id, "job enqueued");
            return Ok(job);
        }
        // Duplicate idempotency key: hand back the existing row.
        self.store
            .with_conn(|conn| {
                conn.query_row(
                    &format!("{JOB_COLUMNS} WHERE tenant_id = ?1 AND idempotency_key = ?2"),
                    params![spec.tenant_id, spec.idempotency_key],
                    job_from_row,
                )
                .optional()
                .map_err(StoreError::from)
            })?
            .ok_or_else(|| QueueError::Corrupt("duplicate insert lost its twin".into()))
            .and_then(decode_job)
    }

    /// Atomically claim the first eligible job.
    ///
    /// Eligible means `status ∈ {pending, retry_wait}` and
    /// `next_visible_at <= now`; selection follows the total tie-break
    /// order. Jobs skipped by a concurrency ceiling are reported as
    /// deferrals.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or storage error.
    pub fn lease(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        ctx: &CancelToken,
    ) -> Result<LeaseOutcome, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        let now = self.store.now();
        let lease_id = Uuid::new_v4();
        let expires = now + lease_duration;
        let limits = self.options.limits;
        let outcome = self.store.with_tx(|tx| {
            let leased_total = count_leased(tx, None)?;
            let mut stmt = tx.prepare(&format!(
                "{JOB_COLUMNS} WHERE status IN ('pending', 'retry_wait') \
                 AND next_visible_at <= ?1 \
                 ORDER BY priority ASC, tenant_id ASC, session_id ASC, created_at ASC, id ASC"
            ))?;
            let candidates = stmt
                .query_map(params![fmt_ts(now)], job_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            drop(stmt);

            let mut deferrals = Vec::new();
            for row in candidates {
                let job = decode_job(row).map_err(queue_to_store)?;
                if let Some(cap) = limits.max_leased_total
                    && leased_total >= i64::from(cap)
                {
                    deferrals.push(Deferral {
                        job_id: job.id,
                        reason: DeferralReason::NodeCapacity,
                    });
                    continue;
                }
                if let (Some(cap), Some(session)) =
                    (limits.max_leased_per_session, job.session_id.as_deref())
                    && count_leased(tx, Some(session))? >= i64::from(cap)
                {
                    deferrals.push(Deferral {
                        job_id: job.id,
                        reason: DeferralReason::SessionBudget,
                    });
                    continue;
                }
                // Conditional flip; a row claimed by a racing worker no
                // longer matches the status predicate.
                let changed = tx.execute(
                    "UPDATE jobs SET status = 'leased', lease_id = ?1, lease_expires_at = ?2 \
                     WHERE id = ?3 AND status IN ('pending', 'retry_wait')",
                    params![lease_id.to_string(), fmt_ts(expires), job.id.to_string()],
                )?;
                if changed == 0 {
                    continue;
                }
                let attempt_no: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(attempt_no), 0) + 1 FROM job_attempts WHERE job_id = ?1",
                    params![job.id.to_string()],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO job_attempts (job_id, attempt_no, started_at, outcome) \
                     VALUES (?1, ?2, ?3, 'running')",
                    params![job.id.to_string(), attempt_no, fmt_ts(now)],
                )?;
                let mut leased = job;
                leased.status = JobStatus::Leased;
                leased.lease_id = Some(lease_id);
                leased.lease_expires_at = Some(expires);
                return Ok(LeaseOutcome::Leased(Box::new(LeasedJob {
                    job: leased,
                    lease_id,
                    lease_expires_at: expires,
                })));
            }
            Ok(LeaseOutcome::Empty { deferrals })
        })?;
        if let LeaseOutcome::Leased(leased) = &outcome {
            tracing::debug!(
                job_id = %leased.job.id,
                worker = worker_id,
                lease = %leased.lease_id,
                "job leased"
            );
        }
        Ok(outcome)
    }

    /// Complete a leased job and record its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownLease`] if no leased job matches.
    pub fn ack(
        &self,
        lease_id: Uuid,
        outcome: &serde_json::Value,
        ctx: &CancelToken,
    ) -> Result<Job, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        let now = self.store.now();
        let outcome_text = serde_json::to_string(outcome)
            .map_err(|e| QueueError::Corrupt(format!("unencodable outcome: {e}")))?;
        let job = self.store.with_tx(|tx| {
            let Some(mut job) = job_by_lease(tx, lease_id)? else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE jobs SET status = 'completed', lease_id = NULL, lease_expires_at = NULL \
                 WHERE id = ?1",
                params![job.id.to_string()],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO job_results (job_id, outcome, recorded_at) \
                 VALUES (?1, ?2, ?3)",
                params![job.id.to_string(), outcome_text, fmt_ts(now)],
            )?;
            finish_attempt(tx, job.id, now, "acked", None)?;
            job.status = JobStatus::Completed;
            job.lease_id = None;
            job.lease_expires_at = None;
            Ok(Some(job))
        })?;
        let job = job.ok_or(QueueError::UnknownLease(lease_id))?;
        tracing::debug!(job_id = %job.id, "job completed");
        Ok(job)
    }

    /// Fail a leased job.
    ///
    /// Consumes one retry attempt; the job either waits out its backoff or
    /// dead-letters once the budget is gone.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownLease`] if no leased job matches.
    pub fn nack(
        &self,
        lease_id: Uuid,
        failure_class: &str,
        ctx: &CancelToken,
    ) -> Result<Job, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        let now = self.store.now();
        let options = self.options;
        let job = self.store.with_tx(|tx| {
            let Some(mut job) = job_by_lease(tx, lease_id)? else {
                return Ok(None);
            };
            job.attempts += 1;
            if job.attempts < job.max_attempts {
                let delay = backoff_ms(
                    options.backoff_base_ms,
                    options.backoff_cap_ms,
                    job.attempts,
                    job.id,
                );
                job.status = JobStatus::RetryWait;
                job.next_visible_at = now + Duration::milliseconds(delay as i64);
            } else {
                job.status = JobStatus::DeadLetter;
            }
            tx.execute(
                "UPDATE jobs SET status = ?1, attempts = ?2, next_visible_at = ?3, \
                 lease_id = NULL, lease_expires_at = NULL WHERE id = ?4",
                params![
                    job.status.as_str(),
                    job.attempts,
                    fmt_ts(job.next_visible_at),
                    job.id.to_string()
                ],
            )?;
            finish_attempt(tx, job.id, now, "nacked", Some(failure_class))?;
            job.lease_id = None;
            job.lease_expires_at = None;
            Ok(Some(job))
        })?;
        let job = job.ok_or(QueueError::UnknownLease(lease_id))?;
        tracing::debug!(
            job_id = %job.id,
            attempts = job.attempts,
            status = job.status.as_str(),
            failure_class,
            "job nacked"
        );
        Ok(job)
    }

    /// Transition expired leases.
    ///
    /// `unclean_shutdown` is what the orchestrator observed about the worker
    /// that held the leases (exit code != 0). Crashes requeue without
    /// touching `attempts` but advance `crash_count`; a job whose
    /// `crash_count` reaches its retry budget without ever acking or
    /// nacking is a poison pill and is quarantined off the head with an
    /// alert, so subsequent work proceeds.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or storage error.
    pub fn sweep_expired(
        &self,
        unclean_shutdown: bool,
        ctx: &CancelToken,
    ) -> Result<SweepReport, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        let now = self.store.now();
        let options = self.options;
        let (report, alerts) = self.store.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "{JOB_COLUMNS} WHERE status = 'leased' AND lease_expires_at < ?1"
            ))?;
            let expired = stmt
                .query_map(params![fmt_ts(now)], job_from_row)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            drop(stmt);

            let mut report = SweepReport::default();
            let mut alerts: Vec<(String, Uuid)> = Vec::new();
            for row in expired {
                let job = decode_job(row).map_err(queue_to_store)?;
                if unclean_shutdown {
                    let crash_count: i64 = tx.query_row(
                        "SELECT crash_count FROM jobs WHERE id = ?1",
                        params![job.id.to_string()],
                        |r| r.get(0),
                    )?;
                    let crash_count = crash_count + 1;
                    if crash_count >= i64::from(job.max_attempts) {
                        tx.execute(
                            "UPDATE jobs SET status = 'quarantined', crash_count = ?1, \
                             lease_id = NULL, lease_expires_at = NULL WHERE id = ?2",
                            params![crash_count, job.id.to_string()],
                        )?;
                        finish_attempt(tx, job.id, now, "crashed", Some("deterministic_crash"))?;
                        alerts.push((job.tenant_id.clone(), job.id));
                        report.quarantined.push(job.id);
                    } else {
                        tx.execute(
                            "UPDATE jobs SET status = 'pending', crash_count = ?1, \
                             lease_id = NULL, lease_expires_at = NULL WHERE id = ?2",
                            params![crash_count, job.id.to_string()],
                        )?;
                        finish_attempt(tx, job.id, now, "crashed", None)?;
                        report.requeued.push(job.id);
                    }
                } else {
                    let attempts = job.attempts + 1;
                    if attempts < job.max_attempts {
                        let delay = backoff_ms(
                            options.backoff_base_ms,
                            options.backoff_cap_ms,
                            attempts,
                            job.id,
                        );
                        let visible = now + Duration::milliseconds(delay as i64);
                        tx.execute(
                            "UPDATE jobs SET status = 'retry_wait', attempts = ?1, \
                             next_visible_at = ?2, lease_id = NULL, lease_expires_at = NULL \
                             WHERE id = ?3",
                            params![attempts, fmt_ts(visible), job.id.to_string()],
                        )?;
                        report.retried.push(job.id);
                    } else {
                        tx.execute(
                            "UPDATE jobs SET status = 'dead_letter', attempts = ?1, \
                             lease_id = NULL, lease_expires_at = NULL WHERE id = ?2",
                            params![attempts, job.id.to_string()],
                        )?;
                        report.dead_lettered.push(job.id);
                    }
                    finish_attempt(tx, job.id, now, "lease_expired", None)?;
                }
            }
            Ok((report, alerts))
        })?;
        for (tenant, job_id) in alerts {
            self.store.append_audit(
                &tenant,
                None,
                "job_quarantined",
                &serde_json::json!({
                    "job_id": job_id,
                    "reason": "deterministic_crash",
                }),
                ctx,
            )?;
            tracing::warn!(job_id = %job_id, "poison pill quarantined");
        }
        Ok(report)
    }

    /// Load a job by id.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or storage error.
    pub fn get_job(&self, job_id: Uuid, ctx: &CancelToken) -> Result<Option<Job>, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        self.store
            .with_conn(|conn| {
                conn.query_row(
                    &format!("{JOB_COLUMNS} WHERE id = ?1"),
                    params![job_id.to_string()],
                    job_from_row,
                )
                .optional()
                .map_err(StoreError::from)
            })?
            .map(decode_job)
            .transpose()
    }

    /// Count jobs per status, sorted by status name.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or storage error.
    pub fn stats(&self, ctx: &CancelToken) -> Result<Vec<(String, i64)>, QueueError> {
        ctx.ensure_live().map_err(|_| StoreError::Cancelled)?;
        Ok(self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status ASC",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StoreError::from)?;
            Ok(rows)
        })?)
    }
}

const JOB_COLUMNS: &str = "SELECT id, tenant_id, session_id, priority, pack_ref, \
    idempotency_key, status, attempts, max_attempts, next_visible_at, lease_id, \
    lease_expires_at, created_at FROM jobs";

/// Raw row tuple; decoded into [`Job`] outside the rusqlite callback so
/// decode failures keep their own error type.
type JobRow = (
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn decode_job(row: JobRow) -> Result<Job, QueueError> {
    let (
        id,
        tenant_id,
        session_id,
        priority,
        pack_ref,
        idempotency_key,
        status,
        attempts,
        max_attempts,
        next_visible_at,
        lease_id,
        lease_expires_at,
        created_at,
    ) = row;
    Ok(Job {
        id: parse_uuid(&id)?,
        tenant_id,
        session_id,
        priority,
        pack_ref,
        idempotency_key,
        status: JobStatus::parse(&status)
            .map_err(|s| QueueError::Corrupt(format!("unknown status {s:?}")))?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        next_visible_at: parse_ts(&next_visible_at)?,
        lease_id: lease_id.as_deref().map(parse_uuid).transpose()?,
        lease_expires_at: lease_expires_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&created_at)?,
    })
}

fn job_by_lease(tx: &Transaction<'_>, lease_id: Uuid) -> Result<Option<Job>, StoreError> {
    let row = tx
        .query_row(
            &format!("{JOB_COLUMNS} WHERE lease_id = ?1 AND status = 'leased'"),
            params![lease_id.to_string()],
            job_from_row,
        )
        .optional()?;
    row.map(|row| decode_job(row).map_err(queue_to_store)).transpose()
}

fn finish_attempt(
    tx: &Transaction<'_>,
    job_id: Uuid,
    now: DateTime<Utc>,
    outcome: &str,
    failure_class: Option<&str>,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE job_attempts SET ended_at = ?1, outcome = ?2, failure_class = ?3 \
         WHERE job_id = ?4 AND outcome = 'running'",
        params![fmt_ts(now), outcome, failure_class, job_id.to_string()],
    )?;
    Ok(())
}

fn count_leased(tx: &Transaction<'_>, session: Option<&str>) -> Result<i64, StoreError> {
    let count = match session {
        Some(session) => tx.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'leased' AND session_id = ?1",
            params![session],
            |row| row.get(0),
        )?,
        None => tx.query_row("SELECT COUNT(*) FROM jobs WHERE status = 'leased'", [], |row| {
            row.get(0)
        })?,
    };
    Ok(count)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(s).map_err(|e| QueueError::Corrupt(format!("bad uuid {s:?}: {e}")))
}

/// Carry a queue error through a store-typed closure boundary.
fn queue_to_store(err: QueueError) -> StoreError {
    match err {
        QueueError::Store(inner) => inner,
        other => StoreError::Corrupt(other.to_string()),
    }
}
