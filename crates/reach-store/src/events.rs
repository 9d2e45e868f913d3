// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ordered event log, snapshots, and snapshot-gated pruning.
//!
//! Event `id` is assigned by the database and is the only authoritative
//! ordering. The lease layer guarantees a single writer per run, so appends
//! to one run never race. Pruning is refused unless a snapshot covers the
//! pruned prefix, and `snapshot_and_prune` commits both in one transaction.

use crate::driver::{Store, StoreError, fmt_ts, parse_ts, parse_uuid};
use reach_core::{CancelToken, Event, Snapshot};
use rusqlite::{OptionalExtension, Transaction, params};
use uuid::Uuid;

impl Store {
    /// Append an event to a run's log and return the stored row.
    ///
    /// # Errors
    ///
    /// Fails on cancellation, serialization failure, or database error.
    pub fn append_event(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        ctx: &CancelToken,
    ) -> Result<Event, StoreError> {
        Self::check(ctx)?;
        let created_at = self.now();
        let payload_text = serde_json::to_string(payload)
            .map_err(|e| StoreError::Corrupt(format!("unencodable event payload: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (run_id, tenant_id, type, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    tenant_id,
                    event_type,
                    payload_text,
                    fmt_ts(created_at)
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(Event {
                id,
                run_id,
                event_type: event_type.to_string(),
                payload: payload.clone(),
                created_at,
            })
        })
    }

    /// List a run's events with `id > after_id`, ascending by `id`.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or database error; row-level decode failures
    /// surface as [`StoreError::Corrupt`].
    pub fn list_events(
        &self,
        run_id: Uuid,
        after_id: i64,
        ctx: &CancelToken,
    ) -> Result<Vec<Event>, StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, run_id, type, payload, created_at FROM events \
                 WHERE run_id = ?1 AND id > ?2 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![run_id.to_string(), after_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut events = Vec::new();
            for row in rows {
                Self::check(ctx)?;
                let (id, run, event_type, payload, created_at) = row?;
                events.push(Event {
                    id,
                    run_id: parse_uuid(&run)?,
                    event_type,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| StoreError::Corrupt(format!("event {id} payload: {e}")))?,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(events)
        })
    }

    /// List a run's events for a tenant, enforcing tenant ownership.
    ///
    /// # Errors
    ///
    /// Same failure surface as [`list_events`](Store::list_events).
    pub fn list_events_for_tenant(
        &self,
        tenant_id: &str,
        run_id: Uuid,
        after_id: i64,
        ctx: &CancelToken,
    ) -> Result<Vec<Event>, StoreError> {
        Self::check(ctx)?;
        let owner: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT tenant_id FROM events WHERE run_id = ?1 LIMIT 1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match owner {
            Some(owner) if owner != tenant_id => Ok(Vec::new()),
            _ => self.list_events(run_id, after_id, ctx),
        }
    }

    /// Store a snapshot of run state at `last_event_id`.
    ///
    /// The state hash is computed over the canonical form of the payload and
    /// verified again on every read.
    ///
    /// # Errors
    ///
    /// Fails on cancellation, serialization failure, or database error.
    pub fn write_snapshot(
        &self,
        run_id: Uuid,
        last_event_id: i64,
        state_payload: &serde_json::Value,
        ctx: &CancelToken,
    ) -> Result<Snapshot, StoreError> {
        Self::check(ctx)?;
        let snapshot = self.build_snapshot(run_id, last_event_id, state_payload)?;
        self.with_conn(|conn| {
            insert_snapshot(conn, &snapshot)?;
            Ok(())
        })?;
        Ok(snapshot)
    }

    fn build_snapshot(
        &self,
        run_id: Uuid,
        last_event_id: i64,
        state_payload: &serde_json::Value,
    ) -> Result<Snapshot, StoreError> {
        let state_hash = reach_hash::hash_canonical(state_payload)?;
        Ok(Snapshot {
            run_id,
            last_event_id,
            state_payload: state_payload.clone(),
            state_hash,
            created_at: self.now(),
        })
    }

    /// Load the latest snapshot for a run, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SnapshotHashMismatch`] if the stored hash does
    /// not match the recomputed canonical hash of the payload.
    pub fn read_snapshot(
        &self,
        run_id: Uuid,
        ctx: &CancelToken,
    ) -> Result<Option<Snapshot>, StoreError> {
        Self::check(ctx)?;
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_event_id, state_payload, state_hash, created_at \
                     FROM snapshots WHERE run_id = ?1 \
                     ORDER BY last_event_id DESC LIMIT 1",
                    params![run_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        let Some((last_event_id, payload, stored_hash, created_at)) = row else {
            return Ok(None);
        };
        let state_payload: serde_json::Value = serde_json::from_str(&payload)
            .map_err(|e| StoreError::Corrupt(format!("snapshot payload: {e}")))?;
        let recomputed = reach_hash::hash_canonical(&state_payload)?;
        if recomputed != stored_hash {
            return Err(StoreError::SnapshotHashMismatch {
                run_id,
                last_event_id,
            });
        }
        Ok(Some(Snapshot {
            run_id,
            last_event_id,
            state_payload,
            state_hash: stored_hash,
            created_at: parse_ts(&created_at)?,
        }))
    }

    /// Delete a run's events with `id < before_id`.
    ///
    /// Refused unless a snapshot with `last_event_id >= before_id - 1`
    /// already exists; check and delete share one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingSnapshot`] if no covering snapshot
    /// exists.
    pub fn prune_events(
        &self,
        run_id: Uuid,
        before_id: i64,
        ctx: &CancelToken,
    ) -> Result<usize, StoreError> {
        Self::check(ctx)?;
        self.with_tx(|tx| prune_in_tx(tx, run_id, before_id))
    }

    /// Snapshot at `last_event_id` and prune events `id < before_id` in a
    /// single transaction.
    ///
    /// A crash at any point leaves either the full event log with no new
    /// snapshot, or the snapshot with the prefix gone. Never a mix.
    ///
    /// # Errors
    ///
    /// Fails like [`write_snapshot`](Store::write_snapshot) and
    /// [`prune_events`](Store::prune_events); any failure rolls back both
    /// halves.
    pub fn snapshot_and_prune(
        &self,
        run_id: Uuid,
        last_event_id: i64,
        state_payload: &serde_json::Value,
        before_id: i64,
        ctx: &CancelToken,
    ) -> Result<(Snapshot, usize), StoreError> {
        Self::check(ctx)?;
        let snapshot = self.build_snapshot(run_id, last_event_id, state_payload)?;
        let pruned = self.with_tx(|tx| {
            insert_snapshot(tx, &snapshot)?;
            prune_in_tx(tx, run_id, before_id)
        })?;
        Ok((snapshot, pruned))
    }
}

fn insert_snapshot(conn: &rusqlite::Connection, snapshot: &Snapshot) -> Result<(), StoreError> {
    let payload_text = serde_json::to_string(&snapshot.state_payload)
        .map_err(|e| StoreError::Corrupt(format!("unencodable snapshot payload: {e}")))?;
    conn.execute(
        "INSERT OR REPLACE INTO snapshots \
         (run_id, last_event_id, state_payload, state_hash, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.run_id.to_string(),
            snapshot.last_event_id,
            payload_text,
            snapshot.state_hash,
            fmt_ts(snapshot.created_at)
        ],
    )?;
    Ok(())
}

fn prune_in_tx(
    tx: &Transaction<'_>,
    run_id: Uuid,
    before_id: i64,
) -> Result<usize, StoreError> {
    let covering: Option<i64> = tx
        .query_row(
            "SELECT MAX(last_event_id) FROM snapshots WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let required = before_id - 1;
    match covering {
        Some(last) if last >= required => {}
        _ => {
            return Err(StoreError::MissingSnapshot { run_id, required });
        }
    }
    let pruned = tx.execute(
        "DELETE FROM events WHERE run_id = ?1 AND id < ?2",
        params![run_id.to_string(), before_id],
    )?;
    Ok(pruned)
}
