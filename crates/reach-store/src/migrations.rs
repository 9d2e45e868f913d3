// SPDX-License-Identifier: MIT OR Apache-2.0
//! Idempotent, sequentially numbered schema migrations.
//!
//! Each migration applies inside its own transaction and is recorded in
//! `schema_migrations (id, applied_at)`. Re-applying is a no-op. Downgrade
//! scripts are not carried for the current major.

use crate::driver::StoreError;
use rusqlite::Connection;

/// Highest migration id this build knows about.
pub const SCHEMA_VERSION: i64 = 3;

struct Migration {
    id: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        sql: "\
            CREATE TABLE IF NOT EXISTS blobs (\
                key TEXT PRIMARY KEY,\
                content_hash TEXT NOT NULL,\
                size INTEGER NOT NULL,\
                created_at TEXT NOT NULL,\
                last_used_at TEXT NOT NULL\
            );\
            CREATE TABLE IF NOT EXISTS events (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                run_id TEXT NOT NULL,\
                tenant_id TEXT NOT NULL,\
                type TEXT NOT NULL,\
                payload TEXT NOT NULL,\
                created_at TEXT NOT NULL\
            );\
            CREATE INDEX IF NOT EXISTS idx_events_run ON events (run_id, id);\
            CREATE TABLE IF NOT EXISTS snapshots (\
                run_id TEXT NOT NULL,\
                last_event_id INTEGER NOT NULL,\
                state_payload TEXT NOT NULL,\
                state_hash TEXT NOT NULL,\
                created_at TEXT NOT NULL,\
                PRIMARY KEY (run_id, last_event_id)\
            );\
            CREATE TABLE IF NOT EXISTS audit_log (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                tenant_id TEXT NOT NULL,\
                run_id TEXT,\
                type TEXT NOT NULL,\
                payload TEXT NOT NULL,\
                ts TEXT NOT NULL\
            );\
            CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_log (run_id, id);\
            CREATE TABLE IF NOT EXISTS runs (\
                id TEXT PRIMARY KEY,\
                tenant_id TEXT NOT NULL,\
                pack_ref TEXT NOT NULL,\
                fingerprint TEXT,\
                environment TEXT NOT NULL,\
                federation_path TEXT NOT NULL DEFAULT '[]',\
                trust_scores TEXT NOT NULL DEFAULT '{}',\
                created_at TEXT NOT NULL\
            );",
    },
    Migration {
        id: 2,
        sql: "\
            CREATE TABLE IF NOT EXISTS jobs (\
                id TEXT PRIMARY KEY,\
                tenant_id TEXT NOT NULL,\
                session_id TEXT,\
                priority INTEGER NOT NULL,\
                pack_ref TEXT NOT NULL,\
                idempotency_key TEXT NOT NULL,\
                status TEXT NOT NULL,\
                attempts INTEGER NOT NULL DEFAULT 0,\
                max_attempts INTEGER NOT NULL,\
                crash_count INTEGER NOT NULL DEFAULT 0,\
                next_visible_at TEXT NOT NULL,\
                lease_id TEXT,\
                lease_expires_at TEXT,\
                created_at TEXT NOT NULL,\
                UNIQUE (tenant_id, idempotency_key)\
            );\
            CREATE INDEX IF NOT EXISTS idx_jobs_eligible \
                ON jobs (status, next_visible_at, priority, tenant_id, session_id, created_at, id);\
            CREATE TABLE IF NOT EXISTS job_attempts (\
                job_id TEXT NOT NULL,\
                attempt_no INTEGER NOT NULL,\
                started_at TEXT NOT NULL,\
                ended_at TEXT,\
                outcome TEXT NOT NULL,\
                failure_class TEXT,\
                PRIMARY KEY (job_id, attempt_no)\
            );\
            CREATE TABLE IF NOT EXISTS job_results (\
                job_id TEXT PRIMARY KEY,\
                outcome TEXT NOT NULL,\
                recorded_at TEXT NOT NULL\
            );",
    },
    Migration {
        id: 3,
        sql: "\
            CREATE TABLE IF NOT EXISTS peers (\
                node_id TEXT PRIMARY KEY,\
                public_key TEXT NOT NULL,\
                device_info TEXT NOT NULL DEFAULT '{}',\
                trust_level TEXT NOT NULL DEFAULT 'unknown',\
                quarantined INTEGER NOT NULL DEFAULT 0,\
                proof_failures INTEGER NOT NULL DEFAULT 0,\
                last_seen TEXT\
            );\
            CREATE TABLE IF NOT EXISTS delegations (\
                delegation_id TEXT PRIMARY KEY,\
                peer_id TEXT NOT NULL,\
                envelope TEXT NOT NULL,\
                status TEXT NOT NULL DEFAULT 'issued',\
                reason TEXT,\
                updated_at TEXT NOT NULL\
            );",
    },
];

/// Apply all pending migrations.
pub(crate) fn apply(conn: &Connection, now: &str) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
            id INTEGER PRIMARY KEY,\
            applied_at TEXT NOT NULL\
        );",
    )?;
    for migration in MIGRATIONS {
        let applied = match conn.query_row(
            "SELECT 1 FROM schema_migrations WHERE id = ?1",
            [migration.id],
            |_| Ok(()),
        ) {
            Ok(()) => true,
            Err(rusqlite::Error::QueryReturnedNoRows) => false,
            Err(other) => return Err(other.into()),
        };
        if applied {
            continue;
        }
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = conn.execute_batch(migration.sql).and_then(|()| {
            conn.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, ?2)",
                rusqlite::params![migration.id, now],
            )
            .map(|_| ())
        });
        match result {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(err) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(err.into());
            }
        }
        tracing::info!(id = migration.id, "applied schema migration");
    }
    Ok(())
}
