// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only audit stream. Audit rows serve as the compliance record and
//! are never pruned.

use crate::driver::{Store, StoreError, fmt_ts, parse_ts, parse_uuid};
use reach_core::{AuditEntry, CancelToken};
use rusqlite::params;
use uuid::Uuid;

impl Store {
    /// Append an audit entry.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or database error.
    pub fn append_audit(
        &self,
        tenant_id: &str,
        run_id: Option<Uuid>,
        entry_type: &str,
        payload: &serde_json::Value,
        ctx: &CancelToken,
    ) -> Result<AuditEntry, StoreError> {
        Self::check(ctx)?;
        let ts = self.now();
        let payload_text = serde_json::to_string(payload)
            .map_err(|e| StoreError::Corrupt(format!("unencodable audit payload: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (tenant_id, run_id, type, payload, ts) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tenant_id,
                    run_id.map(|id| id.to_string()),
                    entry_type,
                    payload_text,
                    fmt_ts(ts)
                ],
            )?;
            Ok(())
        })?;
        Ok(AuditEntry {
            tenant_id: tenant_id.to_string(),
            run_id,
            entry_type: entry_type.to_string(),
            payload: payload.clone(),
            ts,
        })
    }

    /// List audit entries for a run in append order.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or database error.
    pub fn list_audit(
        &self,
        run_id: Uuid,
        ctx: &CancelToken,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, run_id, type, payload, ts FROM audit_log \
                 WHERE run_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;
            let mut entries = Vec::new();
            for row in rows {
                Self::check(ctx)?;
                let (tenant_id, run, entry_type, payload, ts) = row?;
                entries.push(AuditEntry {
                    tenant_id,
                    run_id: run.as_deref().map(parse_uuid).transpose()?,
                    entry_type,
                    payload: serde_json::from_str(&payload)
                        .map_err(|e| StoreError::Corrupt(format!("audit payload: {e}")))?,
                    ts: parse_ts(&ts)?,
                });
            }
            Ok(entries)
        })
    }
}
