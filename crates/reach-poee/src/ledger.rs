// SPDX-License-Identifier: MIT OR Apache-2.0
//! The delegation ledger: db rows plus a per-delegation JSON mirror under
//! `.reach/delegations/`.

use crate::PoeeError;
use crate::envelope::DelegationEnvelope;
use reach_core::CancelToken;
use reach_store::Store;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle of a delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    /// Envelope signed and recorded; awaiting a proof.
    Issued,
    /// Proof verified.
    Completed,
    /// Proof failed verification.
    Failed,
}

impl DelegationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Issued => "issued",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, PoeeError> {
        match s {
            "issued" => Ok(DelegationStatus::Issued),
            "completed" => Ok(DelegationStatus::Completed),
            "failed" => Ok(DelegationStatus::Failed),
            other => Err(PoeeError::InvariantViolation(format!(
                "unknown delegation status {other:?}"
            ))),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    /// The executing peer.
    pub peer_id: String,
    /// The issued envelope, verbatim.
    pub envelope: DelegationEnvelope,
    /// Current lifecycle state.
    pub status: DelegationStatus,
    /// Failure reason, when status is `failed`.
    pub reason: Option<String>,
}

/// Durable delegation-state ledger.
pub struct DelegationLedger {
    store: Arc<Store>,
    mirror_dir: PathBuf,
}

impl DelegationLedger {
    /// Open the ledger; the mirror directory is created on demand.
    #[must_use]
    pub fn new(store: Arc<Store>, data_dir: &std::path::Path) -> Self {
        Self {
            store,
            mirror_dir: data_dir.join(".reach").join("delegations"),
        }
    }

    /// Record a freshly issued envelope with status `issued`.
    ///
    /// # Errors
    ///
    /// Fails on storage or mirror-file errors.
    pub fn record(
        &self,
        envelope: &DelegationEnvelope,
        peer_id: &str,
        ctx: &CancelToken,
    ) -> Result<(), PoeeError> {
        ctx.ensure_live()
            .map_err(|_| PoeeError::Store(reach_store::StoreError::Cancelled))?;
        let record = DelegationRecord {
            peer_id: peer_id.to_string(),
            envelope: envelope.clone(),
            status: DelegationStatus::Issued,
            reason: None,
        };
        let envelope_json = serde_json::to_string(envelope)?;
        let now = self.store.now().to_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO delegations \
                 (delegation_id, peer_id, envelope, status, reason, updated_at) \
                 VALUES (?1, ?2, ?3, 'issued', NULL, ?4)",
                params![
                    envelope.delegation_id.to_string(),
                    peer_id,
                    envelope_json,
                    now
                ],
            )?;
            Ok(())
        })?;
        self.write_mirror(&record)?;
        Ok(())
    }

    /// Load a delegation by id.
    ///
    /// # Errors
    ///
    /// Fails on storage errors or undecodable rows.
    pub fn get(
        &self,
        delegation_id: Uuid,
        ctx: &CancelToken,
    ) -> Result<Option<DelegationRecord>, PoeeError> {
        ctx.ensure_live()
            .map_err(|_| PoeeError::Store(reach_store::StoreError::Cancelled))?;
        let row = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT peer_id, envelope, status, reason FROM delegations \
                     WHERE delegation_id = ?1",
                    params![delegation_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        row.map(|(peer_id, envelope, status, reason)| {
            Ok(DelegationRecord {
                peer_id,
                envelope: serde_json::from_str(&envelope)?,
                status: DelegationStatus::parse(&status)?,
                reason,
            })
        })
        .transpose()
    }

    /// Update a delegation's status, refreshing the mirror file.
    ///
    /// # Errors
    ///
    /// Fails on storage or mirror-file errors.
    pub fn set_status(
        &self,
        delegation_id: Uuid,
        status: DelegationStatus,
        reason: Option<&str>,
        ctx: &CancelToken,
    ) -> Result<(), PoeeError> {
        ctx.ensure_live()
            .map_err(|_| PoeeError::Store(reach_store::StoreError::Cancelled))?;
        let now = self.store.now().to_rfc3339();
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE delegations SET status = ?1, reason = ?2, updated_at = ?3 \
                 WHERE delegation_id = ?4",
                params![status.as_str(), reason, now, delegation_id.to_string()],
            )?;
            Ok(())
        })?;
        if let Some(record) = self.get(delegation_id, ctx)? {
            self.write_mirror(&record)?;
        }
        Ok(())
    }

    /// List all delegations, sorted by id.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn list(&self, ctx: &CancelToken) -> Result<Vec<DelegationRecord>, PoeeError> {
        let ids = self.store.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT delegation_id FROM delegations ORDER BY delegation_id ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        let mut records = Vec::with_capacity(ids.len().min(1024));
        for id in ids {
            let id = Uuid::parse_str(&id)
                .map_err(|e| PoeeError::InvariantViolation(format!("bad delegation id: {e}")))?;
            if let Some(record) = self.get(id, ctx)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn write_mirror(&self, record: &DelegationRecord) -> Result<(), PoeeError> {
        std::fs::create_dir_all(&self.mirror_dir)?;
        let path = self
            .mirror_dir
            .join(format!("{}.json", record.envelope.delegation_id));
        let mut bytes = serde_json::to_vec_pretty(record)?;
        bytes.push(b'\n');
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Path of a delegation's mirror file.
    #[must_use]
    pub fn mirror_path(&self, delegation_id: Uuid) -> PathBuf {
        self.mirror_dir.join(format!("{delegation_id}.json"))
    }
}
