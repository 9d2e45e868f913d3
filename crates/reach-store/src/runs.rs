// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run rows and the write-once fingerprint discipline.

use crate::driver::{Store, StoreError, fmt_ts, parse_ts, parse_uuid};
use reach_core::{CancelToken, Run};
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

impl Store {
    /// Insert a run row. The fingerprint starts empty.
    ///
    /// # Errors
    ///
    /// Fails on cancellation, serialization failure, or database error.
    pub fn insert_run(&self, run: &Run, ctx: &CancelToken) -> Result<(), StoreError> {
        Self::check(ctx)?;
        let federation = serde_json::to_string(&run.federation_path)
            .map_err(|e| StoreError::Corrupt(format!("federation_path: {e}")))?;
        let trust = serde_json::to_string(&run.trust_scores)
            .map_err(|e| StoreError::Corrupt(format!("trust_scores: {e}")))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs \
                 (id, tenant_id, pack_ref, fingerprint, environment, federation_path, \
                  trust_scores, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.id.to_string(),
                    run.tenant_id,
                    run.pack_ref,
                    run.fingerprint,
                    run.environment,
                    federation,
                    trust,
                    fmt_ts(run.created_at)
                ],
            )?;
            Ok(())
        })
    }

    /// Write a run's fingerprint, exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::FingerprintAlreadySet`] if the run already has
    /// one; the stored value is never overwritten.
    pub fn set_run_fingerprint(
        &self,
        run_id: Uuid,
        fingerprint: &str,
        ctx: &CancelToken,
    ) -> Result<(), StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE runs SET fingerprint = ?1 WHERE id = ?2 AND fingerprint IS NULL",
                params![fingerprint, run_id.to_string()],
            )?;
            if changed == 1 {
                return Ok(());
            }
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM runs WHERE id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match exists {
                Some(_) => Err(StoreError::FingerprintAlreadySet(run_id)),
                None => Err(StoreError::Corrupt(format!("unknown run {run_id}"))),
            }
        })
    }

    /// Load a run by id.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or database error.
    pub fn get_run(&self, run_id: Uuid, ctx: &CancelToken) -> Result<Option<Run>, StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, tenant_id, pack_ref, fingerprint, environment, \
                            federation_path, trust_scores, created_at \
                     FROM runs WHERE id = ?1",
                    params![run_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;
            let Some((id, tenant_id, pack_ref, fingerprint, environment, federation, trust, created)) =
                row
            else {
                return Ok(None);
            };
            Ok(Some(Run {
                id: parse_uuid(&id)?,
                tenant_id,
                pack_ref,
                fingerprint,
                environment,
                federation_path: serde_json::from_str(&federation)
                    .map_err(|e| StoreError::Corrupt(format!("federation_path: {e}")))?,
                trust_scores: serde_json::from_str(&trust)
                    .map_err(|e| StoreError::Corrupt(format!("trust_scores: {e}")))?,
                created_at: parse_ts(&created)?,
            }))
        })
    }

    /// List run ids for a tenant, newest first.
    ///
    /// # Errors
    ///
    /// Fails on cancellation or database error.
    pub fn list_runs(&self, tenant_id: &str, ctx: &CancelToken) -> Result<Vec<Run>, StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM runs WHERE tenant_id = ?1 ORDER BY created_at DESC, id ASC",
            )?;
            let ids = stmt
                .query_map(params![tenant_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .and_then(|ids| {
            let mut runs = Vec::with_capacity(ids.len().min(1024));
            for id in ids {
                Self::check(ctx)?;
                if let Some(run) = self.get_run(parse_uuid(&id)?, ctx)? {
                    runs.push(run);
                }
            }
            Ok(runs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::CasOptions;
    use reach_core::FixedClock;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(
            &dir.path().join("reach.db"),
            &dir.path().join("cas"),
            CasOptions::default(),
            Arc::new(FixedClock::from_epoch_secs(1_700_000_000)),
        )
        .unwrap();
        (dir, store)
    }

    fn make_run(store: &Store) -> Run {
        Run {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            pack_ref: "hello@0.1.0".into(),
            fingerprint: None,
            created_at: store.now(),
            environment: "test".into(),
            federation_path: vec!["node-a".into()],
            trust_scores: BTreeMap::from([("node-a".to_string(), 1.0)]),
        }
    }

    #[test]
    fn run_round_trips() {
        let (_dir, store) = test_store();
        let ctx = CancelToken::new();
        let run = make_run(&store);
        store.insert_run(&run, &ctx).unwrap();
        let loaded = store.get_run(run.id, &ctx).unwrap().unwrap();
        assert_eq!(loaded.pack_ref, "hello@0.1.0");
        assert_eq!(loaded.federation_path, vec!["node-a".to_string()]);
        assert!(loaded.fingerprint.is_none());
    }

    #[test]
    fn fingerprint_is_write_once() {
        let (_dir, store) = test_store();
        let ctx = CancelToken::new();
        let run = make_run(&store);
        store.insert_run(&run, &ctx).unwrap();
        store.set_run_fingerprint(run.id, "abc", &ctx).unwrap();
        let err = store.set_run_fingerprint(run.id, "def", &ctx).unwrap_err();
        assert!(matches!(err, StoreError::FingerprintAlreadySet(_)));
        let loaded = store.get_run(run.id, &ctx).unwrap().unwrap();
        assert_eq!(loaded.fingerprint.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_run_is_none() {
        let (_dir, store) = test_store();
        assert!(store
            .get_run(Uuid::new_v4(), &CancelToken::new())
            .unwrap()
            .is_none());
    }
}
