// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable peer store and the trust ladder.

use crate::MeshError;
use chrono::{DateTime, Utc};
use reach_core::CancelToken;
use reach_store::Store;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a peer stands on the trust ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Imported but not yet confirmed by anyone.
    Unknown,
    /// One side has confirmed; awaiting the other.
    Provisional,
    /// Explicitly confirmed by both sides.
    Trusted,
    /// Violated the protocol or failed verification; quarantined.
    Untrusted,
}

impl TrustLevel {
    /// Stable string stored in the database.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Unknown => "unknown",
            TrustLevel::Provisional => "provisional",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Untrusted => "untrusted",
        }
    }

    fn parse(s: &str) -> Result<Self, MeshError> {
        match s {
            "unknown" => Ok(TrustLevel::Unknown),
            "provisional" => Ok(TrustLevel::Provisional),
            "trusted" => Ok(TrustLevel::Trusted),
            "untrusted" => Ok(TrustLevel::Untrusted),
            other => Err(MeshError::Key(format!("unknown trust level {other:?}"))),
        }
    }
}

/// A known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// The peer's stable node id.
    pub node_id: String,
    /// Hex-encoded Ed25519 public key.
    pub public_key: String,
    /// Free-form device metadata from pairing.
    pub device_info: serde_json::Value,
    /// Position on the trust ladder.
    pub trust_level: TrustLevel,
    /// Quarantined peers are refused for delegation regardless of level.
    pub quarantined: bool,
    /// Consecutive proof verification failures.
    pub proof_failures: u32,
    /// Last time this peer was seen.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Durable store of known peers.
pub struct PeerStore {
    store: Arc<Store>,
}

impl PeerStore {
    /// Wrap the shared store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert or refresh a peer record. New imports start `unknown`.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn import(
        &self,
        node_id: &str,
        public_key: &str,
        device_info: &serde_json::Value,
        ctx: &CancelToken,
    ) -> Result<PeerIdentity, MeshError> {
        ctx.ensure_live()
            .map_err(|_| MeshError::Store(reach_store::StoreError::Cancelled))?;
        let now = self.store.now();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peers (node_id, public_key, device_info, trust_level, last_seen) \
                 VALUES (?1, ?2, ?3, 'unknown', ?4) \
                 ON CONFLICT(node_id) DO UPDATE SET \
                     public_key = excluded.public_key, \
                     device_info = excluded.device_info, \
                     last_seen = excluded.last_seen",
                params![
                    node_id,
                    public_key,
                    device_info.to_string(),
                    now.to_rfc3339()
                ],
            )?;
            Ok(())
        })?;
        self.get(node_id, ctx)?
            .ok_or_else(|| MeshError::Key(format!("peer {node_id} vanished after import")))
    }

    /// Load a peer.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn get(&self, node_id: &str, ctx: &CancelToken) -> Result<Option<PeerIdentity>, MeshError> {
        ctx.ensure_live()
            .map_err(|_| MeshError::Store(reach_store::StoreError::Cancelled))?;
        let row = self.store.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT node_id, public_key, device_info, trust_level, quarantined, \
                            proof_failures, last_seen \
                     FROM peers WHERE node_id = ?1",
                    params![node_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        row.map(|(node_id, public_key, device_info, trust, quarantined, failures, last_seen)| {
            Ok(PeerIdentity {
                node_id,
                public_key,
                device_info: serde_json::from_str(&device_info)?,
                trust_level: TrustLevel::parse(&trust)?,
                quarantined: quarantined != 0,
                proof_failures: failures.max(0) as u32,
                last_seen: last_seen
                    .map(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .map(|dt| dt.with_timezone(&Utc))
                            .map_err(|e| MeshError::Key(format!("bad last_seen: {e}")))
                    })
                    .transpose()?,
            })
        })
        .transpose()
    }

    /// List all peers, sorted by node id.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn list(&self, ctx: &CancelToken) -> Result<Vec<PeerIdentity>, MeshError> {
        let ids = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT node_id FROM peers ORDER BY node_id ASC")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        let mut peers = Vec::with_capacity(ids.len().min(1024));
        for id in ids {
            if let Some(peer) = self.get(&id, ctx)? {
                peers.push(peer);
            }
        }
        Ok(peers)
    }

    /// One side confirmed the pairing: `unknown → provisional`.
    ///
    /// # Errors
    ///
    /// Refused for peers not currently `unknown`.
    pub fn mark_provisional(&self, node_id: &str, ctx: &CancelToken) -> Result<(), MeshError> {
        self.transition(node_id, TrustLevel::Unknown, TrustLevel::Provisional, ctx)
    }

    /// Both sides confirmed: `provisional → trusted`.
    ///
    /// # Errors
    ///
    /// Refused for peers not currently `provisional`.
    pub fn confirm(&self, node_id: &str, ctx: &CancelToken) -> Result<(), MeshError> {
        self.transition(node_id, TrustLevel::Provisional, TrustLevel::Trusted, ctx)
    }

    fn transition(
        &self,
        node_id: &str,
        from: TrustLevel,
        to: TrustLevel,
        ctx: &CancelToken,
    ) -> Result<(), MeshError> {
        let peer = self
            .get(node_id, ctx)?
            .ok_or_else(|| MeshError::TrustRefused(format!("unknown peer {node_id}")))?;
        if peer.quarantined {
            return Err(MeshError::TrustRefused(format!(
                "peer {node_id} is quarantined"
            )));
        }
        if peer.trust_level != from {
            return Err(MeshError::TrustRefused(format!(
                "peer {node_id} is {}, expected {}",
                peer.trust_level.as_str(),
                from.as_str()
            )));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET trust_level = ?1 WHERE node_id = ?2",
                params![to.as_str(), node_id],
            )?;
            Ok(())
        })?;
        tracing::info!(peer = node_id, level = to.as_str(), "peer trust advanced");
        Ok(())
    }

    /// A signature or protocol violation: drop to `untrusted` and
    /// quarantine.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn mark_violation(
        &self,
        node_id: &str,
        reason: &str,
        ctx: &CancelToken,
    ) -> Result<(), MeshError> {
        ctx.ensure_live()
            .map_err(|_| MeshError::Store(reach_store::StoreError::Cancelled))?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET trust_level = 'untrusted', quarantined = 1 WHERE node_id = ?1",
                params![node_id],
            )?;
            Ok(())
        })?;
        tracing::warn!(peer = node_id, reason, "peer quarantined");
        Ok(())
    }

    /// Record a failed proof verification; at `threshold` consecutive
    /// failures the peer erodes to `untrusted`.
    ///
    /// Returns the peer's trust level after the update.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn record_proof_failure(
        &self,
        node_id: &str,
        threshold: u32,
        ctx: &CancelToken,
    ) -> Result<TrustLevel, MeshError> {
        ctx.ensure_live()
            .map_err(|_| MeshError::Store(reach_store::StoreError::Cancelled))?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET proof_failures = proof_failures + 1 WHERE node_id = ?1",
                params![node_id],
            )?;
            Ok(())
        })?;
        let peer = self
            .get(node_id, ctx)?
            .ok_or_else(|| MeshError::TrustRefused(format!("unknown peer {node_id}")))?;
        if peer.proof_failures >= threshold {
            self.mark_violation(node_id, "proof failure threshold reached", ctx)?;
            return Ok(TrustLevel::Untrusted);
        }
        Ok(peer.trust_level)
    }

    /// A successful verification resets the erosion counter.
    ///
    /// # Errors
    ///
    /// Fails on storage errors.
    pub fn reset_proof_failures(&self, node_id: &str, ctx: &CancelToken) -> Result<(), MeshError> {
        ctx.ensure_live()
            .map_err(|_| MeshError::Store(reach_store::StoreError::Cancelled))?;
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE peers SET proof_failures = 0 WHERE node_id = ?1",
                params![node_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::FixedClock;
    use reach_store::CasOptions;
    use serde_json::json;

    fn peer_store() -> (tempfile::TempDir, PeerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            Store::open(
                &dir.path().join("reach.db"),
                &dir.path().join("cas"),
                CasOptions::default(),
                Arc::new(FixedClock::from_epoch_secs(1_700_000_000)),
            )
            .unwrap(),
        );
        (dir, PeerStore::new(store))
    }

    #[test]
    fn import_starts_unknown() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        let peer = peers
            .import("node-b", "aabb", &json!({"device": "test"}), &ctx)
            .unwrap();
        assert_eq!(peer.trust_level, TrustLevel::Unknown);
        assert!(!peer.quarantined);
    }

    #[test]
    fn trust_ladder_requires_each_step() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        peers.import("node-b", "aabb", &json!({}), &ctx).unwrap();
        // Cannot jump straight to trusted.
        assert!(peers.confirm("node-b", &ctx).is_err());
        peers.mark_provisional("node-b", &ctx).unwrap();
        peers.confirm("node-b", &ctx).unwrap();
        let peer = peers.get("node-b", &ctx).unwrap().unwrap();
        assert_eq!(peer.trust_level, TrustLevel::Trusted);
    }

    #[test]
    fn violation_quarantines_immediately() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        peers.import("node-b", "aabb", &json!({}), &ctx).unwrap();
        peers.mark_provisional("node-b", &ctx).unwrap();
        peers.confirm("node-b", &ctx).unwrap();
        peers
            .mark_violation("node-b", "bad signature", &ctx)
            .unwrap();
        let peer = peers.get("node-b", &ctx).unwrap().unwrap();
        assert_eq!(peer.trust_level, TrustLevel::Untrusted);
        assert!(peer.quarantined);
        // Quarantined peers cannot climb back without operator action.
        assert!(peers.mark_provisional("node-b", &ctx).is_err());
    }

    #[test]
    fn proof_failures_erode_trust_at_threshold() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        peers.import("node-b", "aabb", &json!({}), &ctx).unwrap();
        peers.mark_provisional("node-b", &ctx).unwrap();
        peers.confirm("node-b", &ctx).unwrap();
        assert_eq!(
            peers.record_proof_failure("node-b", 3, &ctx).unwrap(),
            TrustLevel::Trusted
        );
        assert_eq!(
            peers.record_proof_failure("node-b", 3, &ctx).unwrap(),
            TrustLevel::Trusted
        );
        assert_eq!(
            peers.record_proof_failure("node-b", 3, &ctx).unwrap(),
            TrustLevel::Untrusted
        );
    }

    #[test]
    fn successful_verification_resets_erosion() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        peers.import("node-b", "aabb", &json!({}), &ctx).unwrap();
        peers.record_proof_failure("node-b", 3, &ctx).unwrap();
        peers.record_proof_failure("node-b", 3, &ctx).unwrap();
        peers.reset_proof_failures("node-b", &ctx).unwrap();
        let peer = peers.get("node-b", &ctx).unwrap().unwrap();
        assert_eq!(peer.proof_failures, 0);
    }

    #[test]
    fn list_is_sorted() {
        let (_dir, peers) = peer_store();
        let ctx = CancelToken::new();
        peers.import("node-z", "zz", &json!({}), &ctx).unwrap();
        peers.import("node-a", "aa", &json!({}), &ctx).unwrap();
        let listed = peers.list(&ctx).unwrap();
        let ids: Vec<_> = listed.iter().map(|p| p.node_id.as_str()).collect();
        assert_eq!(ids, vec!["node-a", "node-z"]);
    }
}
