// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed blob storage.
//!
//! Blob bytes live under the CAS root in files named by the SHA-256 of the
//! blob key, so arbitrary keys can never traverse out of the root. Writes go
//! through a temp file in the same directory followed by an atomic rename;
//! a crash mid-write leaves no partial blob. Every read recomputes the
//! content hash against the stored one.

use crate::driver::{Store, StoreError, fmt_ts, parse_ts};
use chrono::{DateTime, Utc};
use reach_core::CancelToken;
use rusqlite::{OptionalExtension, params};
use std::io::Write;
use std::path::PathBuf;

/// How the CAS behaves when a write would exceed the size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict least-recently-used blobs until the write fits.
    #[default]
    Lru,
    /// Refuse the write.
    Reject,
}

impl EvictionPolicy {
    /// Parse the `REACH_CAS_EVICTION_POLICY` value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lru" => Some(EvictionPolicy::Lru),
            "reject" => Some(EvictionPolicy::Reject),
            _ => None,
        }
    }
}

/// CAS sizing and eviction configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CasOptions {
    /// Total byte cap across all blobs; `None` means unbounded.
    pub max_size_bytes: Option<u64>,
    /// Behavior at the cap.
    pub eviction: EvictionPolicy,
}

/// Metadata row for a stored blob.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    /// Blob key.
    pub key: String,
    /// SHA-256 of the blob bytes.
    pub content_hash: String,
    /// Byte length.
    pub size: u64,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

impl Store {
    fn blob_path(&self, key: &str) -> PathBuf {
        self.cas_root().join(reach_hash::hash_bytes(key.as_bytes()))
    }

    /// Write (or atomically replace) a blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CasFull`] when the cap is hit under the
    /// `reject` policy; filesystem failures surface as [`StoreError::Io`].
    pub fn put_blob(
        &self,
        key: &str,
        bytes: &[u8],
        ctx: &CancelToken,
    ) -> Result<BlobMeta, StoreError> {
        Self::check(ctx)?;
        self.make_room(key, bytes.len() as u64, ctx)?;
        let content_hash = reach_hash::hash_bytes(bytes);
        let path = self.blob_path(key);
        let mut tmp = tempfile::NamedTempFile::new_in(self.cas_root())?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        Self::check(ctx)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        let created_at = self.now();
        let meta = BlobMeta {
            key: key.to_string(),
            content_hash: content_hash.clone(),
            size: bytes.len() as u64,
            created_at,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (key, content_hash, size, created_at, last_used_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    key,
                    content_hash,
                    bytes.len() as i64,
                    fmt_ts(created_at),
                    fmt_ts(created_at)
                ],
            )?;
            Ok(())
        })?;
        Ok(meta)
    }

    /// Read a blob, verifying its content hash.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BlobNotFound`] for unknown keys and
    /// [`StoreError::Integrity`] when the bytes on disk no longer match the
    /// hash recorded at write time.
    pub fn get_blob(&self, key: &str, ctx: &CancelToken) -> Result<Vec<u8>, StoreError> {
        Self::check(ctx)?;
        let stored: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT content_hash FROM blobs WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        let stored = stored.ok_or_else(|| StoreError::BlobNotFound(key.to_string()))?;
        let bytes = std::fs::read(self.blob_path(key))?;
        let actual = reach_hash::hash_bytes(&bytes);
        if actual != stored {
            return Err(StoreError::Integrity {
                key: key.to_string(),
                stored,
                actual,
            });
        }
        let now = fmt_ts(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE blobs SET last_used_at = ?1 WHERE key = ?2",
                params![now, key],
            )?;
            Ok(())
        })?;
        Ok(bytes)
    }

    /// List blob metadata for keys starting with `prefix`, sorted by key.
    ///
    /// # Errors
    ///
    /// Row-level failures surface as [`StoreError::Corrupt`].
    pub fn list_blobs(
        &self,
        prefix: &str,
        ctx: &CancelToken,
    ) -> Result<Vec<BlobMeta>, StoreError> {
        Self::check(ctx)?;
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM blobs WHERE substr(key, 1, length(?1)) = ?1",
                params![prefix],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT key, content_hash, size, created_at FROM blobs \
                 WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
            )?;
            let rows = stmt.query_map(params![prefix], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;
            // Bounded preallocation: never trust COUNT over a cap.
            let mut out = Vec::with_capacity((count.max(0) as usize).min(1024));
            for row in rows {
                Self::check(ctx)?;
                let (key, content_hash, size, created_at) = row?;
                out.push(BlobMeta {
                    key,
                    content_hash,
                    size: size.max(0) as u64,
                    created_at: parse_ts(&created_at)?,
                });
            }
            Ok(out)
        })
    }

    /// Delete a blob's bytes and metadata. Missing keys are a no-op.
    ///
    /// # Errors
    ///
    /// Filesystem failures surface as [`StoreError::Io`].
    pub fn delete_blob(&self, key: &str, ctx: &CancelToken) -> Result<(), StoreError> {
        Self::check(ctx)?;
        match std::fs::remove_file(self.blob_path(key)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.with_conn(|conn| {
            conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn make_room(&self, key: &str, incoming: u64, ctx: &CancelToken) -> Result<(), StoreError> {
        let Some(cap) = self.cas_options().max_size_bytes else {
            return Ok(());
        };
        let used: i64 = self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(size), 0) FROM blobs WHERE key != ?1",
                params![key],
                |row| row.get(0),
            )?)
        })?;
        let mut used = used.max(0) as u64;
        if used + incoming <= cap {
            return Ok(());
        }
        match self.cas_options().eviction {
            EvictionPolicy::Reject => Err(StoreError::CasFull {
                needed: incoming,
                available: cap.saturating_sub(used),
            }),
            EvictionPolicy::Lru => {
                loop {
                    Self::check(ctx)?;
                    if used + incoming <= cap {
                        return Ok(());
                    }
                    let victim: Option<(String, i64)> = self.with_conn(|conn| {
                        Ok(conn
                            .query_row(
                                "SELECT key, size FROM blobs WHERE key != ?1 \
                                 ORDER BY last_used_at ASC, key ASC LIMIT 1",
                                params![key],
                                |row| Ok((row.get(0)?, row.get(1)?)),
                            )
                            .optional()?)
                    })?;
                    let Some((victim_key, size)) = victim else {
                        return Err(StoreError::CasFull {
                            needed: incoming,
                            available: cap.saturating_sub(used),
                        });
                    };
                    tracing::debug!(key = %victim_key, "evicting blob for capacity");
                    self.delete_blob(&victim_key, ctx)?;
                    used = used.saturating_sub(size.max(0) as u64);
                }
            }
        }
    }
}
