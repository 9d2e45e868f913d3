// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Pack registry: manifest validation, content hashing, archive ingestion, lockfile."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Packs enter the registry from a directory, a tar(.gz) or zip archive, or
//! a git URL. Every ingress path lands in the same place: a validated
//! manifest, a canonical content hash, a `packs/<name>.json` blob, and a
//! lockfile entry pinning `{name → version, content_hash, source}`.

mod archive;
mod lockfile;
mod manifest;

pub use archive::{ArchiveLimits, IngestSource, ingest};
pub use lockfile::Lockfile;
pub use manifest::{ValidationOptions, content_hash, validate_manifest};

use reach_core::{ErrorKind, LockEntry, PackManifest, ReachError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The manifest failed validation.
    #[error("invalid pack manifest: {0}")]
    Validation(String),

    /// An archive was refused before extraction completed.
    #[error("archive rejected: {reason}")]
    ArchiveRejected {
        /// Why the archive was refused.
        reason: String,
    },

    /// Lockfile upsert without `replace` for an existing name.
    #[error("lockfile already pins {name}; pass replace to overwrite")]
    LockConflict {
        /// The conflicting pack name.
        name: String,
    },

    /// The requested pack is not in the registry.
    #[error("unknown pack {0:?}")]
    UnknownPack(String),

    /// Filesystem failure.
    #[error("registry io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse or serialize failure.
    #[error("registry json: {0}")]
    Json(#[from] serde_json::Error),

    /// Canonical serialization failure.
    #[error(transparent)]
    Canonical(#[from] reach_hash::CanonicalError),
}

impl RegistryError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Validation(_)
            | RegistryError::Json(_)
            | RegistryError::Canonical(_)
            | RegistryError::UnknownPack(_)
            | RegistryError::LockConflict { .. } => ErrorKind::ValidationFailure,
            RegistryError::ArchiveRejected { .. } => ErrorKind::ArchiveRejected,
            RegistryError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<RegistryError> for ReachError {
    fn from(err: RegistryError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}

/// The on-disk pack registry.
///
/// Owns `packs/`, `registry/index.json`, and `registry/pack.lock.json`
/// under the data dir.
pub struct PackRegistry {
    packs_dir: PathBuf,
    index_path: PathBuf,
    lock_path: PathBuf,
    validation: ValidationOptions,
    limits: ArchiveLimits,
}

impl PackRegistry {
    /// Open a registry rooted at the given data dir.
    ///
    /// # Errors
    ///
    /// Fails if the registry directories cannot be created.
    pub fn open(
        data_dir: &Path,
        validation: ValidationOptions,
        limits: ArchiveLimits,
    ) -> Result<Self, RegistryError> {
        let packs_dir = data_dir.join("packs");
        let registry_dir = data_dir.join("registry");
        std::fs::create_dir_all(&packs_dir)?;
        std::fs::create_dir_all(&registry_dir)?;
        Ok(Self {
            packs_dir,
            index_path: registry_dir.join("index.json"),
            lock_path: registry_dir.join("pack.lock.json"),
            validation,
            limits,
        })
    }

    /// Ingest, validate, hash, store, and pin a pack.
    ///
    /// The lockfile holds exactly one entry per name; re-adding an existing
    /// name requires `replace`.
    ///
    /// # Errors
    ///
    /// Surfaces validation, archive, lock-conflict, and I/O failures.
    pub fn add_pack(
        &self,
        source: &IngestSource,
        replace: bool,
    ) -> Result<(PackManifest, LockEntry), RegistryError> {
        let manifest = ingest(source, &self.limits)?;
        validate_manifest(&manifest, &self.validation)?;
        let hash = content_hash(&manifest)?;

        let mut lockfile = Lockfile::load(&self.lock_path)?;
        let entry = LockEntry {
            version: manifest.version.clone(),
            content_hash: hash,
            source: source.describe(),
        };
        lockfile.upsert(&manifest.name, entry.clone(), replace)?;

        let pack_path = self.packs_dir.join(format!("{}.json", manifest.name));
        let mut bytes = serde_json::to_vec_pretty(&serde_json::to_value(&manifest)?)?;
        bytes.push(b'\n');
        std::fs::write(&pack_path, bytes)?;

        lockfile.save(&self.lock_path)?;
        self.write_index(&lockfile)?;
        tracing::info!(pack = %manifest.name, version = %manifest.version, "pack registered");
        Ok((manifest, entry))
    }

    /// Load a registered pack by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownPack`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<PackManifest, RegistryError> {
        let path = self.packs_dir.join(format!("{name}.json"));
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryError::UnknownPack(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List lockfile entries, sorted by name for deterministic diffs.
    ///
    /// # Errors
    ///
    /// Fails on lockfile I/O or parse errors.
    pub fn list(&self) -> Result<Vec<(String, LockEntry)>, RegistryError> {
        Ok(Lockfile::load(&self.lock_path)?.entries_sorted())
    }

    /// Canonical hash of the registry index, recorded into capsules.
    ///
    /// # Errors
    ///
    /// Fails on lockfile I/O or serialization errors.
    pub fn snapshot_hash(&self) -> Result<String, RegistryError> {
        let lockfile = Lockfile::load(&self.lock_path)?;
        let index: BTreeMap<String, String> = lockfile
            .entries_sorted()
            .into_iter()
            .map(|(name, entry)| (name, entry.content_hash))
            .collect();
        Ok(reach_hash::hash_canonical(&index)?)
    }

    fn write_index(&self, lockfile: &Lockfile) -> Result<(), RegistryError> {
        let index: BTreeMap<String, LockEntry> = lockfile.entries_sorted().into_iter().collect();
        let mut bytes = serde_json::to_vec_pretty(&index)?;
        bytes.push(b'\n');
        std::fs::write(&self.index_path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
