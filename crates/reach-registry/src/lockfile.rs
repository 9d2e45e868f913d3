// SPDX-License-Identifier: MIT OR Apache-2.0
//! The pack lockfile: one pinned resolution per name.

use crate::RegistryError;
use reach_core::LockEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// In-memory form of `registry/pack.lock.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lockfile {
    /// Pinned entries keyed by pack name. `BTreeMap` keeps serialization
    /// and listing order deterministic.
    pub packs: BTreeMap<String, LockEntry>,
}

impl Lockfile {
    /// Load the lockfile; a missing file is an empty lockfile.
    ///
    /// # Errors
    ///
    /// Fails on I/O (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the lockfile, pretty-printed and newline-terminated.
    ///
    /// # Errors
    ///
    /// Fails on serialization or I/O errors.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Pin `name` to `entry`.
    ///
    /// Re-pinning an existing name is refused unless `replace` is set or the
    /// entry is byte-identical to the existing pin.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::LockConflict`] on a refused upsert.
    pub fn upsert(
        &mut self,
        name: &str,
        entry: LockEntry,
        replace: bool,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.packs.get(name)
            && !replace
            && *existing != entry
        {
            return Err(RegistryError::LockConflict {
                name: name.to_string(),
            });
        }
        self.packs.insert(name.to_string(), entry);
        Ok(())
    }

    /// Remove a pin, returning it if present.
    pub fn remove(&mut self, name: &str) -> Option<LockEntry> {
        self.packs.remove(name)
    }

    /// Entries sorted by name, for deterministic diffs.
    #[must_use]
    pub fn entries_sorted(&self) -> Vec<(String, LockEntry)> {
        self.packs
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }
}
