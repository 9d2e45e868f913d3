// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pack ingestion from directories, archives, and git URLs.
//!
//! Archive extraction is defensive: entries whose cleaned relative path
//! would escape the extraction root are refused, and both the entry count
//! and total unpacked bytes are capped. Any refusal surfaces as
//! `archive_rejected` with the reason.

use crate::RegistryError;
use reach_core::PackManifest;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

/// Extraction ceilings.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveLimits {
    /// Maximum number of entries an archive may contain.
    pub max_entries: usize,
    /// Maximum total unpacked bytes.
    pub max_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: 4_096,
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Where a pack comes from.
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// A directory containing `pack.json`.
    Directory(PathBuf),
    /// A `.tar` or `.tar.gz` archive.
    Tar(PathBuf),
    /// A `.zip` archive.
    Zip(PathBuf),
    /// A git URL, cloned shallowly.
    Git(String),
}

impl IngestSource {
    /// Infer a source from a path or URL string.
    #[must_use]
    pub fn infer(spec: &str) -> Self {
        if spec.starts_with("git://")
            || spec.starts_with("git@")
            || spec.ends_with(".git")
            || (spec.starts_with("https://") && spec.contains("git"))
        {
            return IngestSource::Git(spec.to_string());
        }
        let path = PathBuf::from(spec);
        let name = spec.to_ascii_lowercase();
        if name.ends_with(".zip") {
            IngestSource::Zip(path)
        } else if name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            IngestSource::Tar(path)
        } else {
            IngestSource::Directory(path)
        }
    }

    /// Human-readable source string recorded in the lockfile.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            IngestSource::Directory(p) | IngestSource::Tar(p) | IngestSource::Zip(p) => {
                p.display().to_string()
            }
            IngestSource::Git(url) => url.clone(),
        }
    }
}

/// Ingest a pack manifest from a source.
///
/// # Errors
///
/// Returns [`RegistryError::ArchiveRejected`] for traversal attempts and
/// cap violations, and [`RegistryError::Validation`] when `pack.json` is
/// missing or malformed.
pub fn ingest(source: &IngestSource, limits: &ArchiveLimits) -> Result<PackManifest, RegistryError> {
    match source {
        IngestSource::Directory(dir) => load_pack_dir(dir, limits),
        IngestSource::Tar(path) => {
            let staging = tempfile::tempdir()?;
            extract_tar(path, staging.path(), limits)?;
            load_pack_dir(staging.path(), limits)
        }
        IngestSource::Zip(path) => {
            let staging = tempfile::tempdir()?;
            extract_zip(path, staging.path(), limits)?;
            load_pack_dir(staging.path(), limits)
        }
        IngestSource::Git(url) => {
            let staging = tempfile::tempdir()?;
            clone_git(url, staging.path())?;
            load_pack_dir(staging.path(), limits)
        }
    }
}

fn rejected(reason: impl Into<String>) -> RegistryError {
    RegistryError::ArchiveRejected {
        reason: reason.into(),
    }
}

/// Clean a relative entry path, refusing anything that would escape the
/// extraction root.
fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf, RegistryError> {
    let mut cleaned = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(rejected(format!(
                    "entry {:?} traverses outside the extraction root",
                    entry.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(rejected(format!(
                    "entry {:?} has an absolute path",
                    entry.display()
                )));
            }
        }
    }
    if cleaned.as_os_str().is_empty() {
        return Err(rejected("entry has an empty path"));
    }
    Ok(root.join(cleaned))
}

fn extract_tar(path: &Path, dest: &Path, limits: &ArchiveLimits) -> Result<(), RegistryError> {
    let file = std::fs::File::open(path)?;
    let name = path.to_string_lossy().to_ascii_lowercase();
    let reader: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    let mut entries = 0usize;
    let mut bytes = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        entries += 1;
        if entries > limits.max_entries {
            return Err(rejected(format!(
                "entry count exceeds cap of {}",
                limits.max_entries
            )));
        }
        bytes = bytes.saturating_add(entry.size());
        if bytes > limits.max_bytes {
            return Err(rejected(format!(
                "unpacked size exceeds cap of {} bytes",
                limits.max_bytes
            )));
        }
        let target = safe_join(dest, &entry.path()?)?;
        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn extract_zip(path: &Path, dest: &Path, limits: &ArchiveLimits) -> Result<(), RegistryError> {
    let file = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| rejected(format!("unreadable zip: {e}")))?;
    if archive.len() > limits.max_entries {
        return Err(rejected(format!(
            "entry count exceeds cap of {}",
            limits.max_entries
        )));
    }
    let mut bytes = 0u64;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| rejected(format!("unreadable zip entry: {e}")))?;
        bytes = bytes.saturating_add(entry.size());
        if bytes > limits.max_bytes {
            return Err(rejected(format!(
                "unpacked size exceeds cap of {} bytes",
                limits.max_bytes
            )));
        }
        let raw_name = entry.name().to_string();
        let target = safe_join(dest, Path::new(&raw_name))?;
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn clone_git(url: &str, dest: &Path) -> Result<(), RegistryError> {
    let status = std::process::Command::new("git")
        .args(["clone", "--depth", "1", url])
        .arg(dest)
        .status()?;
    if !status.success() {
        return Err(rejected(format!("git clone of {url} failed: {status}")));
    }
    Ok(())
}

fn load_pack_dir(dir: &Path, limits: &ArchiveLimits) -> Result<PackManifest, RegistryError> {
    // Directory sources get the same ceilings as archives.
    let mut entries = 0usize;
    let mut bytes = 0u64;
    for entry in walkdir::WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| rejected(format!("unreadable directory entry: {e}")))?;
        entries += 1;
        if entries > limits.max_entries {
            return Err(rejected(format!(
                "entry count exceeds cap of {}",
                limits.max_entries
            )));
        }
        if entry.file_type().is_file() {
            bytes = bytes.saturating_add(entry.metadata().map(|m| m.len()).unwrap_or(0));
            if bytes > limits.max_bytes {
                return Err(rejected(format!(
                    "unpacked size exceeds cap of {} bytes",
                    limits.max_bytes
                )));
            }
        }
    }
    let manifest_path = dir.join("pack.json");
    let data = std::fs::read(&manifest_path).map_err(|e| {
        RegistryError::Validation(format!(
            "missing or unreadable pack.json in {}: {e}",
            dir.display()
        ))
    })?;
    Ok(serde_json::from_slice(&data)?)
}
