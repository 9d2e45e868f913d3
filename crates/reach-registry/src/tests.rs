// SPDX-License-Identifier: MIT OR Apache-2.0

use super::*;

const MANIFEST: &str = r#"{
    "spec_version": "1.0",
    "name": "demo",
    "version": "0.1.0",
    "author": "tests",
    "compatibility": {"engine_range": "*", "schema_range": "*", "required_caps": []},
    "dag": {"nodes": [{"id": "n1", "type": "task", "action": "core.echo", "inputs": {}}], "edges": []}
}"#;

fn registry(data_dir: &Path) -> PackRegistry {
    PackRegistry::open(
        data_dir,
        ValidationOptions {
            available_caps: vec!["core.echo".into(), "core.checksum".into()],
            ..ValidationOptions::default()
        },
        ArchiveLimits::default(),
    )
    .unwrap()
}

fn pack_source(dir: &Path, manifest: &str) -> IngestSource {
    let pack_dir = dir.join("pack-src");
    std::fs::create_dir_all(&pack_dir).unwrap();
    std::fs::write(pack_dir.join("pack.json"), manifest).unwrap();
    IngestSource::Directory(pack_dir)
}

#[test]
fn add_pack_registers_and_pins() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let source = pack_source(dir.path(), MANIFEST);
    let (manifest, entry) = registry.add_pack(&source, false).unwrap();
    assert_eq!(manifest.name, "demo");
    assert_eq!(entry.version, "0.1.0");
    assert_eq!(entry.content_hash.len(), 64);

    let loaded = registry.get("demo").unwrap();
    assert_eq!(content_hash(&loaded).unwrap(), entry.content_hash);
    let listed = registry.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "demo");
}

#[test]
fn re_add_requires_replace() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let source = pack_source(dir.path(), MANIFEST);
    registry.add_pack(&source, false).unwrap();
    // Identical content re-pins silently.
    registry.add_pack(&source, false).unwrap();
    // Changed content without replace conflicts.
    let bumped = MANIFEST.replace("\"version\": \"0.1.0\"", "\"version\": \"0.2.0\"");
    let source2 = pack_source(&dir.path().join("v2"), &bumped);
    let err = registry.add_pack(&source2, false).unwrap_err();
    assert!(matches!(err, RegistryError::LockConflict { .. }));
    registry.add_pack(&source2, true).unwrap();
    assert_eq!(registry.list().unwrap()[0].1.version, "0.2.0");
}

#[test]
fn invalid_manifest_is_not_registered() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let bad = MANIFEST.replace("core.echo", "missing.tool");
    let source = pack_source(dir.path(), &bad);
    assert!(registry.add_pack(&source, false).is_err());
    assert!(matches!(
        registry.get("demo").unwrap_err(),
        RegistryError::UnknownPack(_)
    ));
}

#[test]
fn snapshot_hash_tracks_lockfile_contents() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let empty = registry.snapshot_hash().unwrap();
    registry
        .add_pack(&pack_source(dir.path(), MANIFEST), false)
        .unwrap();
    let with_pack = registry.snapshot_hash().unwrap();
    assert_ne!(empty, with_pack);
    // Deterministic for identical contents.
    assert_eq!(registry.snapshot_hash().unwrap(), with_pack);
}

#[test]
fn unknown_pack_kind_is_validation_failure() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let err = registry.get("ghost").unwrap_err();
    assert_eq!(err.kind(), reach_core::ErrorKind::ValidationFailure);
}
