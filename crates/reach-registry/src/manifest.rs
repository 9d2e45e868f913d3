// SPDX-License-Identifier: MIT OR Apache-2.0
//! Manifest validation and content hashing.

use crate::RegistryError;
use reach_core::PackManifest;
use semver::{Version, VersionReq};

/// What the host offers a pack, checked during validation.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// The engine version checked against `compatibility.engine_range`.
    pub engine_version: Version,
    /// The manifest schema version checked against
    /// `compatibility.schema_range`.
    pub schema_version: Version,
    /// Capability names resolvable through the mediated tool interface.
    pub available_caps: Vec<String>,
    /// Refuse packs that do not declare `signing.required = true`
    /// (`REACH_REQUIRE_PACK_SIGNATURE`).
    pub require_signature: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            engine_version: Version::new(0, 1, 0),
            schema_version: Version::new(1, 0, 0),
            available_caps: Vec::new(),
            require_signature: false,
        }
    }
}

/// Validate a manifest against the host.
///
/// Checks, in order: required fields, `spec_version`, semver ranges, DAG
/// well-formedness (finite, acyclic, unique node ids), action
/// resolvability, required capabilities, and the signature gate.
///
/// # Errors
///
/// Returns [`RegistryError::Validation`] naming the first failing check.
pub fn validate_manifest(
    manifest: &PackManifest,
    options: &ValidationOptions,
) -> Result<(), RegistryError> {
    let invalid = |message: String| Err(RegistryError::Validation(message));

    if manifest.name.is_empty() {
        return invalid("name is required".into());
    }
    if manifest.version.is_empty() {
        return invalid("version is required".into());
    }
    if Version::parse(&manifest.version).is_err() {
        return invalid(format!("version {:?} is not valid semver", manifest.version));
    }
    if manifest.spec_version != reach_core::SPEC_VERSION {
        return invalid(format!(
            "spec_version {:?} is not supported (expected {:?})",
            manifest.spec_version,
            reach_core::SPEC_VERSION
        ));
    }

    let engine_range = VersionReq::parse(&manifest.compatibility.engine_range)
        .map_err(|e| RegistryError::Validation(format!("engine_range: {e}")))?;
    if !engine_range.matches(&options.engine_version) {
        return invalid(format!(
            "engine {} does not satisfy required range {}",
            options.engine_version, manifest.compatibility.engine_range
        ));
    }
    let schema_range = VersionReq::parse(&manifest.compatibility.schema_range)
        .map_err(|e| RegistryError::Validation(format!("schema_range: {e}")))?;
    if !schema_range.matches(&options.schema_version) {
        return invalid(format!(
            "schema {} does not satisfy required range {}",
            options.schema_version, manifest.compatibility.schema_range
        ));
    }

    if manifest.dag.nodes.is_empty() {
        return invalid("dag has no nodes".into());
    }
    reach_core::dag::topo_order(&manifest.dag)
        .map_err(|e| RegistryError::Validation(e.message))?;
    for node in &manifest.dag.nodes {
        if !options.available_caps.iter().any(|cap| cap == &node.action) {
            return invalid(format!(
                "node {:?} references unresolvable action {:?}",
                node.id, node.action
            ));
        }
    }
    for cap in &manifest.compatibility.required_caps {
        if !options.available_caps.contains(cap) {
            return invalid(format!("required capability {cap:?} is not available"));
        }
    }

    if options.require_signature && !manifest.signing.as_ref().is_some_and(|s| s.required) {
        return invalid("pack signatures are enforced but this pack is unsigned".into());
    }
    Ok(())
}

/// Canonical content hash of a manifest. Packs are immutable by this hash.
///
/// # Errors
///
/// Fails if the manifest cannot be serialized.
pub fn content_hash(manifest: &PackManifest) -> Result<String, RegistryError> {
    Ok(reach_hash::hash_canonical(manifest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reach_core::{Compatibility, PackDag, PackEdge, PackNode, PackSigning};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn manifest() -> PackManifest {
        PackManifest {
            spec_version: reach_core::SPEC_VERSION.into(),
            name: "demo".into(),
            version: "1.2.3".into(),
            author: "tests".into(),
            compatibility: Compatibility {
                engine_range: ">=0.1.0".into(),
                schema_range: "^1.0".into(),
                required_caps: vec!["core.echo".into()],
            },
            metadata: BTreeMap::new(),
            dag: PackDag {
                nodes: vec![PackNode {
                    id: "n1".into(),
                    node_type: "task".into(),
                    action: "core.echo".into(),
                    inputs: json!({}),
                }],
                edges: vec![],
            },
            signing: None,
        }
    }

    fn options() -> ValidationOptions {
        ValidationOptions {
            available_caps: vec!["core.echo".into(), "core.checksum".into()],
            ..ValidationOptions::default()
        }
    }

    #[test]
    fn valid_manifest_passes() {
        validate_manifest(&manifest(), &options()).unwrap();
    }

    #[test]
    fn wrong_spec_version_fails() {
        let mut m = manifest();
        m.spec_version = "2.0".into();
        assert!(validate_manifest(&m, &options()).is_err());
    }

    #[test]
    fn bad_semver_range_fails() {
        let mut m = manifest();
        m.compatibility.engine_range = "not-a-range".into();
        assert!(validate_manifest(&m, &options()).is_err());
    }

    #[test]
    fn incompatible_engine_fails() {
        let mut m = manifest();
        m.compatibility.engine_range = ">=99.0.0".into();
        let err = validate_manifest(&m, &options()).unwrap_err();
        assert!(err.to_string().contains("does not satisfy"));
    }

    #[test]
    fn unresolvable_action_fails() {
        let mut m = manifest();
        m.dag.nodes[0].action = "missing.tool".into();
        assert!(validate_manifest(&m, &options()).is_err());
    }

    #[test]
    fn missing_required_cap_fails() {
        let mut m = manifest();
        m.compatibility.required_caps = vec!["gpu.compute".into()];
        assert!(validate_manifest(&m, &options()).is_err());
    }

    #[test]
    fn cyclic_dag_fails() {
        let mut m = manifest();
        m.dag.nodes.push(PackNode {
            id: "n2".into(),
            node_type: "task".into(),
            action: "core.echo".into(),
            inputs: json!({}),
        });
        m.dag.edges = vec![
            PackEdge {
                from: "n1".into(),
                to: "n2".into(),
            },
            PackEdge {
                from: "n2".into(),
                to: "n1".into(),
            },
        ];
        assert!(validate_manifest(&m, &options()).is_err());
    }

    #[test]
    fn signature_gate_enforced() {
        let mut opts = options();
        opts.require_signature = true;
        let mut m = manifest();
        assert!(validate_manifest(&m, &opts).is_err());
        m.signing = Some(PackSigning { required: true });
        validate_manifest(&m, &opts).unwrap();
    }

    #[test]
    fn content_hash_ignores_field_order_but_not_content() {
        let a = content_hash(&manifest()).unwrap();
        let b = content_hash(&manifest()).unwrap();
        assert_eq!(a, b);
        let mut m = manifest();
        m.version = "1.2.4".into();
        assert_ne!(content_hash(&m).unwrap(), a);
    }
}
