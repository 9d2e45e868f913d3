// SPDX-License-Identifier: MIT OR Apache-2.0
//! Mesh feature flags with conservative defaults.

use crate::MeshError;
use serde::{Deserialize, Serialize};

/// Boolean feature flags, immutable after node startup.
///
/// Defaults keep the node quiet: nothing is discoverable or publicly
/// exposed until the operator opts in, and `public_exposure` additionally
/// requires a persisted acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Announce this node over mDNS.
    pub mdns_discovery: bool,
    /// Allow pairing through QR payloads.
    pub qr_pairing: bool,
    /// Sync with paired peers while offline from the server.
    pub offline_sync: bool,
    /// Route traffic for other mesh nodes.
    pub mesh_routing: bool,
    /// Accept connections from outside the local network.
    pub public_exposure: bool,
    /// Operator acknowledgement persisted alongside `public_exposure`.
    pub public_exposure_acknowledged: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            mdns_discovery: false,
            qr_pairing: true,
            offline_sync: true,
            mesh_routing: false,
            public_exposure: false,
            public_exposure_acknowledged: false,
        }
    }
}

impl FeatureFlags {
    /// Set a flag by name.
    ///
    /// Enabling `public_exposure` is refused unless `acknowledged` is also
    /// set; the acknowledgement is persisted with the flags.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::UnknownFeature`] for unrecognized names and
    /// [`MeshError::AckRequired`] for an unacknowledged exposure enable.
    pub fn set(&mut self, name: &str, value: bool, acknowledged: bool) -> Result<(), MeshError> {
        match name {
            "mdns_discovery" => self.mdns_discovery = value,
            "qr_pairing" => self.qr_pairing = value,
            "offline_sync" => self.offline_sync = value,
            "mesh_routing" => self.mesh_routing = value,
            "public_exposure" => {
                if value && !acknowledged {
                    return Err(MeshError::AckRequired {
                        feature: "public_exposure".into(),
                    });
                }
                self.public_exposure = value;
                self.public_exposure_acknowledged = value && acknowledged;
            }
            other => return Err(MeshError::UnknownFeature(other.to_string())),
        }
        Ok(())
    }

    /// Read a flag by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "mdns_discovery" => Some(self.mdns_discovery),
            "qr_pairing" => Some(self.qr_pairing),
            "offline_sync" => Some(self.offline_sync),
            "mesh_routing" => Some(self.mesh_routing),
            "public_exposure" => Some(self.public_exposure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let flags = FeatureFlags::default();
        assert!(!flags.mdns_discovery);
        assert!(flags.qr_pairing);
        assert!(flags.offline_sync);
        assert!(!flags.mesh_routing);
        assert!(!flags.public_exposure);
    }

    #[test]
    fn public_exposure_requires_acknowledgement() {
        let mut flags = FeatureFlags::default();
        let err = flags.set("public_exposure", true, false).unwrap_err();
        assert!(matches!(err, MeshError::AckRequired { .. }));
        assert!(!flags.public_exposure);

        flags.set("public_exposure", true, true).unwrap();
        assert!(flags.public_exposure);
        assert!(flags.public_exposure_acknowledged);
    }

    #[test]
    fn disable_clears_acknowledgement() {
        let mut flags = FeatureFlags::default();
        flags.set("public_exposure", true, true).unwrap();
        flags.set("public_exposure", false, false).unwrap();
        assert!(!flags.public_exposure);
        assert!(!flags.public_exposure_acknowledged);
    }

    #[test]
    fn unknown_feature_is_an_error() {
        let mut flags = FeatureFlags::default();
        assert!(matches!(
            flags.set("warp_drive", true, false),
            Err(MeshError::UnknownFeature(_))
        ));
        assert!(flags.get("warp_drive").is_none());
    }

    #[test]
    fn flags_round_trip_serde() {
        let mut flags = FeatureFlags::default();
        flags.set("mesh_routing", true, false).unwrap();
        let json = serde_json::to_string(&flags).unwrap();
        let back: FeatureFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
