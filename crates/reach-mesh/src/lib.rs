// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Node identity, peer store, pairing, and trust for the Reach mesh."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Every node has a stable Ed25519 identity generated on first run and
//! persisted under restrictive permissions. Peers move through the trust
//! ladder `unknown → provisional → trusted` only by explicit confirmation
//! on both sides; any detected signature or protocol violation drops a
//! peer straight to `untrusted` and quarantines it.

mod features;
mod identity;
mod pairing;
mod peers;

pub use features::FeatureFlags;
pub use identity::{NodeIdentity, verify_hex, verify_run_signature};
pub use pairing::{PairingBook, PairingPayload, generate_pairing_code};
pub use peers::{PeerIdentity, PeerStore, TrustLevel};

use reach_core::{ErrorKind, ReachError};
use reach_store::StoreError;

/// Errors from mesh operations.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Key material could not be loaded or is malformed.
    #[error("identity key error: {0}")]
    Key(String),

    /// The peer is not in a state that permits the operation.
    #[error("trust refused: {0}")]
    TrustRefused(String),

    /// Enabling a feature requires an explicit acknowledgement.
    #[error("feature {feature:?} requires explicit acknowledgement to enable")]
    AckRequired {
        /// The gated feature name.
        feature: String,
    },

    /// The feature name is not known.
    #[error("unknown feature {0:?}")]
    UnknownFeature(String),

    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filesystem failure under `.keys/`.
    #[error("key io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parse or serialize failure.
    #[error("mesh json: {0}")]
    Json(#[from] serde_json::Error),
}

impl MeshError {
    /// Map onto the Reach error taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::TrustRefused(_) => ErrorKind::TrustRefused,
            MeshError::Key(_) | MeshError::Json(_) | MeshError::UnknownFeature(_) => {
                ErrorKind::ValidationFailure
            }
            MeshError::AckRequired { .. } => ErrorKind::ValidationFailure,
            MeshError::Store(e) => e.kind(),
            MeshError::Io(_) => ErrorKind::TransientIo,
        }
    }
}

impl From<MeshError> for ReachError {
    fn from(err: MeshError) -> Self {
        ReachError::new(err.kind(), err.to_string())
    }
}
