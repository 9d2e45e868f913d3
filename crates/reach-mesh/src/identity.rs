// SPDX-License-Identifier: MIT OR Apache-2.0
//! Node identity: Ed25519 keys, persisted under restrictive permissions.

use crate::MeshError;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use reach_core::RunSignature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const KEY_FILE: &str = "node.json";

/// This node's stable identity.
pub struct NodeIdentity {
    /// Derived from the public key; stable for the life of the key pair.
    pub node_id: String,
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    node_id: String,
    public_key: String,
    secret_key: String,
}

impl NodeIdentity {
    /// Generate a fresh identity.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let node_id = derive_node_id(&signing_key.verifying_key());
        Self {
            node_id,
            signing_key,
        }
    }

    /// Load the identity from `<keys_dir>/node.json`, generating and
    /// persisting one on first run.
    ///
    /// The key file is written `0o600` inside a `0o700` directory.
    ///
    /// # Errors
    ///
    /// Fails on unreadable or malformed key material.
    pub fn load_or_generate(keys_dir: &Path) -> Result<Self, MeshError> {
        let path = keys_dir.join(KEY_FILE);
        if path.exists() {
            return Self::load(keys_dir);
        }
        let identity = Self::generate();
        identity.save(keys_dir)?;
        tracing::info!(node_id = %identity.node_id, "generated node identity");
        Ok(identity)
    }

    /// Load an existing identity.
    ///
    /// # Errors
    ///
    /// Fails when the file is missing, malformed, or inconsistent.
    pub fn load(keys_dir: &Path) -> Result<Self, MeshError> {
        let bytes = std::fs::read(keys_dir.join(KEY_FILE))?;
        let file: KeyFile = serde_json::from_slice(&bytes)?;
        let secret = decode_key::<32>(&file.secret_key)?;
        let signing_key = SigningKey::from_bytes(&secret);
        let derived = derive_node_id(&signing_key.verifying_key());
        if derived != file.node_id {
            return Err(MeshError::Key(
                "stored node_id does not match the key material".into(),
            ));
        }
        Ok(Self {
            node_id: file.node_id,
            signing_key,
        })
    }

    /// Persist the identity under `keys_dir`.
    ///
    /// # Errors
    ///
    /// Fails on filesystem errors.
    pub fn save(&self, keys_dir: &Path) -> Result<PathBuf, MeshError> {
        std::fs::create_dir_all(keys_dir)?;
        restrict_permissions(keys_dir, 0o700)?;
        let path = keys_dir.join(KEY_FILE);
        let file = KeyFile {
            node_id: self.node_id.clone(),
            public_key: self.public_key_hex(),
            secret_key: hex::encode(self.signing_key.to_bytes()),
        };
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');
        std::fs::write(&path, bytes)?;
        restrict_permissions(&path, 0o600)?;
        Ok(path)
    }

    /// Hex-encoded public key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a message, returning the hex-encoded signature.
    #[must_use]
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Produce a detached run signature over `run_id || proof_hash`.
    #[must_use]
    pub fn sign_run(&self, run_id: Uuid, proof_hash: &str, now: DateTime<Utc>) -> RunSignature {
        let message = run_signature_message(run_id, proof_hash);
        RunSignature {
            run_id,
            proof_hash: proof_hash.to_string(),
            algorithm: "ed25519".to_string(),
            public_key: self.public_key_hex(),
            signature_hex: self.sign_hex(&message),
            signed_at: now,
        }
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Verify a detached run signature.
///
/// # Errors
///
/// Returns [`MeshError::Key`] for undecodable key or signature material;
/// a clean `false` means the signature simply does not verify.
pub fn verify_run_signature(signature: &RunSignature) -> Result<bool, MeshError> {
    let key = VerifyingKey::from_bytes(&decode_key::<32>(&signature.public_key)?)
        .map_err(|e| MeshError::Key(e.to_string()))?;
    let sig = Signature::from_bytes(&decode_key::<64>(&signature.signature_hex)?);
    let message = run_signature_message(signature.run_id, &signature.proof_hash);
    Ok(key.verify(&message, &sig).is_ok())
}

/// Verify a hex signature over arbitrary bytes against a hex public key.
///
/// # Errors
///
/// Returns [`MeshError::Key`] for undecodable material.
pub fn verify_hex(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<bool, MeshError> {
    let key = VerifyingKey::from_bytes(&decode_key::<32>(public_key_hex)?)
        .map_err(|e| MeshError::Key(e.to_string()))?;
    let sig = Signature::from_bytes(&decode_key::<64>(signature_hex)?);
    Ok(key.verify(message, &sig).is_ok())
}

fn run_signature_message(run_id: Uuid, proof_hash: &str) -> Vec<u8> {
    let mut message = run_id.to_string().into_bytes();
    message.extend_from_slice(proof_hash.as_bytes());
    message
}

fn derive_node_id(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_bytes());
    let digest = hasher.finalize();
    format!("node-{}", hex::encode(&digest[..8]))
}

fn decode_key<const N: usize>(hex_str: &str) -> Result<[u8; N], MeshError> {
    let bytes = hex::decode(hex_str).map_err(|e| MeshError::Key(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| MeshError::Key(format!("expected {N} bytes of key material")))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> Result<(), MeshError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> Result<(), MeshError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join(".keys");
        let first = NodeIdentity::load_or_generate(&keys).unwrap();
        let second = NodeIdentity::load_or_generate(&keys).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.public_key_hex(), second.public_key_hex());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join(".keys");
        NodeIdentity::load_or_generate(&keys).unwrap();
        let dir_mode = std::fs::metadata(&keys).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        let file_mode = std::fs::metadata(keys.join("node.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn tampered_node_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join(".keys");
        NodeIdentity::load_or_generate(&keys).unwrap();
        let path = keys.join("node.json");
        let mut file: KeyFile =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        file.node_id = "node-impostor".into();
        std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        assert!(matches!(
            NodeIdentity::load(&keys),
            Err(MeshError::Key(_))
        ));
    }

    #[test]
    fn run_signature_round_trips() {
        let identity = NodeIdentity::generate();
        let run_id = Uuid::new_v4();
        let signature = identity.sign_run(run_id, "abc123", Utc::now());
        assert_eq!(signature.algorithm, "ed25519");
        assert!(verify_run_signature(&signature).unwrap());
    }

    #[test]
    fn forged_run_signature_fails() {
        let identity = NodeIdentity::generate();
        let run_id = Uuid::new_v4();
        let mut signature = identity.sign_run(run_id, "abc123", Utc::now());
        signature.proof_hash = "abc124".into();
        assert!(!verify_run_signature(&signature).unwrap());
        // A different key also fails.
        let other = NodeIdentity::generate();
        let mut stolen = identity.sign_run(run_id, "abc123", Utc::now());
        stolen.public_key = other.public_key_hex();
        assert!(!verify_run_signature(&stolen).unwrap());
    }

    #[test]
    fn debug_hides_key_material() {
        let identity = NodeIdentity::generate();
        let debug = format!("{identity:?}");
        assert!(debug.contains(&identity.node_id));
        assert!(!debug.contains(&hex::encode(identity.signing_key.to_bytes())));
    }
}
