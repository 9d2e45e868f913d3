// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Configuration: data-dir layout, reach.toml, and environment overrides."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Precedence, lowest to highest: built-in defaults, `reach.toml` in the
//! data dir, then environment variables. `ZEO_FIXED_TIME` selects the
//! deterministic clock for the whole process.

use reach_core::clock::SharedClock;
use reach_core::{FixedClock, SystemClock};
use reach_store::{CasOptions, EvictionPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable naming the data directory.
pub const ENV_DATA_DIR: &str = "REACH_DATA_DIR";
/// Environment variable naming the coordination server.
pub const ENV_SERVER_URL: &str = "REACH_SERVER_URL";
/// Environment variable forcing the deterministic clock (epoch seconds).
pub const ENV_FIXED_TIME: &str = "ZEO_FIXED_TIME";
/// Environment variable enforcing signed packs.
pub const ENV_REQUIRE_PACK_SIGNATURE: &str = "REACH_REQUIRE_PACK_SIGNATURE";
/// Environment variable capping total CAS bytes.
pub const ENV_CAS_MAX_SIZE: &str = "REACH_CAS_MAX_SIZE_BYTES";
/// Environment variable selecting the CAS eviction policy (`lru`/`reject`).
pub const ENV_CAS_EVICTION: &str = "REACH_CAS_EVICTION_POLICY";

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `reach.toml` exists but does not parse.
    #[error("invalid reach.toml: {0}")]
    Toml(#[from] toml::de::Error),

    /// An environment variable holds an unusable value.
    #[error("invalid value for {name}: {value:?}")]
    BadEnvValue {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },

    /// Filesystem failure reading configuration.
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory root.
    pub data_dir: PathBuf,
    /// Coordination server URL, if any.
    pub server_url: Option<String>,
    /// Refuse unsigned packs.
    pub require_pack_signature: bool,
    /// CAS byte cap.
    pub cas_max_size_bytes: Option<u64>,
    /// CAS behavior at the cap.
    pub cas_eviction: EvictionPolicy,
    /// Deterministic clock pin (epoch seconds), if forced.
    pub fixed_time: Option<i64>,
}

/// The optional `reach.toml` file shape; every field overrides a default.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    server_url: Option<String>,
    require_pack_signature: Option<bool>,
    cas_max_size_bytes: Option<u64>,
    cas_eviction_policy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            server_url: None,
            require_pack_signature: false,
            cas_max_size_bytes: None,
            cas_eviction: EvictionPolicy::Lru,
            fixed_time: None,
        }
    }
}

impl Config {
    /// Load configuration from defaults, `reach.toml`, and the environment.
    ///
    /// # Errors
    ///
    /// Fails on a malformed `reach.toml` or unusable environment values.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Ok(dir) = std::env::var(ENV_DATA_DIR)
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }
        config.apply_file()?;
        config.apply_env()?;
        Ok(config)
    }

    /// Load with an explicit data dir (e.g. from a CLI flag), then file and
    /// environment.
    ///
    /// # Errors
    ///
    /// Same surface as [`Config::load`].
    pub fn load_with_data_dir(data_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Config {
            data_dir: data_dir.to_path_buf(),
            ..Config::default()
        };
        config.apply_file()?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self) -> Result<(), ConfigError> {
        let path = self.data_dir.join("reach.toml");
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let file: FileConfig = toml::from_str(&text)?;
        if file.server_url.is_some() {
            self.server_url = file.server_url;
        }
        if let Some(flag) = file.require_pack_signature {
            self.require_pack_signature = flag;
        }
        if file.cas_max_size_bytes.is_some() {
            self.cas_max_size_bytes = file.cas_max_size_bytes;
        }
        if let Some(policy) = file.cas_eviction_policy {
            self.cas_eviction = EvictionPolicy::parse(&policy).ok_or(ConfigError::BadEnvValue {
                name: "cas_eviction_policy",
                value: policy,
            })?;
        }
        tracing::debug!(path = %path.display(), "loaded reach.toml");
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var(ENV_SERVER_URL)
            && !url.is_empty()
        {
            self.server_url = Some(url);
        }
        if let Ok(value) = std::env::var(ENV_REQUIRE_PACK_SIGNATURE) {
            self.require_pack_signature = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var(ENV_CAS_MAX_SIZE)
            && !value.is_empty()
        {
            let parsed = value.parse().map_err(|_| ConfigError::BadEnvValue {
                name: ENV_CAS_MAX_SIZE,
                value: value.clone(),
            })?;
            self.cas_max_size_bytes = Some(parsed);
        }
        if let Ok(value) = std::env::var(ENV_CAS_EVICTION)
            && !value.is_empty()
        {
            self.cas_eviction =
                EvictionPolicy::parse(&value).ok_or(ConfigError::BadEnvValue {
                    name: ENV_CAS_EVICTION,
                    value,
                })?;
        }
        if let Ok(value) = std::env::var(ENV_FIXED_TIME)
            && !value.is_empty()
        {
            let secs = value.parse().map_err(|_| ConfigError::BadEnvValue {
                name: ENV_FIXED_TIME,
                value: value.clone(),
            })?;
            self.fixed_time = Some(secs);
        }
        Ok(())
    }

    /// The clock this configuration selects.
    #[must_use]
    pub fn clock(&self) -> SharedClock {
        match self.fixed_time {
            Some(secs) => Arc::new(FixedClock::from_epoch_secs(secs)),
            None => Arc::new(SystemClock),
        }
    }

    /// Whether the deterministic clock is in force.
    #[must_use]
    pub fn deterministic(&self) -> bool {
        self.fixed_time.is_some()
    }

    /// The CAS options this configuration selects.
    #[must_use]
    pub fn cas_options(&self) -> CasOptions {
        CasOptions {
            max_size_bytes: self.cas_max_size_bytes,
            eviction: self.cas_eviction,
        }
    }

    /// The on-disk layout rooted at this configuration's data dir.
    #[must_use]
    pub fn layout(&self) -> DataLayout {
        DataLayout {
            root: self.data_dir.clone(),
        }
    }
}

/// Paths under the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    /// The data dir root.
    pub root: PathBuf,
}

impl DataLayout {
    /// `reach.db`, the relational store.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join("reach.db")
    }

    /// Content-addressed blob root.
    #[must_use]
    pub fn cas_dir(&self) -> PathBuf {
        self.root.join("cas")
    }

    /// `runs/<run_id>.json`.
    #[must_use]
    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// `capsules/<run_id>.capsule.json`.
    #[must_use]
    pub fn capsules_dir(&self) -> PathBuf {
        self.root.join("capsules")
    }

    /// `signatures/<run_id>.sig.json`.
    #[must_use]
    pub fn signatures_dir(&self) -> PathBuf {
        self.root.join("signatures")
    }

    /// `.keys/`, restrictive permissions.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.root.join(".keys")
    }

    /// `.reach/delegations/<delegation_id>.json`.
    #[must_use]
    pub fn delegations_dir(&self) -> PathBuf {
        self.root.join(".reach").join("delegations")
    }
}
