//! TOML configuration for the Cairn daemon.
//!
//! Every section is optional; missing keys fall back to the defaults of
//! [`SequencerConfig`] and a data directory under the user's home.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cairn_log::SequencerConfig;
use cairn_merkle::HasherKind;
use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node data location.
    pub node: NodeSection,
    /// Leaf store backend.
    pub storage: StorageSection,
    /// Tree hashing.
    pub tree: TreeSection,
    /// Sequencer tuning.
    pub sequencer: SequencerSection,
    /// Root signing key.
    pub signer: SignerSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (leaf store, signing key).
    pub data_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".cairn"))
            .unwrap_or_else(|| PathBuf::from(".cairn"));
        Self { data_dir }
    }
}

/// `[storage]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Backend type: `"fjall"` (default) or `"memory"`.
    pub backend: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "fjall".to_string(),
        }
    }
}

/// `[tree]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TreeSection {
    /// Hasher for logs created by this node: `"rfc6962"` (default) or
    /// `"blake3"`. Existing logs keep the hasher they were created with.
    pub hasher: HasherKind,
}

/// `[sequencer]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SequencerSection {
    /// Maximum leaves integrated per pass.
    pub batch_size: Option<usize>,
    /// Milliseconds between passes.
    pub interval_ms: Option<u64>,
    /// Re-sign an idle log once its root is this old. `0` disables re-signing.
    pub max_root_age_ms: Option<u64>,
    /// Sequencing lease lifetime in milliseconds.
    pub lease_ttl_ms: Option<u64>,
}

/// `[signer]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SignerSection {
    /// Path to the 32-byte Ed25519 secret key. Defaults to
    /// `<data_dir>/signer.key`; created on first use.
    pub key_path: Option<PathBuf>,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Whether the leaf store lives in memory only.
    pub fn is_memory(&self) -> bool {
        self.storage.backend == "memory"
    }

    /// Directory of the Fjall leaf store.
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("store")
    }

    /// Effective signing key location.
    pub fn key_path(&self) -> PathBuf {
        self.signer
            .key_path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("signer.key"))
    }

    /// Sequencer configuration with file values over the defaults.
    pub fn sequencer_config(&self) -> SequencerConfig {
        let mut config = SequencerConfig::default();
        let section = &self.sequencer;

        if let Some(batch_size) = section.batch_size {
            config.batch_size = batch_size.max(1);
        }
        if let Some(ms) = section.interval_ms {
            config.interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = section.max_root_age_ms {
            config.max_root_age = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = section.lease_ttl_ms {
            config.lease_ttl = Duration::from_millis(ms);
        }
        config
    }
}
