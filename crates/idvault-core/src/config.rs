//! Vault configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::crypto::KdfParams;
use crate::network::NetworkConfig;
use crate::paths;
use crate::store::StoreOptions;

pub const DEFAULT_UNLOCK_DEADLINE_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// `None` resolves to `<data dir>/datastore`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    pub autosave: bool,
    pub kdf: KdfParams,
    pub unlock_deadline_secs: u64,
    /// Network used when an identity is created with a binding and no
    /// explicit network is given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            autosave: true,
            kdf: KdfParams::default(),
            unlock_deadline_secs: DEFAULT_UNLOCK_DEADLINE_SECS,
            network: None,
        }
    }
}

impl VaultConfig {
    /// Cheap key derivation and a local devnet.
    pub fn development() -> Self {
        Self {
            kdf: KdfParams::development(),
            network: Some(NetworkConfig::devnet()),
            ..Default::default()
        }
    }

    /// Cheap key derivation, no network, autosave off so tests decide when
    /// to flush.
    pub fn testing() -> Self {
        Self {
            autosave: false,
            kdf: KdfParams::development(),
            ..Default::default()
        }
    }

    pub fn production<P: AsRef<Path>>(path: P) -> Self {
        Self {
            store_path: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_string<S: AsRef<str>>(data: S) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data.as_ref())?)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn store_path(&self) -> anyhow::Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(path.clone()),
            None => paths::default_store_path(),
        }
    }

    pub fn unlock_deadline(&self) -> Duration {
        Duration::from_secs(self.unlock_deadline_secs)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            kdf: self.kdf,
            autosave: self.autosave,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_file_fills_defaults() {
        let config = VaultConfig::from_string(r#"{"autosave": false}"#).unwrap();
        assert!(!config.autosave);
        assert_eq!(config.kdf, KdfParams::default());
        assert_eq!(config.unlock_deadline_secs, DEFAULT_UNLOCK_DEADLINE_SECS);
        assert!(config.network.is_none());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idvault.json");
        let config = VaultConfig::development();
        config.to_file(&path).unwrap();
        assert_eq!(VaultConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn explicit_store_path_wins() {
        let config = VaultConfig::production("/tmp/vault.bin");
        assert_eq!(config.store_path().unwrap(), PathBuf::from("/tmp/vault.bin"));
        assert!(config.store_options().autosave);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = VaultConfig::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
