//! Network identity binding.
//!
//! An identity may be bound to an external network (a chain devnet, a
//! registry service). The identity layer only sees the [`NetworkBinding`]
//! capability; adapters decide how `resolve` talks to the network.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;
use crate::identity::IdentityId;

mod local;
mod rpc;

pub use local::LocalBinding;
pub use rpc::{RpcBinding, REGISTER_METHOD};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEVNET_ENDPOINT: &str = "http://127.0.0.1:8899";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Local,
    Devnet,
    Testnet,
    Mainnet,
    Custom(String),
}

impl Network {
    pub fn name(&self) -> &str {
        match self {
            Network::Local => "local",
            Network::Devnet => "devnet",
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
            Network::Custom(name) => name,
        }
    }
}

impl From<&str> for Network {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "local" => Network::Local,
            "devnet" => Network::Devnet,
            "testnet" => Network::Testnet,
            "mainnet" => Network::Mainnet,
            _ => Network::Custom(value.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl NetworkConfig {
    pub fn local() -> Self {
        Self {
            network: Network::Local,
            endpoint: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn devnet() -> Self {
        Self {
            network: Network::Devnet,
            endpoint: Some(DEVNET_ENDPOINT.to_string()),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn testnet<S: Into<String>>(endpoint: S) -> Self {
        Self {
            network: Network::Testnet,
            endpoint: Some(endpoint.into()),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn custom<N: Into<String>, E: Into<String>>(name: N, endpoint: E) -> Self {
        Self {
            network: Network::Custom(name.into()),
            endpoint: Some(endpoint.into()),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn name(&self) -> &str {
        self.network.name()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn from_string<S: AsRef<str>>(data: S) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(data.as_ref())?)
    }

    /// Build the default adapter for this configuration.
    pub fn connect(&self) -> Result<Arc<dyn NetworkBinding>, NetworkError> {
        match self.network {
            Network::Local => Ok(Arc::new(LocalBinding::new())),
            _ => Ok(Arc::new(RpcBinding::new(self.clone())?)),
        }
    }
}

/// Public identity material handed to a network. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySeed {
    pub id: IdentityId,
    pub public_key: [u8; 32],
}

/// What a network returned for an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHandle {
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub address: String,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait NetworkBinding: Send + Sync {
    /// Network name this adapter serves, matched against [`NetworkConfig::name`].
    fn network(&self) -> &str;

    async fn resolve(&self, seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError>;
}

/// Resolve with an upper bound. On expiry the in-flight request is dropped
/// and nothing it may have produced is returned. No retries.
pub async fn resolve_with_timeout(
    binding: &dyn NetworkBinding,
    seed: &IdentitySeed,
    timeout: Duration,
) -> Result<NetworkHandle, NetworkError> {
    match tokio::time::timeout(timeout, binding.resolve(seed)).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout(timeout)),
    }
}
