use async_trait::async_trait;
use chrono::Utc;

use super::{IdentitySeed, NetworkBinding, NetworkHandle};
use crate::error::NetworkError;

/// Binding for identities that never leave this machine.
#[derive(Debug, Default, Clone)]
pub struct LocalBinding;

impl LocalBinding {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkBinding for LocalBinding {
    fn network(&self) -> &str {
        "local"
    }

    async fn resolve(&self, seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError> {
        let digest = blake3::hash(&seed.public_key);
        Ok(NetworkHandle {
            network: self.network().to_string(),
            endpoint: None,
            address: format!("local:{}", hex::encode(&digest.as_bytes()[..20])),
            resolved_at: Utc::now(),
        })
    }
}
