//! JSON-RPC 2.0 binding over HTTP.
//!
//! Request:  `{"jsonrpc":"2.0","id":N,"method":"idvault_registerIdentity",
//!             "params":{"id":"<uuid>","publicKey":"<base64>"}}`
//! Response: `{"jsonrpc":"2.0","id":N,"result":{"address":"..."}}` or an
//!           `error` object, which is treated as a rejection.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use super::{IdentitySeed, NetworkBinding, NetworkConfig, NetworkHandle};
use crate::error::NetworkError;

pub const REGISTER_METHOD: &str = "idvault_registerIdentity";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<RegisterResult>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RegisterResult {
    address: String,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

pub struct RpcBinding {
    client: reqwest::Client,
    config: NetworkConfig,
    endpoint: String,
    next_id: AtomicU64,
}

impl RpcBinding {
    pub fn new(config: NetworkConfig) -> Result<Self, NetworkError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            NetworkError::Misconfigured(format!("network {} has no endpoint", config.name()))
        })?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("idvault/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout())
            .build()
            .map_err(|e| NetworkError::Misconfigured(format!("http client: {e}")))?;
        Ok(Self {
            client,
            config,
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::Timeout(self.config.timeout())
        } else {
            NetworkError::Unreachable(format!("{}: {err}", self.endpoint))
        }
    }
}

#[async_trait]
impl NetworkBinding for RpcBinding {
    fn network(&self) -> &str {
        self.config.name()
    }

    async fn resolve(&self, seed: &IdentitySeed) -> Result<NetworkHandle, NetworkError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": REGISTER_METHOD,
            "params": {
                "id": seed.id.to_string(),
                "publicKey": general_purpose::STANDARD.encode(seed.public_key),
            }
        });
        debug!(network = self.network(), endpoint = %self.endpoint, "resolving identity");
        let res = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = res.status();
        if status.is_server_error() {
            return Err(NetworkError::Unreachable(format!(
                "{} returned {status}",
                self.endpoint
            )));
        }
        if !status.is_success() {
            return Err(NetworkError::RejectedByNetwork(format!("http {status}")));
        }

        let reply: RpcResponse = res.json().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::Timeout(self.config.timeout())
            } else {
                NetworkError::Malformed(e.to_string())
            }
        })?;
        if let Some(err) = reply.error {
            return Err(NetworkError::RejectedByNetwork(format!(
                "{} (code {})",
                err.message, err.code
            )));
        }
        let result = reply
            .result
            .ok_or_else(|| NetworkError::Malformed("response has neither result nor error".into()))?;
        if result.address.trim().is_empty() {
            return Err(NetworkError::Malformed("empty address".into()));
        }
        Ok(NetworkHandle {
            network: self.network().to_string(),
            endpoint: Some(self.endpoint.clone()),
            address: result.address,
            resolved_at: Utc::now(),
        })
    }
}
