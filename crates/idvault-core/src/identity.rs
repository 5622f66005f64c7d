//! Identity context.
//!
//! Each identity owns an Ed25519 keypair. The full record (public fields,
//! secret key, optional network binding) is one encrypted store entry under
//! `identity/<uuid>`, so creating or binding an identity is a single write:
//! network resolution happens first, with no store side effects, and the
//! record is committed only once it succeeds.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{fingerprint, generate_signing_key};
use crate::error::{HookError, IdentityError, NetworkError, StoreError};
use crate::hooks::{Hook, Hooks, Module};
use crate::network::{resolve_with_timeout, IdentitySeed, NetworkBinding, NetworkConfig, NetworkHandle};
use crate::store::Store;

pub const IDENTITY_PREFIX: &str = "identity/";

pub const HOOK_NEW_IDENTITY: &str = "NEW_IDENTITY";
pub const HOOK_IDENTITY_UPDATED: &str = "IDENTITY_UPDATED";
pub const HOOK_IDENTITY_BOUND: &str = "IDENTITY_BOUND";
pub const HOOK_IDENTITY_REMOVED: &str = "IDENTITY_REMOVED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    fn store_key(&self) -> String {
        format!("{IDENTITY_PREFIX}{}", self.0)
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IdentityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    /// Ed25519 public key, standard base64.
    pub public_key: String,
    pub fingerprint: String,
    #[serde(default)]
    pub network_binding: Option<NetworkHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes = general_purpose::STANDARD
            .decode(&self.public_key)
            .map_err(|e| IdentityError::InvalidRecord(format!("decode public key: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidRecord("public key length invalid".into()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| IdentityError::InvalidRecord(format!("load public key: {e}")))
    }

    /// Check a signature made by this identity's key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.verifying_key()
            .map(|key| key.verify_strict(message, signature).is_ok())
            .unwrap_or(false)
    }

    pub fn is_bound(&self) -> bool {
        self.network_binding.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub username: Option<String>,
    /// `None` creates a local-only identity.
    pub network_binding: Option<NetworkConfig>,
}

/// Fields left as `None` are not changed.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    pub username: Option<String>,
    pub status_message: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    identity: Identity,
    secret_key: String,
}

impl IdentityRecord {
    fn new(identity: Identity, key: &SigningKey) -> Self {
        let secret = Zeroizing::new(key.to_bytes());
        Self {
            identity,
            secret_key: general_purpose::STANDARD.encode(secret.as_slice()),
        }
    }

    fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        let bytes = Zeroizing::new(
            general_purpose::STANDARD
                .decode(&self.secret_key)
                .map_err(|e| IdentityError::InvalidRecord(format!("decode secret key: {e}")))?,
        );
        if bytes.len() != 32 {
            return Err(IdentityError::InvalidRecord("secret key length invalid".into()));
        }
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&bytes);
        Ok(SigningKey::from_bytes(&secret))
    }
}

impl Drop for IdentityRecord {
    fn drop(&mut self) {
        self.secret_key.zeroize();
    }
}

/// Identity operations against an unlocked [`Store`].
///
/// The context holds a clone of the store handle, so the caller can keep
/// using its own handle; both share one session.
pub struct IdentityContext {
    store: Store,
    bindings: HashMap<String, Arc<dyn NetworkBinding>>,
    hooks: Hooks,
}

impl IdentityContext {
    pub fn new(store: Store) -> Result<Self, IdentityError> {
        if !store.is_unlocked() {
            return Err(IdentityError::StoreLocked);
        }
        let mut hooks = Hooks::default();
        for name in [
            HOOK_NEW_IDENTITY,
            HOOK_IDENTITY_UPDATED,
            HOOK_IDENTITY_BOUND,
            HOOK_IDENTITY_REMOVED,
        ] {
            hooks.create(name, Module::Accounts)?;
        }
        Ok(Self {
            store,
            bindings: HashMap::new(),
            hooks,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Use `binding` for every [`NetworkConfig`] whose name matches
    /// [`NetworkBinding::network`], instead of the default adapter.
    pub fn register_binding(&mut self, binding: Arc<dyn NetworkBinding>) {
        self.bindings.insert(binding.network().to_string(), binding);
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn subscribe<F>(&mut self, name: &str, callback: F) -> Result<(), HookError>
    where
        F: Fn(&Hook, &serde_json::Value) + Send + Sync + 'static,
    {
        self.hooks.subscribe(Hook::new(name, Module::Accounts), callback)
    }

    pub async fn create_identity(&self, options: CreateOptions) -> Result<IdentityId, IdentityError> {
        self.ensure_unlocked()?;
        let id = IdentityId::new();
        let signing_key = generate_signing_key();
        let public_key = signing_key.verifying_key().to_bytes();

        let network_binding = match &options.network_binding {
            Some(config) => Some(self.resolve(id, public_key, config).await?),
            None => None,
        };

        let now = Utc::now();
        let identity = Identity {
            id,
            username: options.username,
            status_message: None,
            public_key: general_purpose::STANDARD.encode(public_key),
            fingerprint: fingerprint(&public_key),
            network_binding,
            created_at: now,
            updated_at: now,
        };
        let record = IdentityRecord::new(identity, &signing_key);
        self.write_record(&record)?;

        let network = record.identity.network_binding.as_ref().map(|h| h.network.clone());
        info!(id = %id, network = ?network, "identity created");
        self.trigger(
            HOOK_NEW_IDENTITY,
            serde_json::json!({
                "id": id.to_string(),
                "username": record.identity.username,
                "network": network,
            }),
        );
        Ok(id)
    }

    pub fn get_identity(&self, id: IdentityId) -> Result<Identity, IdentityError> {
        Ok(self.read_record(id)?.identity.clone())
    }

    /// All identities, oldest first.
    pub fn list_identities(&self) -> Result<Vec<Identity>, IdentityError> {
        let mut out = Vec::new();
        for key in self.store.keys_with_prefix(IDENTITY_PREFIX)? {
            let bytes = self.store.get(&key)?;
            let record: IdentityRecord = serde_json::from_slice(&bytes)?;
            out.push(record.identity.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    pub fn update_identity(
        &self,
        id: IdentityId,
        update: IdentityUpdate,
    ) -> Result<Identity, IdentityError> {
        let mut record = self.read_record(id)?;
        if let Some(username) = update.username {
            record.identity.username = Some(username);
        }
        if let Some(status) = update.status_message {
            record.identity.status_message = Some(status);
        }
        record.identity.updated_at = Utc::now();
        self.write_record(&record)?;
        self.trigger(
            HOOK_IDENTITY_UPDATED,
            serde_json::json!({ "id": id.to_string() }),
        );
        Ok(record.identity.clone())
    }

    /// Bind an existing local identity to a network. Same commit discipline
    /// as creation: the record changes only if resolution succeeds.
    pub async fn bind_identity(
        &self,
        id: IdentityId,
        config: &NetworkConfig,
    ) -> Result<NetworkHandle, IdentityError> {
        let record = self.read_record(id)?;
        if let Some(existing) = &record.identity.network_binding {
            return Err(IdentityError::AlreadyBound(id, existing.network.clone()));
        }
        let public_key = record.identity.verifying_key()?.to_bytes();
        let handle = self.resolve(id, public_key, config).await?;

        // re-read so a concurrent update is not overwritten
        let mut record = self.read_record(id)?;
        if let Some(existing) = &record.identity.network_binding {
            return Err(IdentityError::AlreadyBound(id, existing.network.clone()));
        }
        record.identity.network_binding = Some(handle.clone());
        record.identity.updated_at = Utc::now();
        self.write_record(&record)?;
        info!(id = %id, network = %handle.network, "identity bound");
        self.trigger(
            HOOK_IDENTITY_BOUND,
            serde_json::json!({ "id": id.to_string(), "network": handle.network, "address": handle.address }),
        );
        Ok(handle)
    }

    pub fn remove_identity(&self, id: IdentityId) -> Result<(), IdentityError> {
        self.ensure_unlocked()?;
        if !self.store.remove(&id.store_key())? {
            return Err(IdentityError::NotFound(id));
        }
        self.trigger(
            HOOK_IDENTITY_REMOVED,
            serde_json::json!({ "id": id.to_string() }),
        );
        Ok(())
    }

    pub fn sign(&self, id: IdentityId, message: &[u8]) -> Result<Signature, IdentityError> {
        let key = self.read_record(id)?.signing_key()?;
        Ok(key.sign(message))
    }

    fn ensure_unlocked(&self) -> Result<(), IdentityError> {
        if self.store.is_unlocked() {
            Ok(())
        } else {
            Err(IdentityError::StoreLocked)
        }
    }

    fn binding_for(&self, config: &NetworkConfig) -> Result<Arc<dyn NetworkBinding>, NetworkError> {
        match self.bindings.get(config.name()) {
            Some(binding) => Ok(binding.clone()),
            None => config.connect(),
        }
    }

    async fn resolve(
        &self,
        id: IdentityId,
        public_key: [u8; 32],
        config: &NetworkConfig,
    ) -> Result<NetworkHandle, IdentityError> {
        let binding = self.binding_for(config)?;
        let seed = IdentitySeed { id, public_key };
        resolve_with_timeout(binding.as_ref(), &seed, config.timeout())
            .await
            .map_err(|e| {
                warn!(id = %id, network = config.name(), error = %e, "network binding failed");
                IdentityError::from(e)
            })
    }

    fn read_record(&self, id: IdentityId) -> Result<IdentityRecord, IdentityError> {
        let bytes = self.store.get(&id.store_key()).map_err(|e| match e {
            StoreError::NotFound(_) => IdentityError::NotFound(id),
            other => other.into(),
        })?;
        let record: IdentityRecord = serde_json::from_slice(&bytes)?;
        if record.identity.id != id {
            return Err(IdentityError::InvalidRecord(format!(
                "record for {id} carries id {}",
                record.identity.id
            )));
        }
        Ok(record)
    }

    fn write_record(&self, record: &IdentityRecord) -> Result<(), IdentityError> {
        let bytes = Zeroizing::new(serde_json::to_vec(record)?);
        self.store.set(&record.identity.id.store_key(), &bytes)?;
        Ok(())
    }

    fn trigger(&self, name: &str, data: serde_json::Value) {
        self.hooks.trigger(Hook::new(name, Module::Accounts), &data);
    }
}

impl fmt::Debug for IdentityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityContext")
            .field("store", &self.store)
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .finish()
    }
}
