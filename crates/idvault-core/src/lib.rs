//! idvault-core: encrypted local identity store
//!
//! # Module layout
//! - `crypto`: Argon2id derivation, XChaCha20-Poly1305 sealing, Ed25519 keys
//! - `format`: on-disk header and record layout
//! - `session`: passphrase check and session key lifetime
//! - `store`: encrypted key-value store with autosave and atomic writes
//! - `identity`: identity records on top of an unlocked store
//! - `network`: pluggable network binding (local, JSON-RPC)
//! - `hooks`: `MODULE::NAME` event hooks
//! - `config`: vault configuration file and presets
//! - `paths`: platform data directory
//! - `error`: error types per layer

pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod hooks;
pub mod identity;
pub mod network;
pub mod paths;
pub mod session;
pub mod store;

pub use config::VaultConfig;
pub use crypto::KdfParams;
pub use error::{AuthError, CryptoError, HookError, IdentityError, NetworkError, StoreError};
pub use identity::{CreateOptions, Identity, IdentityContext, IdentityId, IdentityUpdate};
pub use network::{
    IdentitySeed, LocalBinding, Network, NetworkBinding, NetworkConfig, NetworkHandle, RpcBinding,
};
pub use store::{Store, StoreOptions};
