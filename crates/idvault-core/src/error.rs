use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::identity::IdentityId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("KDF parameters out of range: {0}")]
    InvalidParams(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("No store exists at {}", .0.display())]
    NoSuchStore(PathBuf),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Store was created concurrently at {}", .0.display())]
    CreatedConcurrently(PathBuf),

    #[error("Unlock deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("Store error during unlock: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is locked; unlock with passphrase first")]
    Locked,

    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    #[error("Store is corrupt: {0}")]
    Corrupt(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid record key: {0}")]
    InvalidKey(String),

    #[error("Encryption failed")]
    Encrypt,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Network request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rejected by network: {0}")]
    RejectedByNetwork(String),

    #[error("Malformed network response: {0}")]
    Malformed(String),

    #[error("Network binding misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Store is locked; identities are unavailable")]
    StoreLocked,

    #[error("Identity not found: {0}")]
    NotFound(IdentityId),

    #[error("Network binding failed: {0}")]
    Network(#[from] NetworkError),

    #[error("Identity {0} is already bound to {1}")]
    AlreadyBound(IdentityId, String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Identity record invalid: {0}")]
    InvalidRecord(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),
}

impl From<StoreError> for IdentityError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Locked => IdentityError::StoreLocked,
            other => IdentityError::Store(other),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("Hook already registered: {0}")]
    DuplicateHook(String),

    #[error("Hook not registered: {0}")]
    HookUnregistered(String),
}
