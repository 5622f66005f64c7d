//! Cryptographic primitives used by the store and identity layers.
//!
//! - Argon2id turns a passphrase into the 32-byte session key.
//! - XChaCha20-Poly1305 seals every record with a fresh 24-byte nonce.
//! - Ed25519 keys back each identity; BLAKE3 provides display fingerprints.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const KDF_MAX_MEMORY_KIB: u32 = 1024 * 1024; // 1GB
pub const KDF_MAX_TIME_COST: u32 = 64;
pub const KDF_MAX_PARALLELISM: u32 = 64;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Argon2id cost parameters. Written into the store header at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_COST,
            time_cost: KDF_TIME_COST,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for development stores and tests. Not for real secrets.
    pub fn development() -> Self {
        Self {
            memory_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    /// Reject costs outside the supported window. Header values are not
    /// authenticated, so this runs before any derivation.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let in_range = (1..=KDF_MAX_PARALLELISM).contains(&self.parallelism)
            && (1..=KDF_MAX_TIME_COST).contains(&self.time_cost)
            && (8 * self.parallelism..=KDF_MAX_MEMORY_KIB).contains(&self.memory_kib);
        if in_range {
            Ok(())
        } else {
            Err(CryptoError::InvalidParams(format!(
                "memory {} KiB, time {}, parallelism {}",
                self.memory_kib, self.time_cost, self.parallelism
            )))
        }
    }

    fn to_argon2(self) -> Result<Params, CryptoError> {
        self.validate()?;
        Params::new(
            self.memory_kib,
            self.time_cost,
            self.parallelism,
            Some(DERIVED_KEY_LEN),
        )
        .map_err(|e| CryptoError::InvalidParams(e.to_string()))
    }
}

pub fn derive_key(
    passphrase: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>, CryptoError> {
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut *key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
/// Returns the nonce and the ciphertext with the Poly1305 tag appended.
pub fn seal(
    key: &[u8; 32],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((nonce, ciphertext))
}

/// Decrypt and authenticate.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decrypt)
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// BLAKE3 of the public key, truncated to 20 bytes, hex in groups of 4.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = blake3::hash(public_key);
    let hex = hex::encode(&hash.as_bytes()[..20]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
