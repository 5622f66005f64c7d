//! Unlock gate: passphrase → session key.
//!
//! The session key is derived with Argon2id under the per-store salt and
//! checked against the verifier stored in the header. It lives only in
//! memory and is zeroized on drop.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::crypto::{derive_key, generate_salt, KdfParams, DERIVED_KEY_LEN};
use crate::error::AuthError;
use crate::format::{StoreHeader, FORMAT_VERSION, VERIFIER_LEN};

type HmacSha256 = Hmac<Sha256>;

const VERIFIER_LABEL: &[u8] = b"idvault-verifier-v1";

/// 32-byte store key held for the lifetime of an unlocked session.
#[derive(ZeroizeOnDrop)]
pub struct SessionKey([u8; DERIVED_KEY_LEN]);

impl SessionKey {
    pub(crate) fn as_bytes(&self) -> &[u8; DERIVED_KEY_LEN] {
        &self.0
    }

    fn verifier_mac(&self, salt: &[u8]) -> Result<HmacSha256, AuthError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.0)
            .map_err(|e| AuthError::KeyDerivation(format!("verifier mac: {e}")))?;
        mac.update(VERIFIER_LABEL);
        mac.update(salt);
        Ok(mac)
    }

    fn verifier(&self, salt: &[u8]) -> Result<[u8; VERIFIER_LEN], AuthError> {
        let tag = self.verifier_mac(salt)?.finalize().into_bytes();
        let mut out = [0u8; VERIFIER_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Constant-time comparison against a stored verifier.
    fn matches(&self, salt: &[u8], expected: &[u8]) -> Result<bool, AuthError> {
        Ok(self.verifier_mac(salt)?.verify_slice(expected).is_ok())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

fn derive(passphrase: &str, salt: &[u8], params: &KdfParams) -> Result<SessionKey, AuthError> {
    let key = derive_key(passphrase, salt, params)
        .map_err(|e| AuthError::KeyDerivation(e.to_string()))?;
    Ok(SessionKey(*key))
}

/// Derive the session key for an existing store.
///
/// `header` is `None` when the store file does not exist yet; the caller is
/// expected to fall back to [`create`] in that case.
pub fn unlock(
    path: &Path,
    header: Option<&StoreHeader>,
    passphrase: &str,
) -> Result<SessionKey, AuthError> {
    let header = header.ok_or_else(|| AuthError::NoSuchStore(path.to_path_buf()))?;
    let key = derive(passphrase, &header.salt, &header.kdf)?;
    if !key.matches(&header.salt, &header.verifier)? {
        debug!(path = %path.display(), "passphrase verifier mismatch");
        return Err(AuthError::InvalidPassphrase);
    }
    Ok(key)
}

/// Produce a header and session key for a brand new store.
pub fn create(params: KdfParams, passphrase: &str) -> Result<(StoreHeader, SessionKey), AuthError> {
    let salt = generate_salt();
    let key = derive(passphrase, &salt, &params)?;
    let header = StoreHeader {
        format_version: FORMAT_VERSION,
        kdf: params,
        verifier: key.verifier(&salt)?,
        salt,
    };
    Ok((header, key))
}

/// Run [`unlock`] on the blocking pool and give up after `deadline`.
///
/// Derivation itself is not interruptible. If the deadline passes first the
/// caller gets [`AuthError::DeadlineExceeded`]; the key produced later is
/// dropped inside the abandoned task and zeroized there.
pub async fn unlock_with_deadline(
    path: &Path,
    header: Option<StoreHeader>,
    passphrase: Zeroizing<String>,
    deadline: Duration,
) -> Result<SessionKey, AuthError> {
    let owned_path = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || {
        unlock(&owned_path, header.as_ref(), passphrase.as_str())
    });
    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(AuthError::KeyDerivation(format!("derivation task: {join}"))),
        Err(_) => Err(AuthError::DeadlineExceeded(deadline)),
    }
}
