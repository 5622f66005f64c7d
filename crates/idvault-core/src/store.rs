//! Encrypted key-value store.
//!
//! Records are sealed with XChaCha20-Poly1305 under the session key at `set`
//! time and stay sealed in memory; `get` decrypts on demand. The whole store
//! is persisted as one file (see [`crate::format`]) written through a
//! temporary file and an atomic rename.
//!
//! [`Store`] is a shared handle: clones see the same session and records.
//! Writers are serialised by the internal write lock, readers run
//! concurrently. When the last handle is dropped, pending changes are
//! flushed if autosave is on, and the session key is zeroized.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, KdfParams};
use crate::error::{AuthError, StoreError};
use crate::format::{decode_store, encode_store, SealedRecord, StoreHeader, MAX_KEY_LEN};
use crate::session::{self, SessionKey};

const RECORD_AAD_PREFIX: &[u8] = b"idvault-record-v1\0";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Cost parameters used when the store file is created.
    pub kdf: KdfParams,
    pub autosave: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            autosave: false,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    kdf: KdfParams,
    state: RwLock<StoreState>,
}

struct StoreState {
    header: Option<StoreHeader>,
    records: BTreeMap<String, SealedRecord>,
    session: Option<SessionKey>,
    autosave: bool,
    dirty: bool,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Load the store file if present. The handle starts locked either way.
    pub fn open_with<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let (header, records) = match fs::read(&path) {
            Ok(bytes) => {
                let (header, records) = decode_store(&bytes)?;
                (Some(header), records)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => (None, BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        debug!(
            path = %path.display(),
            exists = header.is_some(),
            records = records.len(),
            "store opened"
        );
        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                kdf: options.kdf,
                state: RwLock::new(StoreState {
                    header,
                    records,
                    session: None,
                    autosave: options.autosave,
                    dirty: false,
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Unlock with `passphrase`, creating the store file if it does not exist.
    pub fn unlock(&self, passphrase: &str) -> Result<(), AuthError> {
        match self.unlock_existing(passphrase) {
            Err(AuthError::NoSuchStore(_)) => {
                let (header, key) = session::create(self.inner.kdf, passphrase)?;
                self.install_created(header, key)
            }
            other => other,
        }
    }

    /// Unlock an existing store; fails with [`AuthError::NoSuchStore`] instead
    /// of creating one.
    pub fn unlock_existing(&self, passphrase: &str) -> Result<(), AuthError> {
        let header = self.inner.state.read().header.clone();
        match session::unlock(&self.inner.path, header.as_ref(), passphrase) {
            Ok(key) => {
                self.install_session(key);
                Ok(())
            }
            Err(e) => {
                self.drop_session();
                Err(e)
            }
        }
    }

    /// Like [`Store::unlock`], but key derivation runs on the blocking pool
    /// and is abandoned once `deadline` passes.
    pub async fn unlock_with_deadline(
        &self,
        passphrase: &str,
        deadline: Duration,
    ) -> Result<(), AuthError> {
        let header = self.inner.state.read().header.clone();
        let secret = Zeroizing::new(passphrase.to_string());
        match session::unlock_with_deadline(&self.inner.path, header, secret, deadline).await {
            Ok(key) => {
                self.install_session(key);
                Ok(())
            }
            Err(AuthError::NoSuchStore(_)) => {
                let kdf = self.inner.kdf;
                let secret = Zeroizing::new(passphrase.to_string());
                let task = tokio::task::spawn_blocking(move || session::create(kdf, &secret));
                let (header, key) = match tokio::time::timeout(deadline, task).await {
                    Ok(Ok(created)) => created?,
                    Ok(Err(join)) => {
                        return Err(AuthError::KeyDerivation(format!("derivation task: {join}")))
                    }
                    Err(_) => return Err(AuthError::DeadlineExceeded(deadline)),
                };
                self.install_created(header, key)
            }
            Err(e) => {
                self.drop_session();
                Err(e)
            }
        }
    }

    fn install_session(&self, key: SessionKey) {
        self.inner.state.write().session = Some(key);
        info!(path = %self.inner.path.display(), "store unlocked");
    }

    /// A failed unlock leaves the handle locked even if it was unlocked before.
    fn drop_session(&self) {
        if self.inner.state.write().session.take().is_some() {
            warn!(path = %self.inner.path.display(), "unlock failed; previous session dropped");
        }
    }

    fn install_created(&self, header: StoreHeader, key: SessionKey) -> Result<(), AuthError> {
        let mut state = self.inner.state.write();
        if state.header.is_some() {
            return Err(AuthError::CreatedConcurrently(self.inner.path.clone()));
        }
        let bytes = encode_store(&header, &state.records);
        match write_atomic(&self.inner.path, &bytes, true) {
            Ok(()) => {}
            Err(StoreError::IoFailure(e)) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(AuthError::CreatedConcurrently(self.inner.path.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        state.header = Some(header);
        state.session = Some(key);
        state.dirty = false;
        info!(path = %self.inner.path.display(), "created new store");
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.inner.state.read().session.is_some()
    }

    /// Drop the session key. Pending changes are flushed first when autosave
    /// is on; the key is discarded even if that flush fails.
    pub fn lock(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.write();
        let result = if state.autosave && state.dirty && state.session.is_some() {
            persist(&self.inner.path, &mut state)
        } else {
            Ok(())
        };
        state.session = None;
        info!(path = %self.inner.path.display(), "store locked");
        result
    }

    pub fn enable_autosave(&self) {
        self.inner.state.write().autosave = true;
    }

    pub fn disable_autosave(&self) {
        self.inner.state.write().autosave = false;
    }

    pub fn autosave_enabled(&self) -> bool {
        self.inner.state.read().autosave
    }

    /// True when there are changes not yet written to disk.
    pub fn has_pending_changes(&self) -> bool {
        self.inner.state.read().dirty
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut state = self.inner.state.write();
        let sealed = {
            let session = state.session.as_ref().ok_or(StoreError::Locked)?;
            seal_record(session, key, value)?
        };
        let was_dirty = state.dirty;
        let previous = state.records.insert(key.to_string(), sealed);
        state.dirty = true;
        if state.autosave {
            if let Err(e) = persist(&self.inner.path, &mut state) {
                match previous {
                    Some(record) => state.records.insert(key.to_string(), record),
                    None => state.records.remove(key),
                };
                state.dirty = was_dirty;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let state = self.inner.state.read();
        let session = state.session.as_ref().ok_or(StoreError::Locked)?;
        let record = state
            .records
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let plaintext = open_record(session, key, record)?;
        Ok(Bytes::copy_from_slice(&plaintext))
    }

    /// Remove a record. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.state.write();
        if state.session.is_none() {
            return Err(StoreError::Locked);
        }
        let Some(previous) = state.records.remove(key) else {
            return Ok(false);
        };
        let was_dirty = state.dirty;
        state.dirty = true;
        if state.autosave {
            if let Err(e) = persist(&self.inner.path, &mut state) {
                state.records.insert(key.to_string(), previous);
                state.dirty = was_dirty;
                return Err(e);
            }
        }
        Ok(true)
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let state = self.inner.state.read();
        if state.session.is_none() {
            return Err(StoreError::Locked);
        }
        Ok(state.records.contains_key(key))
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.keys_with_prefix("")
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.inner.state.read();
        if state.session.is_none() {
            return Err(StoreError::Locked);
        }
        Ok(state
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    /// Write pending changes to disk. A flush with nothing pending leaves the
    /// file untouched.
    pub fn flush(&self) -> Result<(), StoreError> {
        let mut state = self.inner.state.write();
        if state.session.is_none() {
            return Err(StoreError::Locked);
        }
        if !state.dirty {
            return Ok(());
        }
        persist(&self.inner.path, &mut state)
    }

    /// Re-key every record under a new passphrase and a fresh salt.
    pub fn change_passphrase(&self, old: &str, new: &str) -> Result<(), AuthError> {
        if !self.is_unlocked() {
            return Err(StoreError::Locked.into());
        }
        let header = self.inner.state.read().header.clone();
        let old_key = session::unlock(&self.inner.path, header.as_ref(), old)?;
        let kdf = header.map(|h| h.kdf).unwrap_or(self.inner.kdf);
        let (new_header, new_key) = session::create(kdf, new)?;

        let mut state = self.inner.state.write();
        let mut rekeyed = BTreeMap::new();
        for (key, record) in &state.records {
            let plaintext = open_record(&old_key, key, record)?;
            rekeyed.insert(key.clone(), seal_record(&new_key, key, &plaintext)?);
        }
        let bytes = encode_store(&new_header, &rekeyed);
        write_atomic(&self.inner.path, &bytes, false)?;
        state.header = Some(new_header);
        state.records = rekeyed;
        state.session = Some(new_key);
        state.dirty = false;
        info!(path = %self.inner.path.display(), "store passphrase changed");
        Ok(())
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("unlocked", &state.session.is_some())
            .field("autosave", &state.autosave)
            .field("records", &state.records.len())
            .finish()
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.dirty {
            return;
        }
        if state.autosave && state.session.is_some() {
            if let Err(e) = persist(&self.path, state) {
                error!(path = %self.path.display(), error = %e, "flush on release failed");
            }
        } else {
            warn!(
                path = %self.path.display(),
                "store released with unflushed changes; they were discarded"
            );
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}

fn record_aad(key: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(RECORD_AAD_PREFIX.len() + key.len());
    aad.extend_from_slice(RECORD_AAD_PREFIX);
    aad.extend_from_slice(key.as_bytes());
    aad
}

fn seal_record(session: &SessionKey, key: &str, value: &[u8]) -> Result<SealedRecord, StoreError> {
    let (nonce, ciphertext) = crypto::seal(session.as_bytes(), &record_aad(key), value)
        .map_err(|_| StoreError::Encrypt)?;
    Ok(SealedRecord { nonce, ciphertext })
}

fn open_record(
    session: &SessionKey,
    key: &str,
    record: &SealedRecord,
) -> Result<Zeroizing<Vec<u8>>, StoreError> {
    crypto::open(
        session.as_bytes(),
        &record.nonce,
        &record_aad(key),
        &record.ciphertext,
    )
    .map_err(|_| StoreError::Corrupt(format!("authentication failed for record {key}")))
}

fn persist(path: &Path, state: &mut StoreState) -> Result<(), StoreError> {
    let header = state.header.as_ref().ok_or(StoreError::Locked)?;
    let bytes = encode_store(header, &state.records);
    write_atomic(path, &bytes, false)?;
    state.dirty = false;
    debug!(path = %path.display(), records = state.records.len(), "store flushed");
    Ok(())
}

/// Write via a synced temporary file in the target directory, then rename.
/// With `create_new` the rename fails if the target already exists.
fn write_atomic(path: &Path, bytes: &[u8], create_new: bool) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if create_new {
        tmp.persist_noclobber(path).map_err(|e| e.error)?;
    } else {
        tmp.persist(path).map_err(|e| e.error)?;
    }
    sync_dir(dir)?;
    Ok(())
}

/// Make the rename itself durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}
