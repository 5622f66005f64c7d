//! On-disk layout of a store file.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       8   Magic: b"IDVLT01\0"
//!   8       4   Format version (u32 LE)
//!  12       4   Argon2 time cost (u32 LE)
//!  16       4   Argon2 memory cost KiB (u32 LE)
//!  20       4   Argon2 parallelism (u32 LE)
//!  24      32   Salt
//!  56      32   Passphrase verifier
//!  88       4   Record count (u32 LE)
//!  92      36   Reserved (zero)
//! 128     var   Records
//! ```
//!
//! Each record is `key_len (u16 LE) | key | nonce (24) | ct_len (u32 LE) | ciphertext+tag`.
//! Records are emitted in key order, so encoding an unchanged store twice
//! yields identical bytes.

use std::collections::BTreeMap;

use crate::crypto::{KdfParams, NONCE_LEN, SALT_LEN, TAG_LEN};
use crate::error::StoreError;

pub const STORE_MAGIC: &[u8; 8] = b"IDVLT01\0";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;
pub const VERIFIER_LEN: usize = 32;
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub format_version: u32,
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub verifier: [u8; VERIFIER_LEN],
}

/// A record as it sits on disk and in memory: never decrypted until read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl StoreHeader {
    pub fn to_bytes(&self, record_count: u32) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(STORE_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf.time_cost.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[24..56].copy_from_slice(&self.salt);
        buf[56..88].copy_from_slice(&self.verifier);
        buf[88..92].copy_from_slice(&record_count.to_le_bytes());
        buf
    }

    /// Parse a header, returning it together with the declared record count.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, u32), StoreError> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::Corrupt("header truncated".into()));
        }
        if &buf[..8] != STORE_MAGIC {
            return Err(StoreError::Corrupt("invalid magic".into()));
        }
        let mut cursor = Cursor::new(&buf[8..HEADER_SIZE]);
        let format_version = cursor.u32()?;
        if format_version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported format version {format_version}"
            )));
        }
        let time_cost = cursor.u32()?;
        let memory_kib = cursor.u32()?;
        let parallelism = cursor.u32()?;
        let salt = cursor.array::<SALT_LEN>()?;
        let verifier = cursor.array::<VERIFIER_LEN>()?;
        let record_count = cursor.u32()?;
        if cursor.take(HEADER_SIZE - 92)?.iter().any(|&b| b != 0) {
            return Err(StoreError::Corrupt("reserved header bytes are not zero".into()));
        }
        let kdf = KdfParams {
            memory_kib,
            time_cost,
            parallelism,
        };
        if kdf.validate().is_err() {
            return Err(StoreError::Corrupt("kdf parameters out of range".into()));
        }
        Ok((
            Self {
                format_version,
                kdf,
                salt,
                verifier,
            },
            record_count,
        ))
    }
}

pub fn encode_store(header: &StoreHeader, records: &BTreeMap<String, SealedRecord>) -> Vec<u8> {
    let body: usize = records
        .iter()
        .map(|(k, r)| 2 + k.len() + NONCE_LEN + 4 + r.ciphertext.len())
        .sum();
    let mut out = Vec::with_capacity(HEADER_SIZE + body);
    out.extend_from_slice(&header.to_bytes(records.len() as u32));
    for (key, record) in records {
        out.extend_from_slice(&(key.len() as u16).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(&record.nonce);
        out.extend_from_slice(&(record.ciphertext.len() as u32).to_le_bytes());
        out.extend_from_slice(&record.ciphertext);
    }
    out
}

pub fn decode_store(buf: &[u8]) -> Result<(StoreHeader, BTreeMap<String, SealedRecord>), StoreError> {
    let (header, record_count) = StoreHeader::from_bytes(buf)?;
    let mut cursor = Cursor::new(&buf[HEADER_SIZE..]);
    let mut records = BTreeMap::new();
    for _ in 0..record_count {
        let key_len = cursor.u16()? as usize;
        let key = String::from_utf8(cursor.take(key_len)?.to_vec())
            .map_err(|_| StoreError::Corrupt("record key is not UTF-8".into()))?;
        let nonce = cursor.array::<NONCE_LEN>()?;
        let ct_len = cursor.u32()? as usize;
        if ct_len < TAG_LEN {
            return Err(StoreError::Corrupt(format!("record {key} shorter than tag")));
        }
        let ciphertext = cursor.take(ct_len)?.to_vec();
        if records
            .insert(key.clone(), SealedRecord { nonce, ciphertext })
            .is_some()
        {
            return Err(StoreError::Corrupt(format!("duplicate record {key}")));
        }
    }
    if !cursor.is_empty() {
        return Err(StoreError::Corrupt("trailing bytes after records".into()));
    }
    Ok((header, records))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StoreError::Corrupt("record truncated".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], StoreError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, StoreError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}
