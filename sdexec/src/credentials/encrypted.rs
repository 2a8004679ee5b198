//! Sealed credential blobs.
//!
//! Layout, little-endian:
//!
//! ```text
//! "sHc\0" | seal u32 | timestamp u64 | not_after u64 | name_len u32 | name | iv[12] | ciphertext+tag
//! ```
//!
//! The AES-256-GCM key is `SHA-256(name)` for the null seal and
//! `SHA-256(host_key || name)` for the host seal. Timestamps are
//! microseconds since the epoch; `not_after == 0` never expires.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Blob magic.
pub const MAGIC: [u8; 4] = [0x73, 0x48, 0x63, 0x00];
/// Size of the fixed header preceding the name.
const HEADER_SIZE: usize = 28;
/// AES-GCM nonce size.
const IV_SIZE: usize = 12;
/// AES-GCM tag size.
const TAG_SIZE: usize = 16;

/// How the key of a sealed credential is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Seal {
    /// Key derived from the name alone; integrity only.
    Null,
    /// Key derived from the host secret and the name.
    Host,
}

impl Seal {
    const fn code(self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Host => 1,
        }
    }

    const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Null),
            1 => Some(Self::Host),
            _ => None,
        }
    }
}

/// Parsed header of a sealed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Header {
    /// Key derivation.
    pub seal: Seal,
    /// When the blob was sealed.
    pub timestamp: u64,
    /// Expiry; 0 means never.
    pub not_after: u64,
    /// Name the blob was sealed for; empty accepts any id.
    pub name: String,
}

fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

fn derive_key(seal: Seal, name: &str, host_key: Option<&[u8]>) -> std::result::Result<[u8; 32], String> {
    let mut h = Sha256::new();
    if seal == Seal::Host {
        h.update(host_key.ok_or("host key unavailable")?);
    }
    h.update(name.as_bytes());
    Ok(h.finalize().into())
}

/// Accepts base64 text (whitespace ignored) or raw bytes.
pub fn unwrap_base64(data: &[u8]) -> Vec<u8> {
    let cleaned: Vec<u8> = data.iter().copied().filter(|c| !c.is_ascii_whitespace()).collect();
    BASE64.decode(&cleaned).unwrap_or_else(|_| data.to_vec())
}

fn read_u32(b: &[u8], at: usize) -> u32 {
    let mut w = [0u8; 4];
    w.copy_from_slice(&b[at..at + 4]);
    u32::from_le_bytes(w)
}

fn read_u64(b: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&b[at..at + 8]);
    u64::from_le_bytes(w)
}

/// Parses the header, returning it with the offset of the IV.
pub fn parse_header(blob: &[u8]) -> std::result::Result<(Header, usize), String> {
    if blob.len() < HEADER_SIZE || blob[..4] != MAGIC {
        return Err("not a sealed credential".into());
    }
    let seal_code = read_u32(blob, 4);
    let seal = Seal::from_code(seal_code).ok_or_else(|| format!("unsupported seal type {seal_code}"))?;
    let name_len = read_u32(blob, 24) as usize;
    let name_end = HEADER_SIZE
        .checked_add(name_len)
        .filter(|&end| blob.len() >= end + IV_SIZE + TAG_SIZE)
        .ok_or("truncated sealed credential")?;
    let name = std::str::from_utf8(&blob[HEADER_SIZE..name_end])
        .map_err(|_| "credential name is not UTF-8")?
        .to_owned();
    let header = Header {
        seal,
        timestamp: read_u64(blob, 8),
        not_after: read_u64(blob, 16),
        name,
    };
    Ok((header, name_end))
}

/// Decrypts a sealed credential for `id`.
///
/// `data` may be base64. Expired blobs and blobs sealed for another name are
/// rejected.
pub fn decrypt(id: &str, data: &[u8], host_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let blob = unwrap_base64(data);
    let (header, iv_at) = parse_header(&blob).map_err(|r| Error::credential(id, r))?;

    if !header.name.is_empty() && header.name != id {
        return Err(Error::credential(
            id,
            format!("sealed for {:?}", header.name),
        ));
    }
    if header.not_after != 0 && now_usec() > header.not_after {
        return Err(Error::credential(id, "expired"));
    }

    let key = derive_key(header.seal, id, host_key).map_err(|r| Error::credential(id, r))?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| Error::credential(id, e))?;
    let iv = &blob[iv_at..iv_at + IV_SIZE];
    cipher
        .decrypt(Nonce::from_slice(iv), &blob[iv_at + IV_SIZE..])
        .map_err(|_| Error::credential(id, "decryption failed"))
}

/// Seals `plaintext` for `name`. The inverse of [`decrypt`], before base64.
pub fn seal(
    name: &str,
    plaintext: &[u8],
    seal: Seal,
    host_key: Option<&[u8]>,
    not_after: u64,
) -> Result<Vec<u8>> {
    let key = derive_key(seal, name, host_key).map_err(|r| Error::credential(name, r))?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| Error::credential(name, e))?;
    let iv: [u8; IV_SIZE] = rand::random();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::credential(name, "encryption failed"))?;
    let name_len = u32::try_from(name.len()).map_err(|_| Error::credential(name, "name too long"))?;

    let mut out = Vec::with_capacity(HEADER_SIZE + name.len() + IV_SIZE + ciphertext.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&seal.code().to_le_bytes());
    out.extend_from_slice(&now_usec().to_le_bytes());
    out.extend_from_slice(&not_after.to_le_bytes());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// [`seal`] followed by base64 encoding.
pub fn seal_base64(
    name: &str,
    plaintext: &[u8],
    seal_type: Seal,
    host_key: Option<&[u8]>,
    not_after: u64,
) -> Result<String> {
    Ok(BASE64.encode(seal(name, plaintext, seal_type, host_key, not_after)?))
}
