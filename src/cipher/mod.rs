//! Shadowsocks AEAD cipher codec
//!
//! Supports `aes-128-gcm`, `aes-256-gcm` and `chacha20-ietf-poly1305`.
//! The master key is derived from the password with `EVP_BytesToKey` (MD5),
//! and every salt yields a session subkey through HKDF-SHA1.
//!
//! TCP streams are framed in chunks by [`AeadReader`] / [`AeadWriter`];
//! UDP datagrams are sealed whole by [`encrypt_packet`] / [`decrypt_packet`].

mod aead;
mod stream;
mod udp;

pub use aead::AeadCipher;
pub use stream::{AeadReader, AeadWriter, MAX_CHUNK_SIZE};
pub use udp::{decrypt_packet, encrypt_packet};

use crate::error::CipherError;
use hkdf::Hkdf;
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use std::collections::HashMap;
use std::fmt;

/// AEAD tag length shared by every supported method
pub const TAG_LEN: usize = 16;

/// HKDF info string for session subkeys
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    /// AES-128-GCM
    Aes128Gcm,
    /// AES-256-GCM
    Aes256Gcm,
    /// ChaCha20-IETF-Poly1305
    ChaCha20IetfPoly1305,
}

lazy_static! {
    static ref METHODS: HashMap<&'static str, CipherKind> = {
        let mut m = HashMap::new();
        m.insert("aes-128-gcm", CipherKind::Aes128Gcm);
        m.insert("aes-256-gcm", CipherKind::Aes256Gcm);
        m.insert("chacha20-ietf-poly1305", CipherKind::ChaCha20IetfPoly1305);
        m
    };
}

impl CipherKind {
    /// Look up a method by its configured name
    pub fn from_method(method: &str) -> Result<Self, CipherError> {
        METHODS
            .get(method.to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| CipherError::UnsupportedMethod(method.to_string()))
    }

    /// Method name as written in configuration
    pub fn name(self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::ChaCha20IetfPoly1305 => 32,
        }
    }

    /// Salt length in bytes (equal to the key length)
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    /// Tag length in bytes
    pub fn tag_len(self) -> usize {
        TAG_LEN
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// HKDF-SHA1 session subkey for `salt`
pub fn derive_subkey(master_key: &[u8], salt: &[u8]) -> Result<Vec<u8>, CipherError> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut okm = vec![0u8; master_key.len()];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|e| CipherError::Malformed(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Method plus master key, shared by every session of a listener
#[derive(Clone)]
pub struct CipherConfig {
    kind: CipherKind,
    master_key: Vec<u8>,
}

impl CipherConfig {
    /// Derive the master key for `method` and `password`
    pub fn new(method: &str, password: &str) -> Result<Self, CipherError> {
        let kind = CipherKind::from_method(method)?;
        Ok(CipherConfig {
            kind,
            master_key: evp_bytes_to_key(password.as_bytes(), kind.key_len()),
        })
    }

    /// Cipher method
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Master key
    pub fn master_key(&self) -> &[u8] {
        &self.master_key
    }

    /// Fresh random salt of the right length
    pub fn random_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; self.kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        salt
    }

    /// Session cipher keyed for `salt`
    pub fn session(&self, salt: &[u8]) -> Result<AeadCipher, CipherError> {
        let subkey = derive_subkey(&self.master_key, salt)?;
        AeadCipher::new(self.kind, &subkey)
    }
}

impl fmt::Debug for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherConfig")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
