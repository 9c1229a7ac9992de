//! Session AEAD cipher with a counter nonce

use super::CipherKind;
use crate::error::CipherError;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;

/// Nonce length for every supported method
pub const NONCE_LEN: usize = 12;

#[allow(clippy::large_enum_variant)]
enum Inner {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
    ChaCha(ChaCha20Poly1305),
}

/// AEAD cipher bound to one session subkey
///
/// The nonce starts at zero and is incremented as a little-endian integer
/// after every seal or open.
pub struct AeadCipher {
    inner: Inner,
    nonce: [u8; NONCE_LEN],
}

impl AeadCipher {
    /// Create a cipher for `kind` keyed with `subkey`
    pub fn new(kind: CipherKind, subkey: &[u8]) -> Result<Self, CipherError> {
        if subkey.len() != kind.key_len() {
            return Err(CipherError::Malformed(format!(
                "Key length {} does not match {}",
                subkey.len(),
                kind
            )));
        }
        let inner = match kind {
            CipherKind::Aes128Gcm => Inner::Aes128(Aes128Gcm::new(GenericArray::from_slice(subkey))),
            CipherKind::Aes256Gcm => Inner::Aes256(Aes256Gcm::new(GenericArray::from_slice(subkey))),
            CipherKind::ChaCha20IetfPoly1305 => {
                Inner::ChaCha(ChaCha20Poly1305::new(GenericArray::from_slice(subkey)))
            }
        };
        Ok(AeadCipher {
            inner,
            nonce: [0u8; NONCE_LEN],
        })
    }

    /// Current nonce
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    fn increment_nonce(&mut self) {
        for byte in self.nonce.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }

    /// Encrypt `plaintext`, appending the tag
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let sealed = match &self.inner {
            Inner::Aes128(c) => c.encrypt(nonce, plaintext),
            Inner::Aes256(c) => c.encrypt(nonce, plaintext),
            Inner::ChaCha(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CipherError::Encrypt)?;
        self.increment_nonce();
        Ok(sealed)
    }

    /// Decrypt `ciphertext` and verify its tag
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = GenericArray::from_slice(&self.nonce);
        let opened = match &self.inner {
            Inner::Aes128(c) => c.decrypt(nonce, ciphertext),
            Inner::Aes256(c) => c.decrypt(nonce, ciphertext),
            Inner::ChaCha(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CipherError::Decrypt)?;
        self.increment_nonce();
        Ok(opened)
    }
}
