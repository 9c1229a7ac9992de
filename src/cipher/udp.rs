//! Single-shot AEAD sealing for UDP datagrams
//!
//! ```text
//! [salt][enc(payload) + tag]
//! ```
//!
//! Every datagram carries a fresh salt and is sealed with a zero nonce.

use super::CipherConfig;
use crate::error::CipherError;

/// Seal one datagram
pub fn encrypt_packet(config: &CipherConfig, payload: &[u8]) -> Result<Vec<u8>, CipherError> {
    let salt = config.random_salt();
    let mut cipher = config.session(&salt)?;
    let sealed = cipher.seal(payload)?;

    let mut out = Vec::with_capacity(salt.len() + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Open one datagram
pub fn decrypt_packet(config: &CipherConfig, datagram: &[u8]) -> Result<Vec<u8>, CipherError> {
    let salt_len = config.kind().salt_len();
    if datagram.len() < salt_len + config.kind().tag_len() {
        return Err(CipherError::Malformed(format!(
            "Datagram too short: {} bytes",
            datagram.len()
        )));
    }
    let (salt, sealed) = datagram.split_at(salt_len);
    let mut cipher = config.session(salt)?;
    cipher.open(sealed)
}
