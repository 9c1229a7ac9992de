//! Chunked AEAD framing for TCP streams
//!
//! ```text
//! [salt][enc(len u16 BE) + tag][enc(payload) + tag][enc(len) + tag]...
//! ```
//!
//! Each direction carries its own salt and therefore its own subkey.

use super::{AeadCipher, CipherConfig};
use crate::error::CipherError;
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload carried by one chunk
pub const MAX_CHUNK_SIZE: usize = 0x3FFF;

/// Decrypting half of an AEAD stream
pub struct AeadReader<R> {
    inner: R,
    config: CipherConfig,
    cipher: Option<AeadCipher>,
}

impl<R: AsyncRead + Unpin> AeadReader<R> {
    /// Wrap `inner`; the salt is read with the first chunk
    pub fn new(inner: R, config: CipherConfig) -> Self {
        AeadReader {
            inner,
            config,
            cipher: None,
        }
    }

    /// Read the salt if it has not arrived yet
    ///
    /// Returns `false` on a clean EOF before any byte was received.
    async fn ensure_salt(&mut self) -> Result<bool> {
        if self.cipher.is_some() {
            return Ok(true);
        }
        let mut salt = vec![0u8; self.config.kind().salt_len()];
        match self.inner.read_exact(&mut salt).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => return Err(e).context("Failed to read salt"),
        }
        self.cipher = Some(self.config.session(&salt)?);
        Ok(true)
    }

    /// Read and decrypt one chunk
    ///
    /// Returns `None` on EOF at a chunk boundary. A tag mismatch surfaces as
    /// [`CipherError::Decrypt`] inside the error chain.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.ensure_salt().await? {
            return Ok(None);
        }
        let tag_len = self.config.kind().tag_len();

        let mut len_buf = vec![0u8; 2 + tag_len];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read chunk length"),
        }

        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| CipherError::Malformed("Missing session cipher".to_string()))?;
        let len_plain = cipher.open(&len_buf)?;
        let len = u16::from_be_bytes([len_plain[0], len_plain[1]]) as usize & MAX_CHUNK_SIZE;
        if len == 0 {
            return Err(CipherError::Malformed("Zero-length chunk".to_string()).into());
        }

        let mut payload = vec![0u8; len + tag_len];
        self.inner
            .read_exact(&mut payload)
            .await
            .context("Failed to read chunk payload")?;
        let data = cipher.open(&payload)?;
        Ok(Some(data))
    }

    /// Unwrap the inner reader
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Encrypting half of an AEAD stream
pub struct AeadWriter<W> {
    inner: W,
    cipher: AeadCipher,
    salt: Option<Vec<u8>>,
}

impl<W: AsyncWrite + Unpin> AeadWriter<W> {
    /// Wrap `inner` with a fresh random salt
    pub fn new(inner: W, config: &CipherConfig) -> Result<Self, CipherError> {
        let salt = config.random_salt();
        let cipher = config.session(&salt)?;
        Ok(AeadWriter {
            inner,
            cipher,
            salt: Some(salt),
        })
    }

    /// Encrypt and write `data`, splitting it into chunks as needed
    ///
    /// The salt goes out in front of the first chunk.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(data.len() + 64);
        if let Some(salt) = self.salt.take() {
            out.extend_from_slice(&salt);
        }
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            out.extend_from_slice(&self.cipher.seal(&(chunk.len() as u16).to_be_bytes())?);
            out.extend_from_slice(&self.cipher.seal(chunk)?);
        }
        self.inner
            .write_all(&out)
            .await
            .context("Failed to write encrypted chunk")?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the inner writer
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(salt) = self.salt.take() {
            self.inner.write_all(&salt).await?;
        }
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Unwrap the inner writer
    pub fn into_inner(self) -> W {
        self.inner
    }
}
