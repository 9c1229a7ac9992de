//! Rrp wire format
//!
//! Every message on the control connection is length prefixed:
//!
//! ```text
//! +-----------+--------+-----------------------+
//! | LEN (u32) | ACTION |   action fields ...   |
//! +-----------+--------+-----------------------+
//! ```
//!
//! `REGISTER`: `[u32 token len][token][u32 proxies len][bincode Vec<RrpProxy>]`
//!
//! `FORWARD`: `[u32 remote port][u32 id len][id ascii][payload to frame end]`.
//! An empty payload signals that the forwarded connection closed.

use crate::config::RrpProxy;
use anyhow::{bail, Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Client registers its proxies
pub const ACTION_REGISTER: u8 = 1;
/// Data for one forwarded connection
pub const ACTION_FORWARD: u8 = 2;

/// Largest frame body accepted
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest payload put into one `FORWARD`
pub const MAX_FORWARD_PAYLOAD: usize = 64 * 1024;

/// One control-connection message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RrpFrame {
    /// Token and the proxies to expose
    Register {
        /// Shared secret
        token: String,
        /// Requested proxies
        proxies: Vec<RrpProxy>,
    },
    /// Payload for connection `id` on `remote_port`
    Forward {
        /// Server port the connection arrived on
        remote_port: u16,
        /// Server-assigned connection id
        id: String,
        /// Bytes to deliver; empty means close
        payload: Bytes,
    },
}

impl RrpFrame {
    /// Close notification for connection `id`
    pub fn close(remote_port: u16, id: &str) -> Self {
        RrpFrame::Forward {
            remote_port,
            id: id.to_string(),
            payload: Bytes::new(),
        }
    }

    /// Encode the frame body, without the length prefix
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        match self {
            RrpFrame::Register { token, proxies } => {
                let payload =
                    bincode::serialize(proxies).with_context(|| "Failed to serialize proxies")?;
                buf.put_u8(ACTION_REGISTER);
                buf.put_u32(token.len() as u32);
                buf.put_slice(token.as_bytes());
                buf.put_u32(payload.len() as u32);
                buf.put_slice(&payload);
            }
            RrpFrame::Forward {
                remote_port,
                id,
                payload,
            } => {
                if !id.is_ascii() {
                    bail!("Connection id is not ASCII: {}", id);
                }
                buf.reserve(1 + 4 + 4 + id.len() + payload.len());
                buf.put_u8(ACTION_FORWARD);
                buf.put_u32(*remote_port as u32);
                buf.put_u32(id.len() as u32);
                buf.put_slice(id.as_bytes());
                buf.put_slice(payload);
            }
        }
        Ok(buf)
    }

    /// Decode a frame body
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            bail!("Empty Rrp frame");
        }
        let action = body.get_u8();
        match action {
            ACTION_REGISTER => {
                let token = read_field(&mut body, "token")?;
                let token = String::from_utf8(token.to_vec())
                    .with_context(|| "Invalid UTF-8 in token")?;
                let payload = read_field(&mut body, "proxies")?;
                let proxies: Vec<RrpProxy> = bincode::deserialize(payload)
                    .with_context(|| "Failed to deserialize proxies")?;
                Ok(RrpFrame::Register { token, proxies })
            }
            ACTION_FORWARD => {
                if body.remaining() < 4 {
                    bail!("Truncated FORWARD port");
                }
                let port = body.get_u32();
                let remote_port =
                    u16::try_from(port).with_context(|| format!("Invalid remote port {}", port))?;
                let id = read_field(&mut body, "id")?;
                if !id.is_ascii() {
                    bail!("Connection id is not ASCII");
                }
                let id = String::from_utf8_lossy(id).into_owned();
                Ok(RrpFrame::Forward {
                    remote_port,
                    id,
                    payload: Bytes::copy_from_slice(body),
                })
            }
            other => bail!("Unknown Rrp action {}", other),
        }
    }

    /// Read one frame; `None` on EOF at a frame boundary
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Self>> {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read frame length"),
        };
        if len == 0 || len > MAX_FRAME_LEN {
            bail!("Invalid Rrp frame length {}", len);
        }
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .await
            .with_context(|| "Failed to read frame body")?;
        trace!("Read Rrp frame of {} bytes", len);
        Self::decode(&body).map(Some)
    }

    /// Write one frame with its length prefix
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let body = self.encode()?;
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        writer
            .write_all(&buf)
            .await
            .with_context(|| "Failed to write frame")?;
        writer.flush().await.with_context(|| "Failed to flush frame")?;
        Ok(())
    }
}

fn read_field<'a>(body: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if body.remaining() < 4 {
        bail!("Truncated {} length", what);
    }
    let len = body.get_u32() as usize;
    if body.len() < len {
        bail!("Truncated {}: need {} bytes, have {}", what, len, body.len());
    }
    let (field, rest) = body.split_at(len);
    *body = rest;
    Ok(field)
}
