//! Shadowsocks TCP relay
//!
//! The first decrypted bytes of a connection carry the destination in SOCKS5
//! address form; everything after it is payload. The address may span
//! several chunks.

use super::ShadowsocksContext;
use crate::cipher::{AeadReader, AeadWriter};
use crate::endpoint::UnresolvedEndpoint;
use crate::error::CipherError;
use crate::helper::DEFAULT_BUFFER_SIZE;
use crate::route::connect_upstream;
use crate::session::{SocksSession, TrafficCounter};
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Longest address header accepted before giving up
const MAX_HEADER_LEN: usize = 1 + 1 + 255 + 2;

/// Handle one Shadowsocks connection
///
/// Cipher failures are logged at warn and end the connection quietly, they
/// usually mean a wrong password or a scanner.
pub async fn handle_shadowsocks<S>(stream: S, source: SocketAddr, ctx: &ShadowsocksContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = serve(stream, source, ctx).await {
        if CipherError::is_cipher_error(&e) {
            warn!("Shadowsocks {} closed on cipher error: {:#}", source, e);
        } else {
            debug!("Shadowsocks {} ended: {:#}", source, e);
        }
    }
}

async fn serve<S>(stream: S, source: SocketAddr, ctx: &ShadowsocksContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = AeadReader::new(read_half, ctx.cipher.clone());

    let (destination, initial) = read_header(&mut reader).await?;
    let destination = ctx.fake_hosts.translate(&destination);
    info!("Shadowsocks {} -> {}", source, destination);

    let session = SocksSession::new(source, destination.clone());
    let upstream = ctx.router.route(source, &destination).await?;
    session.set_upstream(ctx.fake_hosts.obfuscate(upstream));
    let outbound = connect_upstream(&session, ctx.reconnect.as_deref(), &ctx.transport)
        .await
        .with_context(|| format!("Failed to connect {}", destination))?;

    let (mut upstream_read, mut upstream_write) = outbound.into_split();
    if !initial.is_empty() {
        upstream_write.write_all(&initial).await?;
        session.traffic().add_read(initial.len() as u64);
    }

    let writer = AeadWriter::new(write_half, &ctx.cipher)?;
    let traffic = session.traffic();
    let result = tokio::try_join!(
        decrypt_to(&mut reader, &mut upstream_write, traffic),
        encrypt_to(&mut upstream_read, writer, traffic),
    );
    session.release();
    result.map(|_| ())
}

/// Read chunks until the address header is complete
async fn read_header<R>(reader: &mut AeadReader<R>) -> Result<(UnresolvedEndpoint, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        match reader.read_chunk().await? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => bail!("Connection closed before the address header"),
        }
        if let Some((destination, consumed)) = UnresolvedEndpoint::decode_socks_addr(&buf)
            .map_err(|e| CipherError::Malformed(format!("{:#}", e)))?
        {
            return Ok((destination, buf.split_off(consumed)));
        }
        if buf.len() > MAX_HEADER_LEN {
            return Err(CipherError::Malformed("Address header too long".to_string()).into());
        }
    }
}

async fn decrypt_to<R, W>(reader: &mut AeadReader<R>, upstream: &mut W, traffic: &TrafficCounter) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = reader.read_chunk().await? {
        upstream.write_all(&chunk).await?;
        traffic.add_read(chunk.len() as u64);
    }
    let _ = upstream.shutdown().await;
    Ok(())
}

async fn encrypt_to<R, W>(upstream: &mut R, mut writer: AeadWriter<W>, traffic: &TrafficCounter) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    loop {
        let n = upstream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_chunk(&buf[..n]).await?;
        traffic.add_write(n as u64);
    }
    let _ = writer.shutdown().await;
    Ok(())
}
