//! SOCKS5 request parsing and reply building

use super::consts::*;
use super::types::SocksCommand;
use crate::endpoint::UnresolvedEndpoint;
use crate::error::{Socks5Error, Socks5ReplyCode};
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Parse a SOCKS5 request from the stream
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// With `resolve_dns` set, domain destinations are resolved here and the
/// returned endpoint carries the IP literal.
pub async fn parse_command<S>(
    stream: &mut S,
    resolve_dns: bool,
) -> Result<(SocksCommand, UnresolvedEndpoint)>
where
    S: AsyncRead + Unpin,
{
    // VER CMD RSV
    let mut header = [0u8; 3];
    stream
        .read_exact(&mut header)
        .await
        .with_context(|| "Failed to read command header")?;

    let version = header[0];
    let cmd_byte = header[1];

    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let command =
        SocksCommand::from_byte(cmd_byte).ok_or(Socks5Error::CommandNotSupported(cmd_byte))?;

    let destination = read_address(stream).await?;

    let destination = if resolve_dns && destination.ip().is_none() {
        UnresolvedEndpoint::from(destination.resolve().await?)
    } else {
        destination
    };

    tracing::debug!("Parsed SOCKS5 command: {} to {}", command, destination);

    Ok((command, destination))
}

/// Read `ATYP DST.ADDR DST.PORT` from the stream
pub async fn read_address<S>(stream: &mut S) -> Result<UnresolvedEndpoint>
where
    S: AsyncRead + Unpin,
{
    let addr_type = stream.read_u8().await?;
    let mut buf = vec![addr_type];

    match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => buf.resize(1 + 4 + 2, 0),
        SOCKS5_ADDR_TYPE_IPV6 => buf.resize(1 + 16 + 2, 0),
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await?;
            if len == 0 {
                return Err(Socks5Error::InvalidDomain("empty domain".to_string()).into());
            }
            buf.push(len);
            buf.resize(2 + len as usize + 2, 0);
        }
        other => return Err(Socks5Error::AddressTypeNotSupported(other).into()),
    }

    let filled = if addr_type == SOCKS5_ADDR_TYPE_DOMAIN { 2 } else { 1 };
    stream.read_exact(&mut buf[filled..]).await?;

    match UnresolvedEndpoint::decode_socks_addr(&buf)? {
        Some((endpoint, _)) => Ok(endpoint),
        None => Err(Socks5Error::InvalidAddress("truncated address".to_string()).into()),
    }
}

/// Encode a SOCKS5 reply
///
/// # SOCKS5 Reply Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// A missing bind address is written as `0.0.0.0:0`.
pub fn build_reply(reply_code: Socks5ReplyCode, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr =
        bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS5_VERSION, reply_code.into(), SOCKS5_RESERVED];

    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    reply
}

/// Send a SOCKS5 reply
pub async fn send_reply<S>(
    stream: &mut S,
    reply_code: Socks5ReplyCode,
    bind_addr: Option<SocketAddr>,
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&build_reply(reply_code, bind_addr)).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a success reply carrying `bind_addr`
pub async fn send_success<S>(stream: &mut S, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_reply(stream, Socks5ReplyCode::Succeeded, bind_addr).await
}
