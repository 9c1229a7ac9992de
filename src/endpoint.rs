//! Unresolved endpoints
//!
//! Destinations arrive as host text plus port and are resolved only when a
//! connection is actually made. The SOCKS5 address type is derived from the
//! host text.

use crate::socks::consts::*;
use anyhow::{bail, Context, Result};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// A host and port that has not been resolved yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnresolvedEndpoint {
    host: String,
    port: u16,
}

impl UnresolvedEndpoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        UnresolvedEndpoint {
            host: host.into(),
            port,
        }
    }

    /// Host text (domain or IP literal)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host parsed as an IP literal, if it is one
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// SOCKS5 address type byte for this endpoint
    pub fn addr_type(&self) -> u8 {
        if self.host.parse::<Ipv4Addr>().is_ok() {
            SOCKS5_ADDR_TYPE_IPV4
        } else if self.host.parse::<Ipv6Addr>().is_ok() {
            SOCKS5_ADDR_TYPE_IPV6
        } else {
            SOCKS5_ADDR_TYPE_DOMAIN
        }
    }

    /// Resolve the endpoint to a socket address
    ///
    /// IP literals return immediately; domains go through DNS.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let resolved = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve domain: {}", self.host))?
            .next()
            .with_context(|| format!("No addresses found for domain: {}", self.host))?;
        Ok(resolved)
    }

    /// Write `ATYP ADDR PORT` in SOCKS5 wire form
    pub fn write_socks_addr<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self.ip() {
            Some(IpAddr::V4(v4)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                buf.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&v6.octets());
            }
            None => {
                if self.host.is_empty() || self.host.len() > MAX_DOMAIN_LEN {
                    bail!("Invalid domain length: {}", self.host.len());
                }
                buf.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
                buf.put_u8(self.host.len() as u8);
                buf.put_slice(self.host.as_bytes());
            }
        }
        buf.put_u16(self.port);
        Ok(())
    }

    /// Decode `ATYP ADDR PORT` from the start of `buf`
    ///
    /// Returns the endpoint and the number of bytes consumed, or `None` when
    /// `buf` ends before the address does.
    pub fn decode_socks_addr(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        let (host, addr_len) = match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 {
                    return Ok(None);
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                (Ipv4Addr::from(octets).to_string(), 4)
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                (Ipv6Addr::from(octets).to_string(), 16)
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    bail!("Invalid domain length: 0");
                }
                if buf.len() < 2 + len {
                    return Ok(None);
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .with_context(|| "Invalid UTF-8 in domain name")?;
                (domain.to_string(), 1 + len)
            }
            other => bail!("Unsupported address type: {}", other),
        };
        let port_at = 1 + addr_len;
        if buf.len() < port_at + 2 {
            return Ok(None);
        }
        let port = u16::from_be_bytes([buf[port_at], buf[port_at + 1]]);
        Ok(Some((UnresolvedEndpoint::new(host, port), port_at + 2)))
    }

    /// Serialize `ATYP ADDR PORT` to a new buffer
    pub fn to_socks_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(1 + 1 + self.host.len() + 2);
        self.write_socks_addr(&mut buf)?;
        Ok(buf)
    }
}

impl From<SocketAddr> for UnresolvedEndpoint {
    fn from(addr: SocketAddr) -> Self {
        UnresolvedEndpoint::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for UnresolvedEndpoint {
    type Err = anyhow::Error;

    /// Parse `host:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .with_context(|| format!("Missing port in endpoint: {}", s))?;
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid port in endpoint: {}", s))?;
        if host.is_empty() || host.contains(':') {
            bail!("Invalid host in endpoint: {}", s);
        }
        Ok(UnresolvedEndpoint::new(host, port))
    }
}

impl fmt::Display for UnresolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr_type() == SOCKS5_ADDR_TYPE_IPV6 {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_type_from_host_text() {
        assert_eq!(
            UnresolvedEndpoint::new("192.168.1.1", 80).addr_type(),
            SOCKS5_ADDR_TYPE_IPV4
        );
        assert_eq!(
            UnresolvedEndpoint::new("::1", 80).addr_type(),
            SOCKS5_ADDR_TYPE_IPV6
        );
        assert_eq!(
            UnresolvedEndpoint::new("example.com", 80).addr_type(),
            SOCKS5_ADDR_TYPE_DOMAIN
        );
        // Not dotted-quad, so it is a domain
        assert_eq!(
            UnresolvedEndpoint::new("1.2.3", 80).addr_type(),
            SOCKS5_ADDR_TYPE_DOMAIN
        );
    }

    #[test]
    fn test_parse_endpoint() {
        let ep: UnresolvedEndpoint = "example.com:443".parse().unwrap();
        assert_eq!(ep.host(), "example.com");
        assert_eq!(ep.port(), 443);

        let ep: UnresolvedEndpoint = "[::1]:8080".parse().unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.to_string(), "[::1]:8080");

        assert!("example.com".parse::<UnresolvedEndpoint>().is_err());
        assert!("example.com:http".parse::<UnresolvedEndpoint>().is_err());
        assert!(":80".parse::<UnresolvedEndpoint>().is_err());
    }

    #[test]
    fn test_to_socks_bytes_ipv4() {
        let bytes = UnresolvedEndpoint::new("10.0.0.1", 80).to_socks_bytes().unwrap();
        assert_eq!(bytes, vec![SOCKS5_ADDR_TYPE_IPV4, 10, 0, 0, 1, 0, 80]);
    }

    #[test]
    fn test_to_socks_bytes_domain() {
        let bytes = UnresolvedEndpoint::new("test.com", 443).to_socks_bytes().unwrap();
        assert_eq!(bytes[0], SOCKS5_ADDR_TYPE_DOMAIN);
        assert_eq!(bytes[1], 8);
        assert_eq!(&bytes[2..10], b"test.com");
        assert_eq!(&bytes[10..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_to_socks_bytes_rejects_long_domain() {
        let host = "a".repeat(256);
        assert!(UnresolvedEndpoint::new(host, 80).to_socks_bytes().is_err());
    }

    #[test]
    fn test_decode_socks_addr() {
        let ep = UnresolvedEndpoint::new("example.org", 8080);
        let mut bytes = ep.to_socks_bytes().unwrap();
        bytes.extend_from_slice(b"rest");
        let (decoded, used) = UnresolvedEndpoint::decode_socks_addr(&bytes).unwrap().unwrap();
        assert_eq!(decoded, ep);
        assert_eq!(&bytes[used..], b"rest");

        let v6 = UnresolvedEndpoint::new("2001:db8::1", 53);
        let bytes = v6.to_socks_bytes().unwrap();
        let (decoded, used) = UnresolvedEndpoint::decode_socks_addr(&bytes).unwrap().unwrap();
        assert_eq!(decoded, v6);
        assert_eq!(used, 1 + 16 + 2);
    }

    #[test]
    fn test_decode_socks_addr_incomplete() {
        let bytes = UnresolvedEndpoint::new("10.1.2.3", 443).to_socks_bytes().unwrap();
        for cut in 0..bytes.len() {
            assert!(UnresolvedEndpoint::decode_socks_addr(&bytes[..cut])
                .unwrap()
                .is_none());
        }
        assert!(UnresolvedEndpoint::decode_socks_addr(&[0x09, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = UnresolvedEndpoint::new("127.0.0.1", 9000).resolve().await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_invalid_domain() {
        let ep = UnresolvedEndpoint::new("this-domain-does-not-exist-12345.invalid", 80);
        assert!(ep.resolve().await.is_err());
    }
}
