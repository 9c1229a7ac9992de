//! SOCKS5 UDP datagram framing

use crate::endpoint::UnresolvedEndpoint;
use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Length of `RSV RSV FRAG ATYP`
pub const UDP_HEADER_MIN_LEN: usize = 4;

/// A decoded SOCKS5 UDP datagram
///
/// # UDP Request/Response Format
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Destination on requests, origin on responses
    pub addr: UnresolvedEndpoint,
    /// Payload
    pub data: Bytes,
}

/// Frame `payload` for `addr`
pub fn socks5_encode(payload: &[u8], addr: &UnresolvedEndpoint) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(3 + 1 + 1 + addr.host().len() + 2 + payload.len());
    buf.put_u16(0);
    buf.put_u8(0);
    addr.write_socks_addr(&mut buf)?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse a datagram
///
/// Datagrams shorter than the fixed header, fragmented datagrams and
/// truncated addresses are rejected.
pub fn socks5_decode(datagram: &[u8]) -> Result<UdpPacket> {
    if datagram.len() < UDP_HEADER_MIN_LEN {
        bail!("UDP packet too short: {} bytes", datagram.len());
    }

    let frag = datagram[2];
    if frag != 0 {
        bail!("Fragmented UDP packet (frag {}) not supported", frag);
    }

    match UnresolvedEndpoint::decode_socks_addr(&datagram[3..])? {
        Some((addr, consumed)) => Ok(UdpPacket {
            addr,
            data: Bytes::copy_from_slice(&datagram[3 + consumed..]),
        }),
        None => bail!("Truncated address in UDP packet"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::consts::*;

    #[test]
    fn test_encode_ipv4() {
        let addr = UnresolvedEndpoint::new("10.0.0.1", 80);
        let encoded = socks5_encode(b"test", &addr).unwrap();

        // RSV (2) + FRAG (1) + ATYP (1) + IPv4 (4) + PORT (2) + DATA (4)
        assert_eq!(encoded.len(), 2 + 1 + 1 + 4 + 2 + 4);
        assert_eq!(&encoded[..4], &[0, 0, 0, SOCKS5_ADDR_TYPE_IPV4]);
        assert_eq!(&encoded[8..10], &80u16.to_be_bytes());
        assert_eq!(&encoded[10..], b"test");
    }

    #[test]
    fn test_decode_each_address_type() {
        for host in ["192.168.0.7", "2001:db8::1", "dns.example.org"] {
            let addr = UnresolvedEndpoint::new(host, 53);
            let encoded = socks5_encode(b"query", &addr).unwrap();
            let packet = socks5_decode(&encoded).unwrap();
            assert_eq!(packet.addr, addr);
            assert_eq!(&packet.data[..], b"query");
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        let addr = UnresolvedEndpoint::new("127.0.0.1", 9);
        let encoded = socks5_encode(b"", &addr).unwrap();
        assert!(socks5_decode(&encoded).unwrap().data.is_empty());
    }

    #[test]
    fn test_decode_rejects_short() {
        assert!(socks5_decode(&[0, 0, 0]).is_err());
        assert!(socks5_decode(&[]).is_err());
    }

    #[test]
    fn test_decode_rejects_fragment() {
        let addr = UnresolvedEndpoint::new("127.0.0.1", 9);
        let mut encoded = socks5_encode(b"x", &addr).unwrap().to_vec();
        encoded[2] = 1;
        assert!(socks5_decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_and_unknown() {
        assert!(socks5_decode(&[0, 0, 0, SOCKS5_ADDR_TYPE_IPV4, 127, 0]).is_err());
        assert!(socks5_decode(&[0, 0, 0, 0x09, 1, 2, 3, 4, 0, 80]).is_err());
    }
}
