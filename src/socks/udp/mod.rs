//! UDP relay for SOCKS5 UDP ASSOCIATE and Shadowsocks

mod nat;
mod packet;
mod relay;

pub use nat::{bind_outbound, route_outbound, Region, SessionKey, UdpEntry, UdpResponder, UdpSessionTable};
pub use packet::{socks5_decode, socks5_encode, UdpPacket, UDP_HEADER_MIN_LEN};
pub use relay::{SocksResponder, SocksUdpRelay};
