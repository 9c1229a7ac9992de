//! Outbound connections and socket tuning
//!
//! Upstream connects, the Rrp control connection and the Rrp client's local
//! connections all dial through [`TcpTransport`], which applies the connect
//! timeout and [`SocketOpts`]. Accepted sockets get the same options from
//! the listeners.

mod addr;
mod tcp;

pub use addr::AddrMaybeCached;
pub use tcp::TcpTransport;

use crate::config::TcpConfig;
use anyhow::Result;
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// TCP keepalive probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Time between probes
    pub interval: Duration,
}

impl Keepalive {
    fn secs(idle: u64, interval: u64) -> Self {
        Keepalive {
            idle: Duration::from_secs(idle),
            interval: Duration::from_secs(interval),
        }
    }
}

/// Options applied to every relay and tunnel socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Keepalive probing, off when `None`
    pub keepalive: Option<Keepalive>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// The Rrp control connection idles between frames, so its keepalive
    /// runs slower than on relayed streams
    pub fn for_control_channel() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive: Some(Keepalive::secs(30, 10)),
        }
    }

    /// Accepted SOCKS5, Shadowsocks and forwarded connections
    pub fn for_relay() -> Self {
        SocketOpts::default()
    }

    /// Options from the `[tcp]` section
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive: Some(Keepalive::secs(
                config.keepalive_secs,
                config.keepalive_interval,
            )),
        }
    }

    /// Apply to a connected stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(keepalive) = self.keepalive {
            let params = TcpKeepalive::new()
                .with_time(keepalive.idle)
                .with_interval(keepalive.interval);
            SockRef::from(stream).set_tcp_keepalive(&params)?;
        }
        Ok(())
    }
}

/// Dialer used for outbound connections
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Connected stream type
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug + 'static;

    /// Build from the `[tcp]` section
    fn new(config: &TcpConfig) -> Result<Self>
    where
        Self: Sized;

    /// Re-tune an established connection
    fn hint(conn: &Self::Stream, opts: SocketOpts);

    /// Dial `addr`, resolving it through its cache
    async fn connect(&self, addr: &AddrMaybeCached) -> Result<Self::Stream>;
}
