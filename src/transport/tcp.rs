use super::{AddrMaybeCached, SocketOpts, Transport};
use crate::config::TcpConfig;
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpTransport {
    socket_opts: SocketOpts,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Default socket options and connect timeout
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Replace the socket options applied after connecting
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Replace the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect timeout in effect
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dial a resolved address
    ///
    /// An expired timeout is reported as `io::ErrorKind::TimedOut`, which the
    /// SOCKS5 handler turns into a failure reply.
    pub async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, self.connect_timeout),
                ))
            }
        };
        Self::hint(&stream, self.socket_opts.clone());
        tracing::debug!(%addr, "Connected");
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Stream = TcpStream;

    fn new(config: &TcpConfig) -> Result<Self> {
        Ok(Self::with_defaults().with_socket_opts(SocketOpts::from_tcp_config(config)))
    }

    fn hint(conn: &TcpStream, opts: SocketOpts) {
        if let Err(e) = opts.apply(conn) {
            tracing::warn!("Failed to tune socket: {}", e);
        }
    }

    async fn connect(&self, addr: &AddrMaybeCached) -> Result<TcpStream> {
        let target = addr.resolve().await?;
        self.connect_addr(target)
            .await
            .with_context(|| format!("Failed to connect to {}", addr.addr()))
    }
}
