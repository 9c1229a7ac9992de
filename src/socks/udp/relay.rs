//! SOCKS5 UDP relay loop
//!
//! Listens on the same port as the TCP server. Each datagram is checked for
//! its source address, decoded and handed to the session table, which owns
//! one outbound socket per client endpoint.

use super::nat::{route_outbound, Region, UdpResponder, UdpSessionTable};
use super::packet::{socks5_decode, socks5_encode};
use crate::config::SocksConfig;
use crate::endpoint::UnresolvedEndpoint;
use crate::helper::{is_private_or_loopback, MAX_UDP_PACKET};
use crate::route::Router;
use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Wraps responses in SOCKS5 UDP framing on the inbound socket
pub struct SocksResponder {
    socket: Arc<UdpSocket>,
}

impl SocksResponder {
    /// Respond through `socket`
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        SocksResponder { socket }
    }
}

#[async_trait]
impl UdpResponder for SocksResponder {
    async fn respond(&self, client: SocketAddr, from: SocketAddr, payload: &[u8]) -> Result<()> {
        let datagram = socks5_encode(payload, &UnresolvedEndpoint::from(from))?;
        self.socket.send_to(&datagram, client).await?;
        Ok(())
    }
}

/// SOCKS5 UDP relay bound to the server's UDP socket
pub struct SocksUdpRelay {
    socket: Arc<UdpSocket>,
    table: UdpSessionTable,
    config: Arc<SocksConfig>,
    router: Arc<dyn Router>,
}

impl SocksUdpRelay {
    /// Create a relay over an already bound socket
    pub fn new(
        socket: Arc<UdpSocket>,
        table: UdpSessionTable,
        config: Arc<SocksConfig>,
        router: Arc<dyn Router>,
    ) -> Self {
        SocksUdpRelay {
            socket,
            table,
            config,
            router,
        }
    }

    /// Whether datagrams from `source` are accepted
    pub fn is_allowed_source(&self, source: &SocketAddr) -> bool {
        let ip = source.ip();
        is_private_or_loopback(&ip) || self.config.is_whitelisted(&ip)
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!(
            "SOCKS5 UDP relay listening on {}",
            self.socket.local_addr()?
        );
        let responder: Arc<dyn UdpResponder> = Arc::new(SocksResponder::new(self.socket.clone()));
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, source) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            // ICMP errors surface here on some platforms
                            debug!("SOCKS5 UDP recv error: {}", e);
                            continue;
                        }
                    };
                    self.handle_datagram(source, &buf[..n], &responder).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("SOCKS5 UDP relay shutting down");
                    break;
                }
            }
        }

        self.table.close_all();
        Ok(())
    }

    async fn handle_datagram(&self, source: SocketAddr, datagram: &[u8], responder: &Arc<dyn UdpResponder>) {
        if !self.is_allowed_source(&source) {
            warn!("Dropping UDP datagram from disallowed source {}", source);
            return;
        }

        let packet = match socks5_decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping invalid SOCKS5 UDP datagram from {}: {:#}", source, e);
                return;
            }
        };

        let router = self.router.clone();
        let entry = self.table.open(
            (Region::Socks, source),
            &packet.addr,
            responder.clone(),
            move |session| route_outbound(router, session),
        );

        if let Err(e) = self.table.send(&entry, packet.addr, packet.data).await {
            debug!("SOCKS5 UDP forward from {} failed: {:#}", source, e);
        }
    }
}
