//! Shadowsocks UDP relay
//!
//! Each datagram is `[salt][enc([ATYP ADDR PORT][payload]) + tag]`. Datagrams
//! that fail to open are dropped; the source's session keeps running.

use crate::cipher::{decrypt_packet, encrypt_packet, CipherConfig};
use crate::endpoint::UnresolvedEndpoint;
use crate::helper::MAX_UDP_PACKET;
use crate::route::Router;
use crate::socks::udp::{route_outbound, Region, UdpResponder, UdpSessionTable};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Seals responses for the Shadowsocks client
pub struct ShadowsocksResponder {
    socket: Arc<UdpSocket>,
    cipher: CipherConfig,
}

#[async_trait]
impl UdpResponder for ShadowsocksResponder {
    async fn respond(&self, client: SocketAddr, from: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut plain = UnresolvedEndpoint::from(from).to_socks_bytes()?;
        plain.extend_from_slice(payload);
        let sealed = encrypt_packet(&self.cipher, &plain)?;
        self.socket.send_to(&sealed, client).await?;
        Ok(())
    }
}

/// Shadowsocks UDP relay bound to the server's UDP socket
pub struct ShadowsocksUdpRelay {
    socket: Arc<UdpSocket>,
    table: UdpSessionTable,
    cipher: CipherConfig,
    router: Arc<dyn Router>,
}

impl ShadowsocksUdpRelay {
    /// Create a relay over an already bound socket
    pub fn new(
        socket: Arc<UdpSocket>,
        table: UdpSessionTable,
        cipher: CipherConfig,
        router: Arc<dyn Router>,
    ) -> Self {
        ShadowsocksUdpRelay {
            socket,
            table,
            cipher,
            router,
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Shadowsocks UDP relay listening on {}", self.socket.local_addr()?);
        let responder: Arc<dyn UdpResponder> = Arc::new(ShadowsocksResponder {
            socket: self.socket.clone(),
            cipher: self.cipher.clone(),
        });
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, source) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            debug!("Shadowsocks UDP recv error: {}", e);
                            continue;
                        }
                    };
                    self.handle_datagram(source, &buf[..n], &responder).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shadowsocks UDP relay shutting down");
                    break;
                }
            }
        }

        self.table.close_all();
        Ok(())
    }

    async fn handle_datagram(&self, source: SocketAddr, datagram: &[u8], responder: &Arc<dyn UdpResponder>) {
        let plain = match decrypt_packet(&self.cipher, datagram) {
            Ok(plain) => plain,
            Err(e) => {
                warn!("Dropping Shadowsocks datagram from {}: {}", source, e);
                return;
            }
        };
        let (destination, consumed) = match UnresolvedEndpoint::decode_socks_addr(&plain) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                debug!("Truncated address in Shadowsocks datagram from {}", source);
                return;
            }
            Err(e) => {
                debug!("Invalid address in Shadowsocks datagram from {}: {:#}", source, e);
                return;
            }
        };

        let router = self.router.clone();
        let entry = self.table.open(
            (Region::Shadowsocks, source),
            &destination,
            responder.clone(),
            move |session| route_outbound(router, session),
        );

        let payload = Bytes::copy_from_slice(&plain[consumed..]);
        if let Err(e) = self.table.send(&entry, destination, payload).await {
            debug!("Shadowsocks UDP forward from {} failed: {:#}", source, e);
        }
    }
}
