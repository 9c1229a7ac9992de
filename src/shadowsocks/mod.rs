//! Shadowsocks AEAD server
//!
//! TCP connections are decrypted with the chunked AEAD stream codec and
//! routed like SOCKS5 CONNECT requests. UDP datagrams share the session
//! table used by the SOCKS5 UDP relay under their own region.

mod tcp;
mod udp;

pub use tcp::handle_shadowsocks;
pub use udp::{ShadowsocksResponder, ShadowsocksUdpRelay};

use crate::cipher::CipherConfig;
use crate::config::ShadowsocksConfig;
use crate::helper::duration_from_secs;
use crate::route::{FakeHostCache, ReconnectPolicy, Router};
use crate::session::DEFAULT_PENDING_LIMIT;
use crate::socks::udp::UdpSessionTable;
use crate::transport::{SocketOpts, TcpTransport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Shared state of all Shadowsocks connections
#[derive(Debug, Clone)]
pub struct ShadowsocksContext {
    /// Method and master key
    pub cipher: CipherConfig,
    /// Upstream selection
    pub router: Arc<dyn Router>,
    /// Asked for a new upstream after a failed connect
    pub reconnect: Option<Arc<dyn ReconnectPolicy>>,
    /// Fake-host token lookup
    pub fake_hosts: Arc<FakeHostCache>,
    /// Outbound connector
    pub transport: TcpTransport,
}

impl ShadowsocksContext {
    /// Create a context with the default transport
    pub fn new(cipher: CipherConfig, router: Arc<dyn Router>, fake_hosts: Arc<FakeHostCache>) -> Self {
        ShadowsocksContext {
            cipher,
            router,
            reconnect: None,
            fake_hosts,
            transport: TcpTransport::with_defaults(),
        }
    }

    /// Consult `policy` when an upstream connect fails
    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Connect outbound with `transport`
    pub fn with_transport(mut self, transport: TcpTransport) -> Self {
        self.transport = transport;
        self
    }
}

/// A bound Shadowsocks server
pub struct ShadowsocksServer {
    listener: TcpListener,
    udp: Option<(Arc<UdpSocket>, UdpSessionTable)>,
    ctx: Arc<ShadowsocksContext>,
}

impl ShadowsocksServer {
    /// Bind the listener described by `config`
    pub async fn bind(config: &ShadowsocksConfig, ctx: ShadowsocksContext) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("Failed to bind Shadowsocks listener on {}", config.listen))?;
        let local = listener.local_addr()?;

        let udp = if config.allow_udp {
            let socket = UdpSocket::bind(local)
                .await
                .with_context(|| format!("Failed to bind Shadowsocks UDP relay on {}", local))?;
            let table = UdpSessionTable::new(
                duration_from_secs(config.udp_idle_timeout),
                DEFAULT_PENDING_LIMIT,
            );
            Some((Arc::new(socket), table))
        } else {
            None
        };

        let transport = ctx
            .transport
            .clone()
            .with_connect_timeout(duration_from_secs(config.connect_timeout));
        let ctx = ctx.with_transport(transport);
        Ok(ShadowsocksServer {
            listener,
            udp,
            ctx: Arc::new(ctx),
        })
    }

    /// TCP address the server listens on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!(
            "Shadowsocks server ({}) listening on {}",
            self.ctx.cipher.kind(),
            self.listener.local_addr()?
        );

        if let Some((socket, table)) = self.udp {
            let relay = ShadowsocksUdpRelay::new(
                socket,
                table,
                self.ctx.cipher.clone(),
                self.ctx.router.clone(),
            );
            let udp_shutdown = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                if let Err(e) = relay.run(udp_shutdown).await {
                    error!("Shadowsocks UDP relay error: {:#}", e);
                }
            });
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, source) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Shadowsocks accept error: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = SocketOpts::for_relay().apply(&stream) {
                        debug!("Failed to apply socket options: {}", e);
                    }
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        handle_shadowsocks(stream, source, &ctx).await;
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Shadowsocks server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
