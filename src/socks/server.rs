//! SOCKS5 server
//!
//! Accepts TCP connections and spawns one handler task per connection. When
//! UDP is enabled a UDP relay runs on the same port.

use super::handler::{handle_socks5, SocksContext};
use super::udp::{SocksUdpRelay, UdpSessionTable};
use crate::helper::duration_from_secs;
use crate::transport::SocketOpts;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, Instrument};

/// A bound SOCKS5 server
pub struct SocksServer {
    listener: TcpListener,
    udp: Option<Arc<UdpSocket>>,
    ctx: Arc<SocksContext>,
}

impl SocksServer {
    /// Bind the TCP listener, and the UDP socket on the same port when UDP
    /// is allowed
    pub async fn bind(mut ctx: SocksContext) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.config.listen)
            .await
            .with_context(|| format!("Failed to bind SOCKS5 listener on {}", ctx.config.listen))?;
        let local = listener.local_addr()?;

        let udp = if ctx.config.allow_udp {
            let socket = UdpSocket::bind(local)
                .await
                .with_context(|| format!("Failed to bind SOCKS5 UDP relay on {}", local))?;
            ctx.udp_bind = Some(socket.local_addr()?);
            Some(Arc::new(socket))
        } else {
            None
        };

        Ok(SocksServer {
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
        info!("SOCKS5 server listening on {}", self.listener.local_addr()?);

        if let Some(socket) = self.udp.clone() {
            let table = UdpSessionTable::new(
                duration_from_secs(self.ctx.config.udp_idle_timeout),
                self.ctx.config.udp_pending_limit,
            );
            let relay = SocksUdpRelay::new(
                socket,
                table,
                self.ctx.config.clone(),
                self.ctx.router.clone(),
            );
            let udp_shutdown = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                if let Err(e) = relay.run(udp_shutdown).await {
                    error!("SOCKS5 UDP relay error: {:#}", e);
                }
            });
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, source) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("SOCKS5 accept error: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = SocketOpts::for_relay().apply(&stream) {
                        debug!("Failed to apply socket options: {}", e);
                    }
                    let local = stream.local_addr().ok();
                    let ctx = self.ctx.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_socks5(stream, source, local, &ctx).await {
                                debug!("SOCKS5 connection ended: {:#}", e);
                            }
                        }
                        .instrument(tracing::debug_span!("socks5", %source)),
                    );
                }
                _ = shutdown_rx.recv() => {
                    info!("SOCKS5 server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocksConfig;
    use crate::route::{DirectRouter, FakeHostCache};
    use std::time::Duration;

    fn context(config: SocksConfig) -> SocksContext {
        SocksContext::new(
            config,
            Arc::new(DirectRouter),
            Arc::new(FakeHostCache::new(Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn test_bind_udp_on_same_port() {
        let server = SocksServer::bind(context(SocksConfig {
            listen: "127.0.0.1:0".to_string(),
            allow_udp: true,
            ..Default::default()
        }))
        .await
        .unwrap();

        let tcp = server.local_addr().unwrap();
        assert_eq!(server.ctx.udp_bind, Some(tcp));
    }

    #[tokio::test]
    async fn test_no_udp_when_disabled() {
        let server = SocksServer::bind(context(SocksConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
        assert!(server.udp.is_none());
        assert!(server.ctx.udp_bind.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let server = SocksServer::bind(context(SocksConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        }))
        .await
        .unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
