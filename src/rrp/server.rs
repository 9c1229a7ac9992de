//! Rrp server
//!
//! Accepts control connections, verifies the token of each `REGISTER`,
//! listens on the requested ports and multiplexes accepted connections over
//! the control connection that registered them.

use super::protocol::RrpFrame;
use super::{forward_stream, ForwardedConns, CONN_QUEUE, FRAME_QUEUE};
use crate::config::{RrpProxy, RrpServerConfig};
use crate::error::RelayError;
use crate::transport::SocketOpts;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Proxy names and remote ports in use, across all control connections
#[derive(Debug, Default)]
struct Claims {
    names: HashSet<String>,
    ports: HashSet<u16>,
}

#[derive(Debug, Default)]
struct ServerState {
    claims: Mutex<Claims>,
    next_id: AtomicU64,
}

impl ServerState {
    /// Claim the name and port of `proxy`, both or neither
    fn claim(&self, proxy: &RrpProxy) -> Result<(), RelayError> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.names.contains(&proxy.name) {
            return Err(RelayError::Conflict(format!("proxy name {} in use", proxy.name)));
        }
        if claims.ports.contains(&proxy.remote_port) {
            return Err(RelayError::Conflict(format!(
                "remote port {} in use",
                proxy.remote_port
            )));
        }
        claims.names.insert(proxy.name.clone());
        claims.ports.insert(proxy.remote_port);
        Ok(())
    }

    fn release(&self, proxy: &RrpProxy) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.names.remove(&proxy.name);
        claims.ports.remove(&proxy.remote_port);
    }

    fn next_id(&self) -> String {
        format!("{:x}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A bound Rrp server
pub struct RrpServer {
    listener: TcpListener,
    config: RrpServerConfig,
    state: Arc<ServerState>,
}

impl RrpServer {
    /// Bind the control listener
    pub async fn bind(config: RrpServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("Failed to bind Rrp server on {}", config.bind))?;
        Ok(RrpServer {
            listener,
            config,
            state: Arc::new(ServerState::default()),
        })
    }

    /// Control listener address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Remote ports currently claimed by registered proxies
    pub fn registered_ports(&self) -> Vec<u16> {
        self.ports_handle().get()
    }

    /// Handle to the claimed ports that outlives `run`
    pub fn ports_handle(&self) -> RegisteredPorts {
        RegisteredPorts(self.state.clone())
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Rrp server listening on {}", self.listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Rrp accept error: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = SocketOpts::for_control_channel().apply(&stream) {
                        debug!("Failed to apply socket options: {}", e);
                    }
                    let control = ControlConnection::new(
                        peer,
                        self.config.token.clone(),
                        self.state.clone(),
                    );
                    let shutdown = shutdown_rx.resubscribe();
                    tokio::spawn(async move {
                        control.run(stream, shutdown).await;
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Rrp server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Cloneable view of the ports claimed on a running server
#[derive(Clone)]
pub struct RegisteredPorts(Arc<ServerState>);

impl RegisteredPorts {
    /// Remote ports currently claimed, sorted
    pub fn get(&self) -> Vec<u16> {
        let claims = self.0.claims.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = claims.ports.iter().copied().collect();
        ports.sort_unstable();
        ports
    }
}

/// A proxy accepted for one control connection
struct ActiveProxy {
    proxy: RrpProxy,
    accept_task: JoinHandle<()>,
}

/// State of one registered client
struct ControlConnection {
    peer: SocketAddr,
    token: String,
    state: Arc<ServerState>,
    registered: bool,
    conns: ForwardedConns,
    proxies: Vec<ActiveProxy>,
}

impl ControlConnection {
    fn new(peer: SocketAddr, token: String, state: Arc<ServerState>) -> Self {
        ControlConnection {
            peer,
            token,
            state,
            registered: false,
            conns: ForwardedConns::default(),
            proxies: Vec::new(),
        }
    }

    async fn run(mut self, stream: TcpStream, mut shutdown_rx: broadcast::Receiver<bool>) {
        info!("Rrp client connected from {}", self.peer);
        let (mut read_half, mut write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<RrpFrame>(FRAME_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = frame.write(&mut write_half).await {
                    debug!("Rrp control write failed: {:#}", e);
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                frame = RrpFrame::read(&mut read_half) => {
                    match frame {
                        Ok(Some(frame)) => {
                            if let Err(e) = self.handle_frame(frame, &frame_tx).await {
                                warn!("Rrp client {} rejected: {:#}", self.peer, e);
                                break;
                            }
                        }
                        Ok(None) => {
                            info!("Rrp client {} disconnected", self.peer);
                            break;
                        }
                        Err(e) => {
                            warn!("Rrp control connection from {} failed: {:#}", self.peer, e);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        drop(frame_tx);
        self.teardown();
        writer.abort();
    }

    async fn handle_frame(&mut self, frame: RrpFrame, frame_tx: &mpsc::Sender<RrpFrame>) -> Result<()> {
        match frame {
            RrpFrame::Register { token, proxies } => {
                if token != self.token {
                    return Err(RelayError::Auth("invalid Rrp token".to_string()).into());
                }
                self.registered = true;
                for proxy in proxies {
                    self.register(proxy, frame_tx).await;
                }
            }
            RrpFrame::Forward {
                remote_port,
                id,
                payload,
            } => {
                if !self.registered {
                    return Err(RelayError::Protocol("FORWARD before REGISTER".to_string()).into());
                }
                if !self.conns.deliver(remote_port, &id, payload).await {
                    debug!("Dropping FORWARD for unknown connection {}:{}", remote_port, id);
                }
            }
        }
        Ok(())
    }

    /// Claim and bind one proxy; failures skip it and keep the rest
    async fn register(&mut self, proxy: RrpProxy, frame_tx: &mpsc::Sender<RrpFrame>) {
        if proxy.proxy_type != "tcp" {
            warn!("Skipping Rrp proxy {}: unsupported type {}", proxy.name, proxy.proxy_type);
            return;
        }
        if let Err(e) = self.state.claim(&proxy) {
            warn!("Skipping Rrp proxy {} from {}: {}", proxy.name, self.peer, e);
            return;
        }
        let listener = match TcpListener::bind(("0.0.0.0", proxy.remote_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Failed to listen on port {} for {}: {}", proxy.remote_port, proxy.name, e);
                self.state.release(&proxy);
                return;
            }
        };
        info!(
            "Rrp proxy {} registered on port {} for {}",
            proxy.name, proxy.remote_port, self.peer
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            proxy.remote_port,
            self.state.clone(),
            self.conns.clone(),
            frame_tx.clone(),
        ));
        self.proxies.push(ActiveProxy { proxy, accept_task });
    }

    /// Close listeners and forwarded connections, release claims
    fn teardown(&mut self) {
        for active in self.proxies.drain(..) {
            active.accept_task.abort();
            self.state.release(&active.proxy);
            debug!("Rrp proxy {} released", active.proxy.name);
        }
        debug!("Closing {} forwarded connections of {}", self.conns.len(), self.peer);
        self.conns.close_all();
    }
}

async fn accept_loop(
    listener: TcpListener,
    remote_port: u16,
    state: Arc<ServerState>,
    conns: ForwardedConns,
    frame_tx: mpsc::Sender<RrpFrame>,
) {
    loop {
        let (stream, source) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Rrp accept error on port {}: {}", remote_port, e);
                continue;
            }
        };
        if let Err(e) = SocketOpts::for_relay().apply(&stream) {
            debug!("Failed to apply socket options: {}", e);
        }

        let id = state.next_id();
        debug!("Rrp connection {} on port {} from {}", id, remote_port, source);
        let (tx, rx) = mpsc::channel(CONN_QUEUE);
        conns.insert(remote_port, &id, tx);

        let task = tokio::spawn({
            let conns = conns.clone();
            let frames = frame_tx.clone();
            let id = id.clone();
            async move {
                forward_stream(stream, remote_port, id.clone(), frames, rx).await;
                conns.remove(remote_port, &id);
            }
        });
        conns.attach(remote_port, &id, &task);
    }
}
