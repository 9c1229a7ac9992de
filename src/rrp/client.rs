//! Rrp client
//!
//! Keeps one control connection to the Rrp server, registers the configured
//! proxies on every connect and replays forwarded connections against local
//! services. Proxies without a local address are served by an embedded
//! SOCKS5 server bound on loopback.

use super::protocol::RrpFrame;
use super::{forward_stream, ForwardedConns, CONN_QUEUE, FRAME_QUEUE};
use crate::config::{RrpClientConfig, SocksConfig};
use crate::endpoint::UnresolvedEndpoint;
use crate::error::RelayError;
use crate::helper::Backoff;
use crate::route::{DirectRouter, FakeHostCache};
use crate::socks::{SocksContext, SocksServer};
use crate::transport::{AddrMaybeCached, SocketOpts, TcpTransport, Transport};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Poll step of [`RrpClient::send`] while waiting for a connection
const SEND_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Fake-host lifetime of embedded SOCKS5 servers
const EMBEDDED_FAKE_HOST_TTL: Duration = Duration::from_secs(600);

/// Connection state of an [`RrpClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and no attempt scheduled
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Control connection is live
    Connected,
    /// Waiting before the next attempt
    ReconnectBackoff,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tasks owned by one live control connection
struct Session {
    writer: JoinHandle<()>,
    conns: ForwardedConns,
}

impl Session {
    fn close(self) {
        self.writer.abort();
        self.conns.close_all();
    }
}

struct Inner {
    config: RrpClientConfig,
    transport: TcpTransport,
    server: AddrMaybeCached,
    state: Mutex<ClientState>,
    reconnect: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<RrpFrame>>>,
    targets: Mutex<Option<HashMap<u16, UnresolvedEndpoint>>>,
    session: Mutex<Option<Session>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<bool>,
}

/// Reverse tunnel client
#[derive(Clone)]
pub struct RrpClient {
    inner: Arc<Inner>,
}

impl RrpClient {
    /// Create a disconnected client
    pub fn new(config: RrpClientConfig) -> Self {
        Self::with_transport(config, TcpTransport::with_defaults())
    }

    /// Create a disconnected client that dials through `transport`
    pub fn with_transport(config: RrpClientConfig, transport: TcpTransport) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        RrpClient {
            inner: Arc::new(Inner {
                server: AddrMaybeCached::new(&config.server_addr),
                reconnect: AtomicBool::new(config.enable_reconnect),
                config,
                transport,
                state: Mutex::new(ClientState::Disconnected),
                sender: Mutex::new(None),
                targets: Mutex::new(None),
                session: Mutex::new(None),
                driver: Mutex::new(None),
                shutdown_tx,
            }),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ClientState {
        self.inner.state()
    }

    /// Start connecting in the background
    ///
    /// Only one connect loop runs at a time.
    pub fn connect(&self) -> Result<(), RelayError> {
        let mut driver = lock(&self.inner.driver);
        match self.inner.state() {
            ClientState::Connected => return Err(RelayError::AlreadyConnected),
            ClientState::Connecting | ClientState::ReconnectBackoff => {
                if driver.as_ref().map_or(false, |d| !d.is_finished()) {
                    return Err(RelayError::Connecting);
                }
            }
            ClientState::Disconnected => {}
        }

        self.inner
            .reconnect
            .store(self.inner.config.enable_reconnect, Ordering::SeqCst);
        self.inner.set_state(ClientState::Connecting);
        *driver = Some(tokio::spawn(drive(self.inner.clone())));
        Ok(())
    }

    /// Queue a frame on the control connection
    ///
    /// While reconnecting this waits up to `wait_connect_millis` for a live
    /// connection.
    pub async fn send(&self, frame: RrpFrame) -> Result<(), RelayError> {
        let wait = Duration::from_millis(self.inner.config.wait_connect_millis);
        let mut waited = Duration::ZERO;
        loop {
            if let Some(sender) = self.inner.sender() {
                return sender
                    .send(frame)
                    .await
                    .map_err(|_| RelayError::ClientDisconnected);
            }
            if !self.inner.reconnect.load(Ordering::SeqCst) || waited >= wait {
                return Err(RelayError::ClientDisconnected);
            }
            tokio::time::sleep(SEND_POLL_INTERVAL).await;
            waited += SEND_POLL_INTERVAL;
        }
    }

    /// Disconnect and stop reconnecting
    ///
    /// Drops the control connection and every forwarded connection, and
    /// stops embedded SOCKS5 servers. A later [`connect`](Self::connect)
    /// starts fresh ones.
    pub fn close(&self) {
        self.inner.reconnect.store(false, Ordering::SeqCst);
        if let Some(driver) = lock(&self.inner.driver).take() {
            driver.abort();
        }
        self.inner.end_session();
        let _ = self.inner.shutdown_tx.send(true);
        *lock(&self.inner.targets) = None;
        self.inner.set_state(ClientState::Disconnected);
        info!("Rrp client closed");
    }
}

impl Inner {
    fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ClientState) {
        *lock(&self.state) = state;
    }

    fn sender(&self) -> Option<mpsc::Sender<RrpFrame>> {
        lock(&self.sender).clone()
    }

    fn set_sender(&self, sender: Option<mpsc::Sender<RrpFrame>>) {
        *lock(&self.sender) = sender;
    }

    fn begin_session(&self, writer: JoinHandle<()>, conns: ForwardedConns) {
        if let Some(stale) = lock(&self.session).replace(Session { writer, conns }) {
            stale.close();
        }
    }

    /// Stop sending and drop the current control connection's tasks
    fn end_session(&self) {
        self.set_sender(None);
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
    }

    /// Local endpoint of every proxy
    ///
    /// Embedded SOCKS5 servers are started on first use and kept across
    /// reconnects until [`RrpClient::close`].
    async fn targets(&self) -> Result<HashMap<u16, UnresolvedEndpoint>> {
        let cached = lock(&self.targets).clone();
        if let Some(targets) = cached {
            return Ok(targets);
        }

        let mut resolved = HashMap::new();
        for proxy in &self.config.proxies {
            let endpoint = match &proxy.local_addr {
                Some(addr) => addr
                    .parse::<UnresolvedEndpoint>()
                    .with_context(|| format!("Invalid local address for proxy {}", proxy.name))?,
                None => self.start_embedded_socks(&proxy.name).await?,
            };
            resolved.insert(proxy.remote_port, endpoint);
        }
        *lock(&self.targets) = Some(resolved.clone());
        Ok(resolved)
    }

    async fn start_embedded_socks(&self, name: &str) -> Result<UnresolvedEndpoint> {
        let config = SocksConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let ctx = SocksContext::new(
            config,
            Arc::new(DirectRouter),
            Arc::new(FakeHostCache::new(EMBEDDED_FAKE_HOST_TTL)),
        )
        .with_transport(self.transport.clone());
        let server = SocksServer::bind(ctx).await?;
        let local = server.local_addr()?;
        info!("Embedded SOCKS5 server for proxy {} on {}", name, local);

        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_rx).await {
                warn!("Embedded SOCKS5 server stopped: {:#}", e);
            }
        });
        Ok(UnresolvedEndpoint::from(local))
    }

    /// Connect, register, and hand back the read half of the control
    /// connection
    async fn connect_once(&self) -> Result<(OwnedReadHalf, mpsc::Sender<RrpFrame>, JoinHandle<()>)> {
        let stream = self
            .transport
            .connect(&self.server)
            .await
            .with_context(|| format!("Failed to connect to Rrp server {}", self.server.addr()))?;
        TcpTransport::hint(&stream, SocketOpts::for_control_channel());

        let (read_half, mut write_half) = stream.into_split();
        let (frame_tx, mut frame_rx) = mpsc::channel::<RrpFrame>(FRAME_QUEUE);
        let writer = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if let Err(e) = frame.write(&mut write_half).await {
                    debug!("Rrp control write failed: {:#}", e);
                    break;
                }
            }
        });

        let register = RrpFrame::Register {
            token: self.config.token.clone(),
            proxies: self.config.proxies.clone(),
        };
        frame_tx
            .send(register)
            .await
            .map_err(|_| RelayError::ClientDisconnected)?;
        Ok((read_half, frame_tx, writer))
    }

    /// Dispatch frames until the control connection ends
    async fn serve(
        &self,
        mut read_half: OwnedReadHalf,
        frame_tx: mpsc::Sender<RrpFrame>,
        conns: ForwardedConns,
    ) -> Result<()> {
        let targets = self.targets().await?;

        loop {
            let frame = match RrpFrame::read(&mut read_half).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            match frame {
                RrpFrame::Register { .. } => {
                    break Err(RelayError::Protocol("unexpected REGISTER from server".to_string()).into());
                }
                RrpFrame::Forward {
                    remote_port,
                    id,
                    payload,
                } => {
                    if payload.is_empty() {
                        conns.deliver(remote_port, &id, payload).await;
                        continue;
                    }
                    if conns.deliver(remote_port, &id, payload.clone()).await {
                        continue;
                    }
                    match targets.get(&remote_port) {
                        Some(target) => self.open_local(
                            &conns,
                            target.clone(),
                            remote_port,
                            id,
                            payload,
                            frame_tx.clone(),
                        ),
                        None => debug!("FORWARD for unregistered port {}", remote_port),
                    }
                }
            }
        }
    }

    /// Start a local connection for a new forwarded id
    ///
    /// Payloads arriving before the connect finishes wait in the channel.
    fn open_local(
        &self,
        conns: &ForwardedConns,
        target: UnresolvedEndpoint,
        remote_port: u16,
        id: String,
        first: Bytes,
        frame_tx: mpsc::Sender<RrpFrame>,
    ) {
        let (tx, rx) = mpsc::channel(CONN_QUEUE);
        if tx.try_send(first).is_err() {
            return;
        }
        conns.insert(remote_port, &id, tx);

        let transport = self.transport.clone();
        let task = tokio::spawn({
            let conns = conns.clone();
            let id = id.clone();
            async move {
                replay_local(&transport, target, remote_port, &id, frame_tx, rx).await;
                conns.remove(remote_port, &id);
            }
        });
        conns.attach(remote_port, &id, &task);
    }
}

/// Connect to the local target and pump it, or report the failure as a close
async fn replay_local(
    transport: &TcpTransport,
    target: UnresolvedEndpoint,
    remote_port: u16,
    id: &str,
    frame_tx: mpsc::Sender<RrpFrame>,
    inbound: mpsc::Receiver<Bytes>,
) {
    let connected = match target.resolve().await {
        Ok(addr) => transport.connect_addr(addr).await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    match connected {
        Ok(stream) => {
            debug!("Forwarding {}:{} to {}", remote_port, id, target);
            forward_stream(stream, remote_port, id.to_string(), frame_tx, inbound).await;
        }
        Err(e) => {
            warn!("Failed to connect {} for {}:{}: {:#}", target, remote_port, id, e);
            let _ = frame_tx.send(RrpFrame::close(remote_port, id)).await;
        }
    }
}

/// Connect loop with exponential backoff
async fn drive(inner: Arc<Inner>) {
    let mut backoff = Backoff::default();
    loop {
        inner.set_state(ClientState::Connecting);
        match inner.connect_once().await {
            Ok((read_half, frame_tx, writer)) => {
                backoff.reset();
                let conns = ForwardedConns::default();
                inner.begin_session(writer, conns.clone());
                inner.set_sender(Some(frame_tx.clone()));
                inner.set_state(ClientState::Connected);
                info!("Rrp control connection established to {}", inner.server.addr());

                let result = inner.serve(read_half, frame_tx, conns).await;
                inner.end_session();
                match result {
                    Ok(()) => info!("Rrp server closed the control connection"),
                    Err(e) => warn!("Rrp control connection lost: {:#}", e),
                }
            }
            Err(e) => {
                warn!("{:#}", e);
                inner.server.clear_cache().await;
            }
        }

        if !inner.reconnect.load(Ordering::SeqCst) {
            inner.set_state(ClientState::Disconnected);
            return;
        }
        let delay = backoff.next_delay();
        inner.set_state(ClientState::ReconnectBackoff);
        debug!("Reconnecting to {} in {:?}", inner.server.addr(), delay);
        tokio::time::sleep(delay).await;
    }
}
