//! UDP session table
//!
//! Every inbound UDP source gets one outbound socket, keyed by the listener
//! it arrived on and its source endpoint. The first datagram from a source
//! creates the entry in a pending state and configures it in the background;
//! datagrams arriving meanwhile wait in the session's bounded queue and are
//! flushed in order once the socket is ready.

use crate::endpoint::UnresolvedEndpoint;
use crate::helper::MAX_UDP_PACKET;
use crate::route::{Router, Upstream};
use crate::session::{PendingPacket, SocksSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which inbound listener a UDP source belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    /// SOCKS5 UDP relay
    Socks,
    /// Shadowsocks UDP relay
    Shadowsocks,
}

/// Key of one UDP session
pub type SessionKey = (Region, SocketAddr);

/// Sends outbound responses back to the inbound client
#[async_trait]
pub trait UdpResponder: Send + Sync {
    /// Deliver `payload` received from `from` to `client`
    async fn respond(&self, client: SocketAddr, from: SocketAddr, payload: &[u8]) -> Result<()>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One UDP session
pub struct UdpEntry {
    key: SessionKey,
    session: Arc<SocksSession>,
    socket: OnceLock<Arc<UdpSocket>>,
    last_active: Mutex<Instant>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpEntry {
    fn new(key: SessionKey, session: SocksSession) -> Self {
        UdpEntry {
            key,
            session: Arc::new(session),
            socket: OnceLock::new(),
            last_active: Mutex::new(Instant::now()),
            recv_task: Mutex::new(None),
        }
    }

    /// Table key of this entry
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Session context of this entry
    pub fn session(&self) -> &Arc<SocksSession> {
        &self.session
    }

    /// Whether the outbound socket is bound
    pub fn is_ready(&self) -> bool {
        self.socket.get().is_some()
    }

    /// Local address of the outbound socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.get().and_then(|s| s.local_addr().ok())
    }

    fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_active).elapsed()
    }

    fn shutdown(&self) {
        if let Some(task) = lock(&self.recv_task).take() {
            task.abort();
        }
        self.session.release();
    }
}

impl std::fmt::Debug for UdpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEntry")
            .field("key", &self.key)
            .field("ready", &self.is_ready())
            .field("pending", &self.session.pending_len())
            .finish()
    }
}

struct TableInner {
    entries: Mutex<HashMap<SessionKey, Arc<UdpEntry>>>,
    idle_timeout: Duration,
    pending_limit: usize,
}

/// Shared table of UDP sessions
#[derive(Clone)]
pub struct UdpSessionTable {
    inner: Arc<TableInner>,
}

impl UdpSessionTable {
    /// Create a table closing sessions idle for `idle_timeout`
    pub fn new(idle_timeout: Duration, pending_limit: usize) -> Self {
        UdpSessionTable {
            inner: Arc::new(TableInner {
                entries: Mutex::new(HashMap::new()),
                idle_timeout,
                pending_limit,
            }),
        }
    }

    /// Return the entry for `key`, creating it when absent
    ///
    /// Only the call that creates the entry runs `config_fn`; it must bind
    /// the outbound socket. Configuration runs on a spawned task, so the
    /// returned entry may still be pending.
    pub fn open<F, Fut>(
        &self,
        key: SessionKey,
        destination: &UnresolvedEndpoint,
        responder: Arc<dyn UdpResponder>,
        config_fn: F,
    ) -> Arc<UdpEntry>
    where
        F: FnOnce(Arc<SocksSession>) -> Fut,
        Fut: Future<Output = Result<UdpSocket>> + Send + 'static,
    {
        let (entry, created) = {
            let mut entries = lock(&self.inner.entries);
            match entries.get(&key) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let session = SocksSession::new(key.1, destination.clone())
                        .with_pending_queue(self.inner.pending_limit);
                    let entry = Arc::new(UdpEntry::new(key, session));
                    entries.insert(key, entry.clone());
                    (entry, true)
                }
            }
        };

        if created {
            debug!("New UDP session {:?} -> {}", key, destination);
            let configure = config_fn(entry.session.clone());
            let table = self.clone();
            let pending = entry.clone();
            tokio::spawn(async move { table.configure(pending, configure, responder).await });
        }
        entry
    }

    async fn configure<Fut>(&self, entry: Arc<UdpEntry>, configure: Fut, responder: Arc<dyn UdpResponder>)
    where
        Fut: Future<Output = Result<UdpSocket>>,
    {
        let socket = match configure.await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                warn!("Failed to configure UDP session {:?}: {:#}", entry.key, e);
                self.close_entry(&entry);
                return;
            }
        };
        let _ = entry.socket.set(socket.clone());

        let task = tokio::spawn(self.clone().recv_loop(entry.clone(), socket.clone(), responder));
        *lock(&entry.recv_task) = Some(task);
        if entry.session.is_released() {
            entry.shutdown();
            return;
        }

        while let Some(packet) = entry.session.next_pending() {
            if let Err(e) = send_direct(&entry, &socket, &packet.destination, &packet.payload).await {
                debug!("Dropping queued UDP packet to {}: {:#}", packet.destination, e);
            }
        }
    }

    async fn recv_loop(self, entry: Arc<UdpEntry>, socket: Arc<UdpSocket>, responder: Arc<dyn UdpResponder>) {
        let client = entry.key.1;
        let idle = self.inner.idle_timeout;
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            match tokio::time::timeout(idle, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    entry.touch();
                    entry.session.traffic().add_write(n as u64);
                    if let Err(e) = responder.respond(client, canonical_addr(from), &buf[..n]).await {
                        debug!("Failed to return UDP response to {}: {:#}", client, e);
                    }
                }
                Ok(Err(e)) => {
                    debug!("UDP session {:?} receive error: {}", entry.key, e);
                    break;
                }
                Err(_) => {
                    if entry.idle_for() >= idle {
                        debug!("UDP session {:?} idle, closing", entry.key);
                        break;
                    }
                }
            }
        }
        self.close_entry(&entry);
    }

    /// Send `payload` to `destination` on behalf of `entry`
    ///
    /// Queues the datagram while the entry is still being configured.
    pub async fn send(&self, entry: &UdpEntry, destination: UnresolvedEndpoint, payload: Bytes) -> Result<()> {
        entry.touch();
        if let Some(socket) = entry.socket.get() {
            if !entry.session.is_pending() {
                return send_direct(entry, socket, &destination, &payload).await;
            }
        }

        let packet = PendingPacket {
            destination,
            payload,
        };
        if let Some(packet) = entry.session.enqueue_pending(packet) {
            // The queue closed between the check and the enqueue
            match entry.socket.get() {
                Some(socket) => {
                    return send_direct(entry, socket, &packet.destination, &packet.payload).await
                }
                None => debug!("UDP session {:?} already closed", entry.key),
            }
        }
        Ok(())
    }

    /// Remove and release the session for `key`
    pub fn close(&self, key: &SessionKey) -> bool {
        let removed = lock(&self.inner.entries).remove(key);
        match removed {
            Some(entry) => {
                entry.shutdown();
                true
            }
            None => false,
        }
    }

    fn close_entry(&self, entry: &Arc<UdpEntry>) {
        {
            let mut entries = lock(&self.inner.entries);
            if entries.get(&entry.key).map_or(false, |e| Arc::ptr_eq(e, entry)) {
                entries.remove(&entry.key);
            }
        }
        entry.shutdown();
    }

    /// Look up an entry
    pub fn get(&self, key: &SessionKey) -> Option<Arc<UdpEntry>> {
        lock(&self.inner.entries).get(key).cloned()
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Whether no session is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session
    pub fn close_all(&self) {
        let entries: Vec<_> = lock(&self.inner.entries).drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.shutdown();
        }
    }
}

impl std::fmt::Debug for UdpSessionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSessionTable")
            .field("sessions", &self.len())
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

async fn send_direct(entry: &UdpEntry, socket: &UdpSocket, destination: &UnresolvedEndpoint, payload: &[u8]) -> Result<()> {
    let addr = outbound_addr(socket, destination.resolve().await?);
    socket
        .send_to(payload, addr)
        .await
        .with_context(|| format!("UDP send to {} failed", addr))?;
    entry.session.traffic().add_read(payload.len() as u64);
    Ok(())
}

/// Ask `router` for the session's upstream and bind its socket
///
/// UDP leaves this host directly. A SOCKS5 upstream is recorded on the
/// session but datagrams are not relayed through it.
pub async fn route_outbound(router: Arc<dyn Router>, session: Arc<SocksSession>) -> Result<UdpSocket> {
    let destination = session.first_destination().clone();
    let upstream = router.route(session.source(), &destination).await?;
    if let Upstream::Socks5 { server, .. } = &upstream {
        debug!(
            "UDP from {} to {} routed via {}, sending directly",
            session.source(),
            destination,
            server
        );
    }
    session.set_upstream(upstream);
    bind_outbound().await
}

/// Bind a dual-stack outbound socket
///
/// Falls back to IPv4 only where the host has no IPv6.
pub async fn bind_outbound() -> Result<UdpSocket> {
    match bind_dual_stack() {
        Ok(socket) => Ok(socket),
        Err(e) => {
            debug!("Dual-stack UDP bind failed, using IPv4: {}", e);
            UdpSocket::bind("0.0.0.0:0")
                .await
                .context("Failed to bind UDP socket on 0.0.0.0:0")
        }
    }
}

fn bind_dual_stack() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Address `socket` can send to: IPv4 targets are mapped on IPv6 sockets
fn outbound_addr(socket: &UdpSocket, addr: SocketAddr) -> SocketAddr {
    match (socket.local_addr(), addr) {
        (Ok(SocketAddr::V6(_)), SocketAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => addr,
    }
}

/// Undo IPv4 mapping on a received source address
fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}
