//! Per-connection session context
//!
//! A [`SocksSession`] is created for every accepted TCP connection and for
//! every UDP source endpoint. It owns everything the relay needs about that
//! flow: where it came from, where it is going, which upstream carries it,
//! the logged-in user and the traffic counters. Nothing is looked up through
//! ambient state.

use crate::auth::UserHandle;
use crate::endpoint::UnresolvedEndpoint;
use crate::route::Upstream;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// Callback run once when the session is released
pub type CloseCallback = Box<dyn FnOnce(&SocksSession) + Send>;

/// Byte counters shared by both relay directions
#[derive(Debug)]
pub struct TrafficCounter {
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    started: Instant,
}

impl TrafficCounter {
    /// Start counting now
    pub fn new() -> Self {
        TrafficCounter {
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Bytes read from the inbound client
    pub fn add_read(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Bytes written back to the inbound client
    pub fn add_write(&self, n: u64) {
        self.write_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Total bytes read from the inbound client
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// Total bytes written to the inbound client
    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    /// Time since the counter started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for TrafficCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A datagram waiting for its outbound socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    /// Where the datagram goes
    pub destination: UnresolvedEndpoint,
    /// Datagram payload
    pub payload: Bytes,
}

/// Session context for one relayed flow
pub struct SocksSession {
    source: SocketAddr,
    first_destination: UnresolvedEndpoint,
    upstream: Mutex<Option<Upstream>>,
    upstream_changed: AtomicBool,
    upstream_fail: AtomicU32,
    user: Mutex<Option<UserHandle>>,
    traffic: Arc<TrafficCounter>,
    pending: Mutex<Option<VecDeque<PendingPacket>>>,
    pending_limit: usize,
    on_close: Mutex<Option<CloseCallback>>,
    released: AtomicBool,
}

/// Default bound of the pending queue
pub const DEFAULT_PENDING_LIMIT: usize = 256;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Poisoning is ignored, the guarded values stay consistent
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SocksSession {
    /// Create a session for a flow from `source` to `first_destination`
    pub fn new(source: SocketAddr, first_destination: UnresolvedEndpoint) -> Self {
        SocksSession {
            source,
            first_destination,
            upstream: Mutex::new(None),
            upstream_changed: AtomicBool::new(false),
            upstream_fail: AtomicU32::new(0),
            user: Mutex::new(None),
            traffic: Arc::new(TrafficCounter::new()),
            pending: Mutex::new(None),
            pending_limit: DEFAULT_PENDING_LIMIT,
            on_close: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Start with an open pending queue bounded to `limit` packets
    pub fn with_pending_queue(mut self, limit: usize) -> Self {
        self.pending_limit = limit.max(1);
        *self.pending.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(VecDeque::new());
        self
    }

    /// Source endpoint of the inbound client
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// First destination requested on this session
    pub fn first_destination(&self) -> &UnresolvedEndpoint {
        &self.first_destination
    }

    /// Current upstream selection
    pub fn upstream(&self) -> Option<Upstream> {
        lock(&self.upstream).clone()
    }

    /// Replace the upstream; marks the session changed when it differs
    pub fn set_upstream(&self, upstream: Upstream) {
        let mut current = lock(&self.upstream);
        if current.as_ref().map_or(false, |u| *u != upstream) {
            self.upstream_changed.store(true, Ordering::SeqCst);
        }
        *current = Some(upstream);
    }

    /// Read and clear the upstream-changed flag
    pub fn take_upstream_changed(&self) -> bool {
        self.upstream_changed.swap(false, Ordering::SeqCst)
    }

    /// Record one failed upstream connect, returning the new count
    pub fn record_upstream_failure(&self) -> u32 {
        self.upstream_fail.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Failed upstream connects so far
    pub fn upstream_failures(&self) -> u32 {
        self.upstream_fail.load(Ordering::SeqCst)
    }

    /// Attach the logged-in user
    pub fn set_user(&self, user: UserHandle) {
        *lock(&self.user) = Some(user);
    }

    /// Logged-in user, if any
    pub fn user(&self) -> Option<UserHandle> {
        lock(&self.user).clone()
    }

    /// Traffic counters of this session
    pub fn traffic(&self) -> &Arc<TrafficCounter> {
        &self.traffic
    }

    /// Queue a packet while the outbound handle is pending
    ///
    /// Returns the packet back when the queue has already been flushed, in
    /// which case the caller writes it directly. When the queue is full the
    /// oldest packet is dropped.
    pub fn enqueue_pending(&self, packet: PendingPacket) -> Option<PendingPacket> {
        let mut pending = lock(&self.pending);
        match pending.as_mut() {
            Some(queue) => {
                if queue.len() >= self.pending_limit {
                    if let Some(dropped) = queue.pop_front() {
                        warn!(
                            "Pending queue of {} full, dropping {} bytes to {}",
                            self.source,
                            dropped.payload.len(),
                            dropped.destination
                        );
                    }
                }
                queue.push_back(packet);
                None
            }
            None => Some(packet),
        }
    }

    /// Pop the next queued packet, or close the queue once it is empty
    ///
    /// After this returns `None` every later [`enqueue_pending`] call hands
    /// its packet back, so writes bypass the queue in order.
    ///
    /// [`enqueue_pending`]: SocksSession::enqueue_pending
    pub fn next_pending(&self) -> Option<PendingPacket> {
        let mut pending = lock(&self.pending);
        let next = pending.as_mut().and_then(VecDeque::pop_front);
        if next.is_none() {
            *pending = None;
        }
        next
    }

    /// Number of packets waiting
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).as_ref().map_or(0, VecDeque::len)
    }

    /// Whether writes still go through the pending queue
    pub fn is_pending(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Register a callback run when the session is released
    pub fn on_close(&self, callback: CloseCallback) {
        *lock(&self.on_close) = Some(callback);
    }

    /// Release the session; only the first call has any effect
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.pending).take();
        let callback = lock(&self.on_close).take();
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    /// Whether [`release`](SocksSession::release) has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for SocksSession {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SocksSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocksSession")
            .field("source", &self.source)
            .field("first_destination", &self.first_destination)
            .field("upstream", &self.upstream())
            .field("upstream_fail", &self.upstream_failures())
            .field("released", &self.is_released())
            .finish()
    }
}
