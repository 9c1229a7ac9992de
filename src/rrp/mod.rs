//! Reverse port forwarding (Rrp)
//!
//! A client behind NAT keeps one control connection to a public server and
//! registers the ports it wants exposed. The server listens on those ports
//! and multiplexes every accepted connection over the control connection as
//! `FORWARD` frames; the client replays them against a local service or an
//! embedded SOCKS5 server.

mod client;
pub mod protocol;
mod server;

pub use client::{ClientState, RrpClient};
pub use protocol::RrpFrame;
pub use server::{RegisteredPorts, RrpServer};

use protocol::MAX_FORWARD_PAYLOAD;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Frames queued towards the control connection
pub(crate) const FRAME_QUEUE: usize = 256;

/// Payloads queued towards one forwarded connection
pub(crate) const CONN_QUEUE: usize = 64;

struct ForwardedConn {
    inbound: mpsc::Sender<Bytes>,
    task: Option<AbortHandle>,
}

/// Forwarded connections of one control connection, by remote port and id
#[derive(Clone, Default)]
pub(crate) struct ForwardedConns {
    inner: Arc<Mutex<HashMap<(u16, String), ForwardedConn>>>,
}

impl ForwardedConns {
    fn lock(&self) -> MutexGuard<'_, HashMap<(u16, String), ForwardedConn>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a new connection fed through `inbound`
    pub(crate) fn insert(&self, remote_port: u16, id: &str, inbound: mpsc::Sender<Bytes>) {
        self.lock()
            .insert((remote_port, id.to_string()), ForwardedConn { inbound, task: None });
    }

    /// Attach the task pumping a tracked connection
    ///
    /// A task that already finished and removed its entry is left alone.
    pub(crate) fn attach(&self, remote_port: u16, id: &str, task: &JoinHandle<()>) {
        if let Some(conn) = self.lock().get_mut(&(remote_port, id.to_string())) {
            conn.task = Some(task.abort_handle());
        }
    }

    pub(crate) fn remove(&self, remote_port: u16, id: &str) {
        self.lock().remove(&(remote_port, id.to_string()));
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Abort every tracked connection, closing its socket
    pub(crate) fn close_all(&self) {
        for (_, conn) in self.lock().drain() {
            if let Some(task) = conn.task {
                task.abort();
            }
        }
    }

    /// Deliver a `FORWARD` payload to a known connection
    ///
    /// Returns `false` when the connection is unknown or already gone.
    pub(crate) async fn deliver(&self, remote_port: u16, id: &str, payload: Bytes) -> bool {
        let sender = self
            .lock()
            .get(&(remote_port, id.to_string()))
            .map(|conn| conn.inbound.clone());
        match sender {
            Some(sender) => {
                if sender.send(payload).await.is_err() {
                    self.remove(remote_port, id);
                    return false;
                }
                true
            }
            None => false,
        }
    }
}

/// Pump one TCP connection over the control connection
///
/// Reads become `FORWARD` frames of at most [`MAX_FORWARD_PAYLOAD`] bytes
/// and EOF becomes a close frame. Payloads from `inbound` are written to the
/// stream; an empty payload or a closed channel shuts down its write half.
pub(crate) async fn forward_stream(
    stream: TcpStream,
    remote_port: u16,
    id: String,
    frames: mpsc::Sender<RrpFrame>,
    mut inbound: mpsc::Receiver<Bytes>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let outbound = async {
        let mut buf = vec![0u8; MAX_FORWARD_PAYLOAD];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let frame = RrpFrame::Forward {
                remote_port,
                id: id.clone(),
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if frames.send(frame).await.is_err() {
                return;
            }
        }
        let _ = frames.send(RrpFrame::close(remote_port, &id)).await;
    };

    let inbound = async {
        while let Some(payload) = inbound.recv().await {
            if payload.is_empty() {
                break;
            }
            if write_half.write_all(&payload).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(outbound, inbound);
    debug!("Forwarded connection {}:{} finished", remote_port, id);
}
