//! Counted bidirectional TCP relay
//!
//! Bytes are copied verbatim in both directions. EOF on one side shuts down
//! the writer of the other side and lets the opposite direction drain. An
//! error on either direction ends the relay and drops both streams.

use crate::helper::DEFAULT_BUFFER_SIZE;
use crate::session::TrafficCounter;
use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay between the inbound `client` and the outbound `upstream`
///
/// Client-to-upstream bytes count as reads, upstream-to-client bytes as
/// writes on `traffic`.
pub async fn relay_tcp<A, B>(client: A, upstream: B, traffic: &TrafficCounter) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let outbound = pump(&mut client_read, &mut upstream_write, |n| traffic.add_read(n));
    let inbound = pump(&mut upstream_read, &mut client_write, |n| traffic.add_write(n));

    let (sent, received) = tokio::try_join!(outbound, inbound)?;
    debug!("Relay finished: {} bytes out, {} bytes in", sent, received);
    Ok(())
}

/// Copy until EOF, then shut down the writer
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, count: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = writer.flush().await;
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };
        writer.write_all(&buf[..n]).await?;
        count(n as u64);
        total += n as u64;
    }
    writer.flush().await?;
    // The peer may already be gone
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_tcp_bidirectional() {
        let (mut client_a, server_a) = duplex(1024);
        let (mut client_b, server_b) = duplex(1024);

        let traffic = std::sync::Arc::new(TrafficCounter::new());
        let counter = traffic.clone();
        let relay_handle =
            tokio::spawn(async move { relay_tcp(server_a, server_b, &counter).await });

        client_a.write_all(b"message A->B").await.unwrap();
        let mut buf_b = vec![0u8; 12];
        client_b.read_exact(&mut buf_b).await.unwrap();
        assert_eq!(&buf_b, b"message A->B");

        client_b.write_all(b"B->A").await.unwrap();
        let mut buf_a = vec![0u8; 4];
        client_a.read_exact(&mut buf_a).await.unwrap();
        assert_eq!(&buf_a, b"B->A");

        drop(client_a);
        drop(client_b);

        let result = tokio::time::timeout(Duration::from_secs(1), relay_handle).await;
        assert!(result.is_ok());
        assert_eq!(traffic.read_bytes(), 12);
        assert_eq!(traffic.write_bytes(), 4);
    }

    #[tokio::test]
    async fn test_relay_tcp_large_data() {
        let (mut client_a, server_a) = duplex(65536);
        let (mut client_b, server_b) = duplex(65536);

        let traffic = std::sync::Arc::new(TrafficCounter::new());
        let counter = traffic.clone();
        tokio::spawn(async move { relay_tcp(server_a, server_b, &counter).await });

        let large_data: Vec<u8> = (0..50000u32).map(|i| (i % 251) as u8).collect();
        let expected = large_data.clone();
        let writer = tokio::spawn(async move {
            client_a.write_all(&large_data).await.unwrap();
            client_a
        });

        let mut received = vec![0u8; 50000];
        client_b.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        let _client_a = writer.await.unwrap();
        assert_eq!(traffic.read_bytes(), 50000);
    }

    #[tokio::test]
    async fn test_relay_half_close_propagates() {
        let (mut client_a, server_a) = duplex(1024);
        let (mut client_b, server_b) = duplex(1024);

        let traffic = std::sync::Arc::new(TrafficCounter::new());
        let counter = traffic.clone();
        let relay_handle =
            tokio::spawn(async move { relay_tcp(server_a, server_b, &counter).await });

        client_a.write_all(b"request").await.unwrap();
        client_a.shutdown().await.unwrap();

        // B sees the data followed by EOF
        let mut received = Vec::new();
        client_b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // The other direction still flows
        client_b.write_all(b"response").await.unwrap();
        drop(client_b);
        let mut reply = Vec::new();
        client_a.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let result = tokio::time::timeout(Duration::from_secs(1), relay_handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_relay_tcp_empty_transfer() {
        let (client_a, server_a) = duplex(1024);
        let (client_b, server_b) = duplex(1024);

        let traffic = std::sync::Arc::new(TrafficCounter::new());
        let counter = traffic.clone();
        let relay_handle =
            tokio::spawn(async move { relay_tcp(server_a, server_b, &counter).await });

        drop(client_a);
        drop(client_b);

        let result = tokio::time::timeout(Duration::from_millis(500), relay_handle).await;
        assert!(result.is_ok());
        assert_eq!(traffic.read_bytes(), 0);
    }
}
