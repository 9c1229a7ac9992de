//! Shadowsocks server integration tests

mod common;

use common::*;
use sockrelay::cipher::{decrypt_packet, encrypt_packet, AeadReader, AeadWriter, CipherConfig};
use sockrelay::config::ShadowsocksConfig;
use sockrelay::endpoint::UnresolvedEndpoint;
use sockrelay::route::{DirectRouter, FakeHostCache};
use sockrelay::shadowsocks::{ShadowsocksContext, ShadowsocksServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;

const METHOD: &str = "chacha20-ietf-poly1305";
const PASSWORD: &str = "integration-password";

async fn spawn_server(fake_hosts: Arc<FakeHostCache>) -> (SocketAddr, broadcast::Sender<bool>) {
    let mut config = ShadowsocksConfig::new(METHOD, PASSWORD);
    config.listen = "127.0.0.1:0".to_string();
    config.allow_udp = true;
    let cipher = CipherConfig::new(METHOD, PASSWORD).unwrap();
    let ctx = ShadowsocksContext::new(cipher, Arc::new(DirectRouter), fake_hosts);
    let server = ShadowsocksServer::bind(&config, ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.run(shutdown_rx));
    (addr, shutdown_tx)
}

async fn tcp_round_trip(server: SocketAddr, destination: UnresolvedEndpoint, payload: &[u8]) -> Vec<u8> {
    let cipher = CipherConfig::new(METHOD, PASSWORD).unwrap();
    let stream = TcpStream::connect(server).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut writer = AeadWriter::new(write_half, &cipher).unwrap();
    let mut reader = AeadReader::new(read_half, cipher);

    let mut first = destination.to_socks_bytes().unwrap();
    first.extend_from_slice(payload);
    writer.write_chunk(&first).await.unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let chunk = tokio::time::timeout(Duration::from_secs(2), reader.read_chunk())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.extend(chunk);
    }
    received
}

#[tokio::test]
async fn test_tcp_relay() {
    let echo = spawn_tcp_echo().await;
    let (server, _shutdown) = spawn_server(Arc::new(FakeHostCache::new(Duration::from_secs(60)))).await;

    let received = tcp_round_trip(server, UnresolvedEndpoint::from(echo), b"shadowsocks tcp").await;
    assert_eq!(received, b"shadowsocks tcp");
}

#[tokio::test]
async fn test_tcp_relay_to_fake_host() {
    let echo = spawn_tcp_echo().await;
    let fake_hosts = Arc::new(FakeHostCache::new(Duration::from_secs(60)));
    let fake = fake_hosts.register(&UnresolvedEndpoint::from(echo));
    let (server, _shutdown) = spawn_server(fake_hosts).await;

    let received = tcp_round_trip(server, fake, b"hidden destination").await;
    assert_eq!(received, b"hidden destination");
}

#[tokio::test]
async fn test_udp_relay_survives_corrupted_datagram() {
    let echo = spawn_udp_echo().await;
    let (server, _shutdown) = spawn_server(Arc::new(FakeHostCache::new(Duration::from_secs(60)))).await;
    let cipher = CipherConfig::new(METHOD, PASSWORD).unwrap();
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let request = |payload: &[u8]| {
        let mut plain = UnresolvedEndpoint::from(echo).to_socks_bytes().unwrap();
        plain.extend_from_slice(payload);
        encrypt_packet(&cipher, &plain).unwrap()
    };

    let mut corrupted = request(b"broken");
    corrupted[20] ^= 0xFF;
    client.send_to(&corrupted, server).await.unwrap();
    client.send_to(&request(b"intact"), server).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let plain = decrypt_packet(&cipher, &buf[..n]).unwrap();
    let (from, consumed) = UnresolvedEndpoint::decode_socks_addr(&plain).unwrap().unwrap();
    assert_eq!(from, UnresolvedEndpoint::from(echo));
    assert_eq!(&plain[consumed..], b"intact");
}
