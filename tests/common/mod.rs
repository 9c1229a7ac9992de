//! Test utilities for Sockrelay integration tests
//!
//! Listeners, echo servers, a configuration builder and SOCKS5 byte builders
//! shared across the integration tests.

#![allow(dead_code)]

use sockrelay::config::{AuthConfig, Config, SocksConfig, TcpConfig, UserConfig};
use sockrelay::route::{router_from_config, FakeHostCache};
use sockrelay::socks::{SocksContext, SocksServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

/// Create a pair of connected duplex streams for testing
pub fn create_mock_stream_pair() -> (DuplexStream, DuplexStream) {
    duplex(8192)
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// A loopback port with nothing listening on it
pub async fn free_port() -> u16 {
    let (_listener, addr) = create_test_listener().await;
    addr.port()
}

/// TCP server echoing every connection back
pub async fn spawn_tcp_echo() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// UDP server echoing every datagram back to its sender
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Start a SOCKS5 server for `config`, returning its address and the
/// shutdown sender that keeps it alive
pub async fn spawn_socks(ctx: SocksContext) -> (SocketAddr, broadcast::Sender<bool>) {
    let server = SocksServer::bind(ctx).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.run(shutdown_rx));
    (addr, shutdown_tx)
}

/// SOCKS5 context routing per `config`, without authentication
pub fn socks_context(config: SocksConfig) -> SocksContext {
    let router = router_from_config(&config).unwrap();
    SocksContext::new(
        config,
        router,
        Arc::new(FakeHostCache::new(Duration::from_secs(60))),
    )
}

/// Greet without authentication and CONNECT to `target`, returning the
/// reply bytes
pub async fn socks5_connect(server: SocketAddr, target: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(server).await.unwrap();
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        std::net::IpAddr::V6(_) => panic!("IPv4 targets only"),
    };
    stream
        .write_all(&socks5_mock::create_connect_ipv4(ip, target.port()))
        .await
        .unwrap();
    let mut reply = vec![0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply)
}

/// Test configuration builder
pub struct TestConfigBuilder {
    listen: String,
    auth_required: bool,
    allow_udp: bool,
    users: Vec<UserConfig>,
    upstream: Option<String>,
    fallback_upstreams: Vec<String>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            listen: "127.0.0.1:0".to_string(),
            auth_required: false,
            allow_udp: false,
            users: Vec::new(),
            upstream: None,
            fallback_upstreams: Vec::new(),
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address
    pub fn listen(mut self, addr: &str) -> Self {
        self.listen = addr.to_string();
        self
    }

    /// Set authentication required
    pub fn auth_required(mut self, required: bool) -> Self {
        self.auth_required = required;
        self
    }

    /// Allow UDP
    pub fn allow_udp(mut self, allow: bool) -> Self {
        self.allow_udp = allow;
        self
    }

    /// Add a user
    pub fn user(mut self, username: &str, password: &str, max_ip_count: i32) -> Self {
        self.users.push(UserConfig {
            username: username.to_string(),
            password: password.to_string(),
            max_ip_count,
        });
        self
    }

    /// Route through an upstream SOCKS5 proxy
    pub fn upstream(mut self, url: &str) -> Self {
        self.upstream = Some(url.to_string());
        self
    }

    /// Add a fallback upstream
    pub fn fallback(mut self, url: &str) -> Self {
        self.fallback_upstreams.push(url.to_string());
        self
    }

    /// The SOCKS5 section alone
    pub fn socks(&self) -> SocksConfig {
        SocksConfig {
            listen: self.listen.clone(),
            auth_required: self.auth_required,
            allow_udp: self.allow_udp,
            connect_timeout: 2,
            upstream: self.upstream.clone(),
            fallback_upstreams: self.fallback_upstreams.clone(),
            ..Default::default()
        }
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        Config {
            socks: Some(self.socks()),
            shadowsocks: None,
            auth: AuthConfig {
                users: self.users,
                ..Default::default()
            },
            rrp_server: None,
            rrp_client: None,
            tcp: TcpConfig::default(),
            fake_host_ttl_secs: 600,
            fake_host_upstream: false,
        }
    }
}

/// SOCKS5 request bytes
pub mod socks5_mock {
    use sockrelay::socks::consts::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a password auth method selection request
    pub fn create_auth_request_password() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]
    }

    /// Create an RFC 1929 username/password request
    pub fn create_credentials(username: &str, password: &str) -> Vec<u8> {
        let mut req = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
        req.extend_from_slice(username.as_bytes());
        req.push(password.len() as u8);
        req.extend_from_slice(password.as_bytes());
        req
    }

    /// Create a connect command to IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a UDP associate command with an unspecified client address
    pub fn create_udp_associate() -> Vec<u8> {
        vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_UDP_ASSOCIATE,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_mock_stream_pair() {
        let (mut a, mut b) = create_mock_stream_pair();
        a.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .listen("127.0.0.1:1081")
            .auth_required(true)
            .allow_udp(true)
            .user("alice", "pw", 2)
            .build();

        let socks = config.socks.unwrap();
        assert_eq!(socks.listen, "127.0.0.1:1081");
        assert!(socks.auth_required);
        assert!(socks.allow_udp);
        assert_eq!(config.auth.users.len(), 1);
        assert_eq!(config.auth.users[0].max_ip_count, 2);
    }

    #[test]
    fn test_socks5_mock_credentials() {
        let req = socks5_mock::create_credentials("bob", "secret");
        assert_eq!(req[0], 1);
        assert_eq!(req[1], 3);
        assert_eq!(&req[2..5], b"bob");
        assert_eq!(req[5], 6);
        assert_eq!(&req[6..], b"secret");
    }
}
