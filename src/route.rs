//! Upstream routing
//!
//! A [`Router`] decides how each CONNECT leaves the relay: straight to the
//! destination or through another SOCKS5 proxy. When the outbound connect
//! fails a [`ReconnectPolicy`] may hand out a different upstream, bounded by
//! [`MAX_RECONNECT_ATTEMPTS`].
//!
//! Obfuscated "fake host" destinations are mapped back to the real endpoint
//! through [`FakeHostCache`] before routing.

use crate::config::SocksConfig;
use crate::endpoint::UnresolvedEndpoint;
use crate::error::RelayError;
use crate::session::SocksSession;
use crate::transport::TcpTransport;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Upper bound on outbound connect attempts for one CONNECT request
pub const MAX_RECONNECT_ATTEMPTS: u32 = 16;

/// Suffix that marks a destination host as a fake-host token
pub const FAKE_HOST_SUFFIX: &str = ".fakehost";

/// Credentials for an upstream SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

/// An upstream SOCKS5 proxy server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServer {
    /// Proxy address
    pub server: UnresolvedEndpoint,
    /// Optional credentials
    pub auth: Option<Socks5Auth>,
}

impl ProxyServer {
    /// Parse `socks5://[user:pass@]host:port`
    pub fn parse(input: &str) -> Result<Self> {
        let url = url::Url::parse(input).with_context(|| format!("Invalid upstream URL: {}", input))?;
        if url.scheme() != "socks5" {
            bail!("Unsupported upstream scheme: {}", url.scheme());
        }
        let host = url
            .host_str()
            .with_context(|| format!("Missing host in upstream URL: {}", input))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(1080);
        let auth = if url.username().is_empty() {
            None
        } else {
            Some(Socks5Auth {
                username: url.username().to_string(),
                password: url.password().unwrap_or_default().to_string(),
            })
        };
        Ok(ProxyServer {
            server: UnresolvedEndpoint::new(host, port),
            auth,
        })
    }

    /// Upstream that reaches `destination` through this proxy
    pub fn via(&self, destination: UnresolvedEndpoint) -> Upstream {
        Upstream::Socks5 {
            server: self.server.clone(),
            auth: self.auth.clone(),
            destination,
        }
    }
}

/// How an outbound connection is made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Connect straight to the destination
    Direct(UnresolvedEndpoint),
    /// Connect through another SOCKS5 proxy
    Socks5 {
        /// Proxy address
        server: UnresolvedEndpoint,
        /// Proxy credentials
        auth: Option<Socks5Auth>,
        /// Final destination requested from the proxy
        destination: UnresolvedEndpoint,
    },
}

impl Upstream {
    /// Final destination of this upstream
    pub fn destination(&self) -> &UnresolvedEndpoint {
        match self {
            Upstream::Direct(destination) => destination,
            Upstream::Socks5 { destination, .. } => destination,
        }
    }

    /// Open the outbound connection
    pub async fn connect(&self, transport: &TcpTransport) -> Result<TcpStream> {
        match self {
            Upstream::Direct(destination) => {
                let addr = destination.resolve().await?;
                let stream = transport
                    .connect_addr(addr)
                    .await
                    .with_context(|| format!("Failed to connect to {}", destination))?;
                Ok(stream)
            }
            Upstream::Socks5 {
                server,
                auth,
                destination,
            } => {
                let addr = server.resolve().await?;
                let mut stream = transport
                    .connect_addr(addr)
                    .await
                    .with_context(|| format!("Failed to connect to upstream proxy {}", server))?;

                let target = match destination.ip() {
                    Some(ip) => async_socks5::AddrKind::Ip(SocketAddr::new(ip, destination.port())),
                    None => async_socks5::AddrKind::Domain(
                        destination.host().to_string(),
                        destination.port(),
                    ),
                };
                let auth = auth
                    .as_ref()
                    .map(|a| async_socks5::Auth::new(a.username.clone(), a.password.clone()));

                tokio::time::timeout(
                    transport.connect_timeout(),
                    async_socks5::connect(&mut stream, target, auth),
                )
                .await
                .map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("Upstream handshake timeout via {}", server),
                    )
                })?
                .with_context(|| format!("Upstream {} refused {}", server, destination))?;

                debug!("Connected to {} via upstream {}", destination, server);
                Ok(stream)
            }
        }
    }
}

/// Picks an upstream for every CONNECT
#[async_trait]
pub trait Router: Send + Sync + Debug {
    /// Choose the upstream for traffic from `source` to `destination`
    async fn route(&self, source: SocketAddr, destination: &UnresolvedEndpoint) -> Result<Upstream>;
}

/// Connects straight to every destination
#[derive(Debug, Default, Clone)]
pub struct DirectRouter;

#[async_trait]
impl Router for DirectRouter {
    async fn route(&self, _source: SocketAddr, destination: &UnresolvedEndpoint) -> Result<Upstream> {
        Ok(Upstream::Direct(destination.clone()))
    }
}

/// Sends every destination through one upstream proxy
#[derive(Debug, Clone)]
pub struct ProxyRouter {
    proxy: ProxyServer,
}

impl ProxyRouter {
    /// Route everything through `proxy`
    pub fn new(proxy: ProxyServer) -> Self {
        ProxyRouter { proxy }
    }
}

#[async_trait]
impl Router for ProxyRouter {
    async fn route(&self, _source: SocketAddr, destination: &UnresolvedEndpoint) -> Result<Upstream> {
        Ok(self.proxy.via(destination.clone()))
    }
}

/// Build the router described by the SOCKS5 config
pub fn router_from_config(config: &SocksConfig) -> Result<Arc<dyn Router>> {
    match &config.upstream {
        Some(url) => Ok(Arc::new(ProxyRouter::new(ProxyServer::parse(url)?))),
        None => Ok(Arc::new(DirectRouter)),
    }
}

/// Asked for a new upstream after a failed connect
pub trait ReconnectPolicy: Send + Sync + Debug {
    /// Return the next upstream to try, or `None` to give up
    fn on_reconnecting(&self, session: &SocksSession) -> Option<Upstream>;
}

/// Walks a fixed list of fallback proxies, one per failure
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    proxies: Vec<ProxyServer>,
}

impl FallbackPolicy {
    /// Create a policy over `proxies`
    pub fn new(proxies: Vec<ProxyServer>) -> Self {
        FallbackPolicy { proxies }
    }

    /// Build from the configured fallback URLs; `None` when the list is empty
    pub fn from_config(config: &SocksConfig) -> Result<Option<Self>> {
        if config.fallback_upstreams.is_empty() {
            return Ok(None);
        }
        let proxies = config
            .fallback_upstreams
            .iter()
            .map(|url| ProxyServer::parse(url))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(FallbackPolicy::new(proxies)))
    }
}

impl ReconnectPolicy for FallbackPolicy {
    fn on_reconnecting(&self, session: &SocksSession) -> Option<Upstream> {
        let index = session.upstream_failures().checked_sub(1)? as usize;
        let proxy = self.proxies.get(index)?;
        let destination = session
            .upstream()
            .map(|u| u.destination().clone())
            .unwrap_or_else(|| session.first_destination().clone());
        Some(proxy.via(destination))
    }
}

/// Connect the session's current upstream, consulting `policy` on failure
///
/// One attempt is made per upstream value. A retry happens only when the
/// policy installs a different upstream, and never beyond
/// [`MAX_RECONNECT_ATTEMPTS`] attempts in total.
pub async fn connect_upstream(
    session: &SocksSession,
    policy: Option<&dyn ReconnectPolicy>,
    transport: &TcpTransport,
) -> Result<TcpStream> {
    let mut attempts = 0u32;
    loop {
        let upstream = session
            .upstream()
            .with_context(|| format!("No upstream selected for {}", session.source()))?;
        attempts += 1;

        let err = match upstream.connect(transport).await {
            Ok(stream) => return Ok(stream),
            Err(e) => e,
        };
        let failures = session.record_upstream_failure();
        warn!(
            "Connect via {:?} failed (attempt {}, failures {}): {:#}",
            upstream, attempts, failures, err
        );

        let Some(policy) = policy else {
            return Err(err);
        };
        if attempts >= MAX_RECONNECT_ATTEMPTS {
            return Err(err.context(RelayError::Upstream(format!(
                "gave up after {} attempts",
                attempts
            ))));
        }
        match policy.on_reconnecting(session) {
            Some(next) => {
                session.set_upstream(next);
                if !session.take_upstream_changed() {
                    return Err(err);
                }
            }
            None => return Err(err),
        }
    }
}

/// Short-lived map from obfuscated host tokens back to real endpoints
#[derive(Debug)]
pub struct FakeHostCache {
    ttl: Duration,
    upstream_tokens: bool,
    entries: Mutex<HashMap<String, (UnresolvedEndpoint, Instant)>>,
}

impl FakeHostCache {
    /// Create a cache whose tokens live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        FakeHostCache {
            ttl,
            upstream_tokens: false,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Replace domain destinations sent to SOCKS5 upstreams with tokens
    pub fn with_upstream_tokens(mut self, enabled: bool) -> Self {
        self.upstream_tokens = enabled;
        self
    }

    /// Lifetime of registered tokens
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn token_for(endpoint: &UnresolvedEndpoint) -> String {
        let digest = Sha256::digest(format!("{}:{}", endpoint.host(), endpoint.port()).as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        format!("{}{}", u64::from_be_bytes(head), FAKE_HOST_SUFFIX)
    }

    /// Register `endpoint`, returning the fake endpoint that maps back to it
    pub fn register(&self, endpoint: &UnresolvedEndpoint) -> UnresolvedEndpoint {
        let token = Self::token_for(endpoint);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(token.clone(), (endpoint.clone(), Instant::now() + self.ttl));
        UnresolvedEndpoint::new(token, endpoint.port())
    }

    /// Rewrite a SOCKS5 upstream's domain destination to a registered token
    ///
    /// Only the upstream sees the token; it maps back through
    /// [`translate`](Self::translate) on a relay sharing this cache. Direct
    /// upstreams, IP destinations and existing tokens are left alone.
    pub fn obfuscate(&self, upstream: Upstream) -> Upstream {
        match upstream {
            Upstream::Socks5 {
                server,
                auth,
                destination,
            } if self.upstream_tokens
                && destination.ip().is_none()
                && !Self::is_fake(destination.host()) =>
            {
                let token = self.register(&destination);
                debug!("Sending {} to {} as {}", destination, server, token);
                Upstream::Socks5 {
                    server,
                    auth,
                    destination: token,
                }
            }
            other => other,
        }
    }

    /// Whether `host` carries the fake-host suffix
    pub fn is_fake(host: &str) -> bool {
        host.ends_with(FAKE_HOST_SUFFIX)
    }

    /// Look up a token host; expired tokens are not returned
    pub fn resolve(&self, host: &str) -> Option<UnresolvedEndpoint> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(host)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(endpoint, _)| endpoint.clone())
    }

    /// Map a requested destination to the real one
    ///
    /// Non-fake destinations and unknown tokens pass through unchanged.
    pub fn translate(&self, destination: &UnresolvedEndpoint) -> UnresolvedEndpoint {
        if !Self::is_fake(destination.host()) {
            return destination.clone();
        }
        match self.resolve(destination.host()) {
            Some(real) => {
                debug!("Fake host {} resolved to {}", destination, real);
                real
            }
            None => {
                warn!("Unresolved fake host {}, passing through", destination);
                destination.clone()
            }
        }
    }

    /// Drop expired tokens, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }

    /// Number of live and expired tokens held
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the cache holds no tokens
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
