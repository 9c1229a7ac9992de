//! SOCKS5 connection handler
//!
//! Drives one inbound connection through [`Socks5State`]: method
//! negotiation, optional username/password login, request parsing and then
//! either a TCP relay or a held UDP association.

use super::auth::{negotiate_method, read_credentials, send_auth_status};
use super::command::{parse_command, send_reply, send_success};
use super::consts::{SOCKS5_AUTH_FAILURE, SOCKS5_AUTH_SUCCESS};
use super::tcp_relay::relay_tcp;
use super::types::{AuthMethod, SocksCommand, Socks5State};
use crate::auth::{Authenticator, LoginGuard, UserHandle};
use crate::config::SocksConfig;
use crate::error::{Socks5Error, Socks5ReplyCode};
use crate::route::{connect_upstream, FakeHostCache, ReconnectPolicy, Router};
use crate::session::SocksSession;
use crate::transport::TcpTransport;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

/// Everything a SOCKS5 connection needs, shared by all connections
#[derive(Debug, Clone)]
pub struct SocksContext {
    /// Server configuration
    pub config: Arc<SocksConfig>,
    /// Credential check and accounting; `None` rejects every login
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Upstream selection
    pub router: Arc<dyn Router>,
    /// Asked for a new upstream after a failed connect
    pub reconnect: Option<Arc<dyn ReconnectPolicy>>,
    /// Fake-host token lookup
    pub fake_hosts: Arc<FakeHostCache>,
    /// Outbound connector
    pub transport: TcpTransport,
    /// UDP relay address returned by UDP ASSOCIATE
    pub udp_bind: Option<SocketAddr>,
}

impl SocksContext {
    /// Context routing everything directly, without authentication
    pub fn new(config: SocksConfig, router: Arc<dyn Router>, fake_hosts: Arc<FakeHostCache>) -> Self {
        let transport = TcpTransport::with_defaults()
            .with_connect_timeout(crate::helper::duration_from_secs(config.connect_timeout));
        SocksContext {
            config: Arc::new(config),
            authenticator: None,
            router,
            reconnect: None,
            fake_hosts,
            transport,
            udp_bind: None,
        }
    }

    /// Use `authenticator` for logins
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Consult `policy` when an upstream connect fails
    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Connect outbound with `transport`
    pub fn with_transport(mut self, transport: TcpTransport) -> Self {
        self.transport = transport;
        self
    }
}

/// Outcome of the login phase
struct Login {
    user: UserHandle,
    guard: LoginGuard,
    allowed: bool,
}

/// Handle one SOCKS5 connection from `source`
///
/// `local` is the address the client connected to; it stands in for an
/// unspecified UDP bind address in the UDP ASSOCIATE reply.
pub async fn handle_socks5<S>(
    mut stream: S,
    source: SocketAddr,
    local: Option<SocketAddr>,
    ctx: &SocksContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut state = Socks5State::Init;

    let method = negotiate_method(&mut stream, ctx.config.auth_required)
        .await
        .with_context(|| "Method negotiation failed")?;
    state.transition(Socks5State::MethodNegotiated)?;
    debug!("SOCKS5 {} selected method {:?}", source, method);

    let login = match method {
        AuthMethod::Password => {
            state.transition(Socks5State::Authenticating)?;
            login(&mut stream, source, ctx).await?
        }
        AuthMethod::None => Login {
            user: UserHandle::anonymous(),
            guard: LoginGuard::untracked(),
            allowed: !ctx.config.auth_required,
        },
    };

    let (command, destination) = match parse_command(&mut stream, ctx.config.dns_resolve).await {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = send_reply(&mut stream, Socks5ReplyCode::for_error(&e), None).await;
            login.guard.finish(&Default::default()).await;
            return Err(e.context("Failed to parse SOCKS5 request"));
        }
    };
    state.transition(Socks5State::CommandReceived)?;

    let destination = ctx.fake_hosts.translate(&destination);
    let session = SocksSession::new(source, destination.clone());
    session.set_user(login.user.clone());

    let result = if !login.allowed {
        warn!(
            "SOCKS5 {} from {} (user {}) not allowed",
            command,
            source,
            login.user.username()
        );
        send_reply(&mut stream, Socks5ReplyCode::ConnectionNotAllowed, None).await?;
        Err(Socks5Error::NotAllowed.into())
    } else {
        info!("SOCKS5 {} {} -> {}", command, source, destination);
        match command {
            SocksCommand::Connect => {
                handle_connect(&mut stream, &session, &mut state, ctx).await
            }
            SocksCommand::UdpAssociate => {
                handle_udp_associate(&mut stream, local, &mut state, ctx).await
            }
            SocksCommand::Bind => {
                warn!("BIND command not supported");
                send_reply(&mut stream, Socks5ReplyCode::CommandNotSupported, None).await
            }
        }
    };

    let _ = state.transition(Socks5State::Closed);
    login.guard.finish(session.traffic()).await;
    session.release();
    result
}

async fn login<S>(stream: &mut S, source: SocketAddr, ctx: &SocksContext) -> Result<Login>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (username, password) = read_credentials(stream).await?;

    let Some(authenticator) = ctx.authenticator.as_ref() else {
        send_auth_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(Socks5Error::AuthFailed.into());
    };
    let Some(user) = authenticator.login(&username, &password).await else {
        warn!("SOCKS5 login of {} from {} failed", username, source);
        send_auth_status(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(Socks5Error::AuthFailed.into());
    };

    // Over the IP limit the status is still success; the request is refused
    let (guard, allowed) = match authenticator.on_connect(&user, source.ip()).await {
        Ok(guard) => (guard, true),
        Err(e) => {
            warn!("{}", e);
            (LoginGuard::untracked(), false)
        }
    };
    send_auth_status(stream, SOCKS5_AUTH_SUCCESS).await?;
    debug!("SOCKS5 user {} logged in from {}", user.username(), source);

    Ok(Login {
        user,
        guard,
        allowed,
    })
}

async fn handle_connect<S>(
    stream: &mut S,
    session: &SocksSession,
    state: &mut Socks5State,
    ctx: &SocksContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    state.transition(Socks5State::Connecting)?;

    let connected = async {
        let upstream = ctx
            .router
            .route(session.source(), session.first_destination())
            .await?;
        session.set_upstream(ctx.fake_hosts.obfuscate(upstream));
        connect_upstream(session, ctx.reconnect.as_deref(), &ctx.transport).await
    }
    .await;

    let outbound = match connected {
        Ok(outbound) => outbound,
        Err(e) => {
            send_reply(stream, Socks5ReplyCode::GeneralFailure, None).await?;
            return Err(e.context(format!("Failed to connect {}", session.first_destination())));
        }
    };

    send_success(stream, outbound.local_addr().ok()).await?;
    state.transition(Socks5State::Relaying)?;

    relay_tcp(stream, outbound, session.traffic()).await
}

async fn handle_udp_associate<S>(
    stream: &mut S,
    local: Option<SocketAddr>,
    state: &mut Socks5State,
    ctx: &SocksContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let bind = match ctx.udp_bind {
        Some(bind) if ctx.config.allow_udp => bind,
        _ => {
            warn!("UDP ASSOCIATE not allowed by configuration");
            return send_reply(stream, Socks5ReplyCode::CommandNotSupported, None).await;
        }
    };
    let bind = match local {
        Some(local) if bind.ip().is_unspecified() => SocketAddr::new(local.ip(), bind.port()),
        _ => bind,
    };

    state.transition(Socks5State::UdpAssociated)?;
    send_success(stream, Some(bind)).await?;

    // Hold the association until the client hangs up
    let mut buf = [0u8; 512];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    debug!("UDP association closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DbAuthenticator, MemoryUserStore, User};
    use crate::route::DirectRouter;
    use crate::socks::consts::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn source() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn context(config: SocksConfig) -> SocksContext {
        SocksContext::new(
            config,
            Arc::new(DirectRouter),
            Arc::new(FakeHostCache::new(Duration::from_secs(60))),
        )
    }

    async fn context_with_user(name: &str, password: &str, max_ip: i32) -> SocksContext {
        let auth = DbAuthenticator::new(Arc::new(MemoryUserStore::new()));
        auth.save(User::new(name, password, max_ip)).await.unwrap();
        context(SocksConfig {
            auth_required: true,
            ..Default::default()
        })
        .with_authenticator(Arc::new(auth))
    }

    fn connect_request(addr: SocketAddr) -> Vec<u8> {
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, SOCKS5_RESERVED];
        request.extend_from_slice(&crate::endpoint::UnresolvedEndpoint::from(addr).to_socks_bytes().unwrap());
        request
    }

    fn credentials(user: &str, pass: &str) -> Vec<u8> {
        let mut request = vec![SOCKS5_AUTH_VERSION, user.len() as u8];
        request.extend_from_slice(user.as_bytes());
        request.push(pass.len() as u8);
        request.extend_from_slice(pass.as_bytes());
        request
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
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

    #[tokio::test]
    async fn test_connect_relays_bytes() {
        let echo = echo_server().await;
        let (mut client, server) = duplex(4096);
        let ctx = context(SocksConfig::default());
        let handle = tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE]);

        client.write_all(&connect_request(echo)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_replies_general_failure() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (mut client, server) = duplex(4096);
        let ctx = context(SocksConfig::default());
        let handle = tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&connect_request(closed)).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::GeneralFailure));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (mut client, server) = duplex(4096);
        let ctx = context(SocksConfig::default());
        let handle = tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[SOCKS5_VERSION, SOCKS5_CMD_TCP_BIND, 0, SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::CommandNotSupported));
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_udp_associate_disabled() {
        let (mut client, server) = duplex(4096);
        let mut ctx = context(SocksConfig::default());
        ctx.udp_bind = Some("127.0.0.1:1080".parse().unwrap());
        tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[SOCKS5_VERSION, SOCKS5_CMD_UDP_ASSOCIATE, 0, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::CommandNotSupported));
    }

    #[tokio::test]
    async fn test_udp_associate_returns_bind() {
        let (mut client, server) = duplex(4096);
        let mut ctx = context(SocksConfig {
            allow_udp: true,
            ..Default::default()
        });
        ctx.udp_bind = Some("0.0.0.0:1080".parse().unwrap());
        let local = Some("10.1.2.3:1080".parse().unwrap());
        let handle = tokio::spawn(async move { handle_socks5(server, source(), local, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[SOCKS5_VERSION, SOCKS5_CMD_UDP_ASSOCIATE, 0, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);
        assert_eq!(&reply[4..8], &[10, 1, 2, 3]);
        assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), 1080);

        // Held until the client hangs up
        assert!(!handle.is_finished());
        drop(client);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_password_login_rejected() {
        let ctx = context_with_user("alice", "secret", -1).await;
        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method[1], SOCKS5_AUTH_METHOD_PASSWORD);

        client.write_all(&credentials("alice", "wrong")).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE]);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_anonymous_refused_when_auth_required() {
        let ctx = context_with_user("alice", "secret", -1).await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method[1], SOCKS5_AUTH_METHOD_NONE);

        client
            .write_all(&connect_request("127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::ConnectionNotAllowed));
    }

    #[tokio::test]
    async fn test_ip_limit_refuses_after_auth_success() {
        let ctx = context_with_user("bob", "pw", 0).await;
        let (mut client, server) = duplex(4096);
        tokio::spawn(async move { handle_socks5(server, source(), None, &ctx).await });

        client.write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_PASSWORD]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client.write_all(&credentials("bob", "pw")).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS]);

        client
            .write_all(&connect_request("127.0.0.1:9".parse().unwrap()))
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::ConnectionNotAllowed));
    }
}
