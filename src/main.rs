//! Sockrelay - SOCKS5 / Shadowsocks relay with reverse port forwarding
//!
//! This is the main entry point for the Sockrelay application.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use sockrelay::auth::{Authenticator, DbAuthenticator};
use sockrelay::cipher::CipherConfig;
use sockrelay::config::{load_config, Config};
use sockrelay::helper::duration_from_secs;
use sockrelay::route::{router_from_config, DirectRouter, FakeHostCache, FallbackPolicy};
use sockrelay::rrp::{RrpClient, RrpServer};
use sockrelay::shadowsocks::{ShadowsocksContext, ShadowsocksServer};
use sockrelay::socks::{SocksContext, SocksServer};
use sockrelay::transport::{TcpTransport, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Sockrelay - SOCKS5 / Shadowsocks relay with reverse port forwarding
#[derive(Parser, Debug)]
#[command(name = "sockrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = load_config(&args.config)?;

    info!("Sockrelay v{}", sockrelay::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx_clone.send(true);
    });

    run(config, shutdown_rx).await
}

/// Start every configured component and wait for all of them
async fn run(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    let fake_hosts = Arc::new(
        FakeHostCache::new(duration_from_secs(config.fake_host_ttl_secs))
            .with_upstream_tokens(config.fake_host_upstream),
    );
    let transport = TcpTransport::new(&config.tcp)?;
    let mut tasks: Vec<BoxFuture<'static, Result<()>>> = Vec::new();

    let authenticator = match &config.socks {
        Some(socks) if socks.auth_required => {
            Some(Arc::new(DbAuthenticator::from_config(&config.auth).await?))
        }
        _ => None,
    };

    if let Some(socks) = config.socks.clone() {
        let router = router_from_config(&socks)?;
        let fallback = FallbackPolicy::from_config(&socks)?;
        let transport = transport
            .clone()
            .with_connect_timeout(duration_from_secs(socks.connect_timeout));
        let mut ctx = SocksContext::new(socks, router, fake_hosts.clone()).with_transport(transport);
        if let Some(auth) = &authenticator {
            ctx = ctx.with_authenticator(auth.clone() as Arc<dyn Authenticator>);
        }
        if let Some(policy) = fallback {
            ctx = ctx.with_reconnect_policy(Arc::new(policy));
        }
        let server = SocksServer::bind(ctx).await?;
        tasks.push(server.run(shutdown_rx.resubscribe()).boxed());
    }

    if let Some(ss) = config.shadowsocks.clone() {
        let cipher = CipherConfig::new(&ss.method, &ss.password)
            .with_context(|| "Invalid Shadowsocks cipher")?;
        let router = match &config.socks {
            Some(socks) => router_from_config(socks)?,
            None => Arc::new(DirectRouter),
        };
        let ctx = ShadowsocksContext::new(cipher, router, fake_hosts.clone())
            .with_transport(transport.clone());
        let server = ShadowsocksServer::bind(&ss, ctx).await?;
        tasks.push(server.run(shutdown_rx.resubscribe()).boxed());
    }

    if let Some(rrp) = config.rrp_server.clone() {
        let server = RrpServer::bind(rrp).await?;
        tasks.push(server.run(shutdown_rx.resubscribe()).boxed());
    }

    if let Some(rrp) = config.rrp_client.clone() {
        let client = RrpClient::with_transport(rrp, transport.clone());
        client.connect()?;
        let mut shutdown = shutdown_rx.resubscribe();
        tasks.push(
            async move {
                let _ = shutdown.recv().await;
                client.close();
                Ok(())
            }
            .boxed(),
        );
    }

    if let Some(auth) = authenticator {
        tasks.push(run_maintenance(auth, config.clone(), shutdown_rx.resubscribe()).boxed());
    }
    tasks.push(sweep_fake_hosts(fake_hosts, shutdown_rx.resubscribe()).boxed());

    try_join_all(tasks).await?;
    info!("Sockrelay stopped");
    Ok(())
}

/// Sweep login IPs and reset counters on the configured schedule
async fn run_maintenance(
    auth: Arc<DbAuthenticator>,
    config: Config,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Result<()> {
    let mut interval =
        tokio::time::interval(duration_from_secs(config.auth.maintenance_interval_secs.max(1)));
    let retention = duration_from_secs(config.auth.ip_retention_secs);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = auth
                    .run_maintenance(Utc::now(), retention, config.auth.reset_day_of_month)
                    .await
                {
                    error!("Maintenance failed: {:#}", e);
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// Expire fake-host tokens once per TTL
async fn sweep_fake_hosts(
    fake_hosts: Arc<FakeHostCache>,
    mut shutdown_rx: broadcast::Receiver<bool>,
) -> Result<()> {
    let mut interval = tokio::time::interval(fake_hosts.ttl().max(std::time::Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = fake_hosts.sweep();
                if removed > 0 {
                    info!("Expired {} fake-host tokens", removed);
                }
            }
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
