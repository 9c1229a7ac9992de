//! # Sockrelay - SOCKS5 / Shadowsocks relay with reverse port forwarding
//!
//! Sockrelay terminates SOCKS5 and Shadowsocks client connections, relays
//! their TCP streams and UDP datagrams to the requested destinations, and
//! accounts traffic per authenticated user. It also carries a small reverse
//! port-forwarding protocol (Rrp) so a host behind NAT can expose local
//! services through a public server.
//!
//! ## Features
//!
//! - **SOCKS5**: CONNECT and UDP ASSOCIATE, optional username/password login
//! - **Shadowsocks AEAD**: aes-128-gcm, aes-256-gcm and chacha20-ietf-poly1305
//! - **UDP NAT table**: one outbound socket per client source, idle expiry
//! - **Accounting**: per-user concurrent IP limit and monthly counter resets
//! - **Upstream routing**: direct or through a SOCKS5 proxy, with fallbacks
//! - **Rrp**: reverse tunnel server and client with reconnect backoff
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sockrelay::config::SocksConfig;
//! use sockrelay::route::{DirectRouter, FakeHostCache};
//! use sockrelay::socks::{SocksContext, SocksServer};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = SocksContext::new(
//!         SocksConfig::default(),
//!         Arc::new(DirectRouter),
//!         Arc::new(FakeHostCache::new(Duration::from_secs(600))),
//!     );
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!     SocksServer::bind(ctx).await?.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 / Shadowsocks client -> Sockrelay -> [upstream SOCKS5] -> Target
//!
//! Remote user -> Rrp server ==control connection==> Rrp client -> Local service
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod cipher;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod helper;
pub mod route;
pub mod rrp;
pub mod session;
pub mod shadowsocks;
pub mod socks;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{CipherError, RelayError, Socks5Error};

/// Version of the Sockrelay library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "sockrelay");
    }
}
