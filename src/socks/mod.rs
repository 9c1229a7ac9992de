//! SOCKS5 server implementation
//!
//! Implements RFC 1928 with RFC 1929 username/password authentication:
//! CONNECT through the configured router, UDP ASSOCIATE through the shared
//! UDP session table, and BIND rejected.

pub mod auth;
pub mod command;
pub mod consts;
mod handler;
mod server;
pub mod tcp_relay;
pub mod types;
pub mod udp;

pub use handler::{handle_socks5, SocksContext};
pub use server::SocksServer;
pub use types::{AuthMethod, SocksCommand, Socks5State};
