//! Configuration module for Sockrelay
//!
//! This module provides configuration types and parsing. Every section is
//! optional; `main` starts only the components that are configured.

mod auth;
mod rrp;
mod shadowsocks;
mod socks;
mod transport;

pub use auth::{AuthConfig, StoreBackend, UserConfig};
pub use rrp::{RrpClientConfig, RrpProxy, RrpServerConfig};
pub use shadowsocks::ShadowsocksConfig;
pub use socks::SocksConfig;
pub use transport::TcpConfig;

use crate::error::RelayError;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default lifetime of fake-host tokens in seconds
fn default_fake_host_ttl_secs() -> u64 {
    600
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// SOCKS5 server
    #[serde(default)]
    pub socks: Option<SocksConfig>,

    /// Shadowsocks server
    #[serde(default)]
    pub shadowsocks: Option<ShadowsocksConfig>,

    /// Authentication and accounting
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rrp server
    #[serde(default)]
    pub rrp_server: Option<RrpServerConfig>,

    /// Rrp client
    #[serde(default)]
    pub rrp_client: Option<RrpClientConfig>,

    /// Socket tuning
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Lifetime of fake-host tokens
    #[serde(default = "default_fake_host_ttl_secs")]
    pub fake_host_ttl_secs: u64,

    /// Hide domain destinations behind fake-host tokens when connecting
    /// through a SOCKS5 upstream that shares this process's token cache
    #[serde(default)]
    pub fake_host_upstream: bool,
}

impl Config {
    /// Validate every configured section
    pub fn validate(&self) -> Result<()> {
        if self.socks.is_none()
            && self.shadowsocks.is_none()
            && self.rrp_server.is_none()
            && self.rrp_client.is_none()
        {
            bail!("Nothing to run: configure socks, shadowsocks, rrp_server or rrp_client");
        }
        if let Some(socks) = &self.socks {
            socks.validate().map_err(RelayError::Config)?;
            if socks.auth_required && self.auth.users.is_empty() && self.auth.store_path.is_none() {
                bail!("SOCKS5 authentication required but no users configured");
            }
        }
        if let Some(ss) = &self.shadowsocks {
            ss.validate().map_err(RelayError::Config)?;
        }
        if let Some(client) = &self.rrp_client {
            client.validate().map_err(RelayError::Config)?;
        }
        self.tcp.validate().map_err(RelayError::Config)?;
        self.auth.validate().map_err(RelayError::Config)?;
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.validate().with_context(|| "Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
[socks]
listen = "127.0.0.1:1080"
"#;

        let config = parse_config(config_str).unwrap();
        let socks = config.socks.unwrap();
        assert_eq!(socks.listen, "127.0.0.1:1080");
        assert!(config.shadowsocks.is_none());
        assert_eq!(config.fake_host_ttl_secs, 600);
        assert!(!config.fake_host_upstream);
    }

    #[test]
    fn test_parse_empty_config_rejected() {
        assert!(parse_config("").is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
fake_host_ttl_secs = 60
fake_host_upstream = true

[socks]
listen = "0.0.0.0:1080"
auth_required = true
allow_udp = true
udp_whitelist = ["203.0.113.10"]
upstream = "socks5://u:p@10.0.0.1:1080"

[shadowsocks]
listen = "0.0.0.0:8388"
method = "chacha20-ietf-poly1305"
password = "secret"
allow_udp = true

[auth]
backend = "memory"
reset_day_of_month = 1

[[auth.users]]
username = "alice"
password = "wonderland"
max_ip_count = 2

[rrp_server]
bind = "0.0.0.0:7000"
token = "tk"

[rrp_client]
server_addr = "relay.example.com:7000"
token = "tk"
wait_connect_millis = 1000

[[rrp_client.proxies]]
name = "ssh"
type = "tcp"
remote_port = 2222
local_addr = "127.0.0.1:22"

[tcp]
nodelay = false
"#;

        let config = parse_config(config_str).unwrap();
        let socks = config.socks.as_ref().unwrap();
        assert!(socks.auth_required);
        assert_eq!(socks.udp_whitelist.len(), 1);
        assert_eq!(config.auth.users[0].max_ip_count, 2);
        let ss = config.shadowsocks.as_ref().unwrap();
        assert_eq!(ss.method, "chacha20-ietf-poly1305");
        let client = config.rrp_client.as_ref().unwrap();
        assert_eq!(client.proxies[0].remote_port, 2222);
        assert_eq!(client.wait_connect_millis, 1000);
        assert!(!config.tcp.nodelay);
        assert_eq!(config.fake_host_ttl_secs, 60);
        assert!(config.fake_host_upstream);
    }

    #[test]
    fn test_auth_required_without_users_rejected() {
        let config_str = r#"
[socks]
auth_required = true
"#;
        assert!(parse_config(config_str).is_err());
    }
}
