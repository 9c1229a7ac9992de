//! Reverse port-forwarding (Rrp) configuration

use serde::{Deserialize, Serialize};

fn default_enable_reconnect() -> bool {
    true
}

fn default_wait_connect_millis() -> u64 {
    4000
}

fn default_proxy_type() -> String {
    "tcp".to_string()
}

/// One port exposed through the tunnel
///
/// This is also the record serialized into `REGISTER` frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RrpProxy {
    /// Globally unique proxy name
    pub name: String,
    /// Proxy type, only "tcp" is forwarded
    #[serde(rename = "type", default = "default_proxy_type")]
    pub proxy_type: String,
    /// Port bound on the server
    pub remote_port: u16,
    /// Local service to forward to; an embedded SOCKS5 server when absent
    #[serde(default)]
    pub local_addr: Option<String>,
}

impl RrpProxy {
    /// Create a TCP proxy definition
    pub fn tcp(name: &str, remote_port: u16, local_addr: Option<&str>) -> Self {
        RrpProxy {
            name: name.to_string(),
            proxy_type: default_proxy_type(),
            remote_port,
            local_addr: local_addr.map(str::to_string),
        }
    }
}

/// Rrp server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RrpServerConfig {
    /// Control listener address
    pub bind: String,
    /// Shared secret clients must present
    pub token: String,
}

/// Rrp client configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RrpClientConfig {
    /// Server control address
    pub server_addr: String,
    /// Shared secret
    pub token: String,
    /// Reconnect after the control connection drops
    #[serde(default = "default_enable_reconnect")]
    pub enable_reconnect: bool,
    /// How long `send` waits for a connection when reconnecting
    #[serde(default = "default_wait_connect_millis")]
    pub wait_connect_millis: u64,
    /// Ports to expose
    #[serde(default)]
    pub proxies: Vec<RrpProxy>,
}

impl RrpClientConfig {
    /// Create a client configuration with default reconnect settings
    pub fn new(server_addr: &str, token: &str, proxies: Vec<RrpProxy>) -> Self {
        RrpClientConfig {
            server_addr: server_addr.to_string(),
            token: token.to_string(),
            enable_reconnect: default_enable_reconnect(),
            wait_connect_millis: default_wait_connect_millis(),
            proxies,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.proxies.is_empty() {
            return Err("Rrp client has no proxies".to_string());
        }
        let mut names: Vec<&str> = self.proxies.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.proxies.len() {
            return Err("Duplicate Rrp proxy name".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrp_proxy_tcp() {
        let proxy = RrpProxy::tcp("ssh", 2222, Some("127.0.0.1:22"));
        assert_eq!(proxy.proxy_type, "tcp");
        assert_eq!(proxy.remote_port, 2222);
        assert_eq!(proxy.local_addr.as_deref(), Some("127.0.0.1:22"));
    }

    #[test]
    fn test_rrp_client_config_validate() {
        let config = RrpClientConfig::new("server:7000", "t", vec![]);
        assert!(config.validate().is_err());

        let config = RrpClientConfig::new(
            "server:7000",
            "t",
            vec![RrpProxy::tcp("a", 1, None), RrpProxy::tcp("a", 2, None)],
        );
        assert!(config.validate().is_err());

        let config = RrpClientConfig::new("server:7000", "t", vec![RrpProxy::tcp("a", 1, None)]);
        assert!(config.validate().is_ok());
        assert!(config.enable_reconnect);
        assert_eq!(config.wait_connect_millis, 4000);
    }
}
