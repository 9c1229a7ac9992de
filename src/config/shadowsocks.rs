//! Shadowsocks server configuration

use serde::{Deserialize, Serialize};

fn default_listen() -> String {
    "0.0.0.0:8388".to_string()
}

fn default_method() -> String {
    "aes-256-gcm".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_udp_idle_timeout() -> u64 {
    120
}

/// Shadowsocks server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ShadowsocksConfig {
    /// TCP and UDP listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// AEAD method name
    #[serde(default = "default_method")]
    pub method: String,

    /// Pre-shared password
    pub password: String,

    /// Relay UDP datagrams
    #[serde(default)]
    pub allow_udp: bool,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// UDP session idle timeout in seconds
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout: u64,
}

impl ShadowsocksConfig {
    /// Create a configuration with default listener and timeouts
    pub fn new(method: &str, password: &str) -> Self {
        ShadowsocksConfig {
            listen: default_listen(),
            method: method.to_string(),
            password: password.to_string(),
            allow_udp: false,
            connect_timeout: default_connect_timeout(),
            udp_idle_timeout: default_udp_idle_timeout(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.password.is_empty() {
            return Err("Shadowsocks password is empty".to_string());
        }
        crate::cipher::CipherKind::from_method(&self.method)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
