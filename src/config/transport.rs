//! `[tcp]` section: socket tuning shared by listeners and dialers

use serde::{Deserialize, Serialize};

/// Socket options for relayed and tunnelled TCP connections
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TcpConfig {
    /// Set TCP_NODELAY on every connection
    pub nodelay: bool,

    /// Idle seconds before the first keepalive probe
    pub keepalive_secs: u64,

    /// Seconds between keepalive probes
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: true,
            keepalive_secs: 20,
            keepalive_interval: 8,
        }
    }
}

impl TcpConfig {
    /// Reject keepalive timings the kernel would refuse
    pub fn validate(&self) -> Result<(), String> {
        if self.keepalive_secs == 0 {
            return Err("tcp.keepalive_secs must be positive".into());
        }
        if self.keepalive_interval == 0 {
            return Err("tcp.keepalive_interval must be positive".into());
        }
        Ok(())
    }
}
