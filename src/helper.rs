//! Helper utilities for Sockrelay
//!
//! This module provides common utility functions used throughout the application.

use std::net::IpAddr;
use std::time::Duration;

/// Default buffer size for IO operations
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default connection timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Largest UDP datagram we read
pub const MAX_UDP_PACKET: usize = 65535;

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

/// Check whether a source IP may use the UDP relay without being whitelisted
pub fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg = v6.segments()[0];
            v6.is_loopback()
                // fc00::/7 unique local
                || (seg & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (seg & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().map_or(false, |v4| v4.is_loopback() || v4.is_private())
        }
    }
}

/// Retry configuration for operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Stateful reconnect schedule built on [`RetryConfig`]
///
/// Each call to [`Backoff::next_delay`] advances one consecutive failure;
/// [`Backoff::reset`] is called after a successful connect.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
}

impl Backoff {
    /// Create a backoff schedule from a retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Backoff {
            config,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Number of consecutive failures recorded
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Forget all failures
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
