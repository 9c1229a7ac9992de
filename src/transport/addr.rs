//! Server address with a cached resolution
//!
//! The Rrp client resolves its server once and reuses the result across
//! reconnects; a failed connect clears the cache so the next attempt
//! resolves again.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::RwLock;

/// Address string plus its last resolution
#[derive(Debug, Clone)]
pub struct AddrMaybeCached {
    addr: String,
    cached: Arc<RwLock<Option<SocketAddr>>>,
}

impl AddrMaybeCached {
    /// Create an address that resolves on first use
    pub fn new(addr: &str) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(None)),
        }
    }

    /// Address as configured
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last resolution, if any
    pub async fn get_cached(&self) -> Option<SocketAddr> {
        *self.cached.read().await
    }

    /// Forget the last resolution
    pub async fn clear_cache(&self) {
        *self.cached.write().await = None;
    }

    /// Resolve, preferring the cached result
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Some(cached) = self.get_cached().await {
            return Ok(cached);
        }
        let resolved = lookup_host(self.addr.as_str())
            .await
            .with_context(|| format!("Failed to resolve address: {}", self.addr))?
            .next()
            .with_context(|| format!("No addresses found for: {}", self.addr))?;
        *self.cached.write().await = Some(resolved);
        Ok(resolved)
    }
}

impl From<SocketAddr> for AddrMaybeCached {
    fn from(addr: SocketAddr) -> Self {
        AddrMaybeCached {
            addr: addr.to_string(),
            cached: Arc::new(RwLock::new(Some(addr))),
        }
    }
}
