//! Authentication and per-user accounting
//!
//! Users live in a [`UserStore`]. The [`DbAuthenticator`] checks
//! credentials, enforces the per-user concurrent IP limit and folds each
//! connection's traffic back into the user's [`LoginInfo`] when the
//! connection ends.

mod db;
mod store;

pub use db::{DbAuthenticator, LoginGuard};
pub use store::{FileUserStore, MemoryUserStore, UserStore};

use crate::error::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Username of the sentinel user for unauthenticated connections
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Per-IP login record of a user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginInfo {
    /// Last login, unix seconds
    pub latest_time: i64,
    /// Connections currently open from this IP
    pub ref_count: i32,
    /// Seconds spent connected
    pub total_active_seconds: u64,
    /// Bytes read from the client
    pub total_read_bytes: u64,
    /// Bytes written to the client
    pub total_write_bytes: u64,
}

/// A relay user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Concurrent IP limit, -1 for unlimited
    pub max_ip_count: i32,
    /// Login records keyed by client IP
    #[serde(default)]
    pub login_ips: HashMap<IpAddr, LoginInfo>,
    /// When the traffic counters were last reset
    #[serde(default)]
    pub last_reset_time: Option<DateTime<Utc>>,
}

impl User {
    /// Create a user without login history
    pub fn new(username: impl Into<String>, password: impl Into<String>, max_ip_count: i32) -> Self {
        User {
            username: username.into(),
            password: password.into(),
            max_ip_count,
            login_ips: HashMap::new(),
            last_reset_time: None,
        }
    }

    /// The sentinel user for unauthenticated connections
    pub fn anonymous() -> Self {
        User::new(ANONYMOUS_USERNAME, "", -1)
    }

    /// Whether this is the anonymous sentinel
    pub fn is_anonymous(&self) -> bool {
        self.username == ANONYMOUS_USERNAME
    }

    /// Number of IPs with at least one open connection
    pub fn active_ip_count(&self) -> usize {
        self.login_ips.values().filter(|l| l.ref_count > 0).count()
    }

    /// Whether `ip` has at least one open connection
    pub fn is_active_ip(&self, ip: &IpAddr) -> bool {
        self.login_ips.get(ip).map_or(false, |l| l.ref_count > 0)
    }

    /// Total bytes read across all IPs
    pub fn total_read_bytes(&self) -> u64 {
        self.login_ips.values().map(|l| l.total_read_bytes).sum()
    }

    /// Total bytes written across all IPs
    pub fn total_write_bytes(&self) -> u64 {
        self.login_ips.values().map(|l| l.total_write_bytes).sum()
    }
}

/// Shared handle to a user record
///
/// Every connection of the same user shares one handle, so accounting
/// updates are serialized on the per-user lock.
#[derive(Debug, Clone)]
pub struct UserHandle {
    username: Arc<str>,
    inner: Arc<Mutex<User>>,
}

impl UserHandle {
    /// Wrap a user record
    pub fn new(user: User) -> Self {
        UserHandle {
            username: Arc::from(user.username.as_str()),
            inner: Arc::new(Mutex::new(user)),
        }
    }

    /// Handle to a fresh anonymous user
    pub fn anonymous() -> Self {
        UserHandle::new(User::anonymous())
    }

    /// Username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether this is the anonymous sentinel
    pub fn is_anonymous(&self) -> bool {
        &*self.username == ANONYMOUS_USERNAME
    }

    /// Lock the user record
    pub async fn lock(&self) -> MutexGuard<'_, User> {
        self.inner.lock().await
    }

    /// Copy of the current user record
    pub async fn snapshot(&self) -> User {
        self.inner.lock().await.clone()
    }
}

impl PartialEq for UserHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Credential check and connection accounting
#[async_trait]
pub trait Authenticator: Send + Sync + Debug {
    /// Check credentials; `None` when they do not match
    async fn login(&self, username: &str, password: &str) -> Option<UserHandle>;

    /// Register a connection of `user` from `ip`
    ///
    /// Fails with [`RelayError::Auth`] when the user's IP limit is reached.
    async fn on_connect(&self, user: &UserHandle, ip: IpAddr) -> Result<LoginGuard, RelayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_user() {
        let user = User::anonymous();
        assert!(user.is_anonymous());
        assert_eq!(user.max_ip_count, -1);
        assert!(UserHandle::anonymous().is_anonymous());
        assert!(!UserHandle::new(User::new("bob", "pw", 1)).is_anonymous());
    }

    #[test]
    fn test_active_ip_count() {
        let mut user = User::new("alice", "pw", 2);
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        user.login_ips.insert(
            a,
            LoginInfo {
                ref_count: 1,
                total_read_bytes: 10,
                ..Default::default()
            },
        );
        user.login_ips.insert(
            b,
            LoginInfo {
                total_read_bytes: 5,
                ..Default::default()
            },
        );
        assert_eq!(user.active_ip_count(), 1);
        assert!(user.is_active_ip(&a));
        assert!(!user.is_active_ip(&b));
        assert_eq!(user.total_read_bytes(), 15);
    }

    #[tokio::test]
    async fn test_user_handle_shares_record() {
        let handle = UserHandle::new(User::new("alice", "pw", -1));
        let clone = handle.clone();
        clone.lock().await.max_ip_count = 3;
        assert_eq!(handle.snapshot().await.max_ip_count, 3);
        assert_eq!(handle, clone);
        assert_ne!(handle, UserHandle::new(User::new("alice", "pw", -1)));
    }

    #[test]
    fn test_user_bincode_persistable() {
        let mut user = User::new("alice", "pw", 2);
        user.login_ips
            .insert("::1".parse().unwrap(), LoginInfo::default());
        user.last_reset_time = Some(Utc::now());
        let bytes = bincode::serialize(&user).unwrap();
        let decoded: User = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, user);
    }
}
