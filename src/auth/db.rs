//! Store-backed authenticator with login accounting

use super::{Authenticator, FileUserStore, MemoryUserStore, User, UserHandle, UserStore};
use crate::config::{AuthConfig, StoreBackend};
use crate::error::RelayError;
use crate::session::TrafficCounter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

fn password_digest(password: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(password.as_bytes()));
    out
}

/// Compare digests without an early exit
fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Authenticator backed by a [`UserStore`]
#[derive(Debug)]
pub struct DbAuthenticator {
    store: Arc<dyn UserStore>,
    handles: Mutex<HashMap<String, UserHandle>>,
    dummy_digest: [u8; 32],
}

impl DbAuthenticator {
    /// Wrap an existing store
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        DbAuthenticator {
            store,
            handles: Mutex::new(HashMap::new()),
            dummy_digest: password_digest("\0dummy\0"),
        }
    }

    /// Build the store named by `config` and seed its users
    ///
    /// Seeding updates the password and IP limit of existing users and keeps
    /// their login history.
    pub async fn from_config(config: &AuthConfig) -> Result<Self> {
        let store: Arc<dyn UserStore> = match config.backend {
            StoreBackend::Memory => Arc::new(MemoryUserStore::new()),
            StoreBackend::File => {
                let path = config
                    .store_path
                    .as_ref()
                    .context("File user store requires store_path")?;
                Arc::new(FileUserStore::open(path).await?)
            }
        };

        for seed in &config.users {
            let user = match store.get(&seed.username).await? {
                Some(mut existing) => {
                    existing.password = seed.password.clone();
                    existing.max_ip_count = seed.max_ip_count;
                    existing
                }
                None => User::new(&seed.username, &seed.password, seed.max_ip_count),
            };
            store.put(user).await?;
        }

        let auth = DbAuthenticator::new(store);
        info!("User store ready with {} users", auth.size().await?);
        Ok(auth)
    }

    fn cached(&self, username: &str) -> Option<UserHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(username)
            .cloned()
    }

    /// Shared handle for `username`, loading it from the store if needed
    async fn handle(&self, username: &str) -> Result<Option<UserHandle>> {
        if let Some(handle) = self.cached(username) {
            return Ok(Some(handle));
        }
        let Some(user) = self.store.get(username).await? else {
            return Ok(None);
        };
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        // Another task may have loaded it meanwhile; keep the first handle
        let handle = handles
            .entry(username.to_string())
            .or_insert_with(|| UserHandle::new(user))
            .clone();
        Ok(Some(handle))
    }

    /// Insert or replace a user
    pub async fn save(&self, user: User) -> Result<()> {
        let handle = self.cached(&user.username);
        match handle {
            Some(handle) => {
                let mut current = handle.lock().await;
                *current = user;
                self.store.put(current.clone()).await
            }
            None => self.store.put(user).await,
        }
    }

    /// Remove a user
    pub async fn delete(&self, username: &str) -> Result<Option<User>> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(username);
        self.store.remove(username).await
    }

    /// Number of users
    pub async fn size(&self) -> Result<usize> {
        self.store.size().await
    }

    /// Current record of `username`
    pub async fn get(&self, username: &str) -> Result<Option<User>> {
        match self.handle(username).await? {
            Some(handle) => Ok(Some(handle.snapshot().await)),
            None => Ok(None),
        }
    }

    async fn for_each_user<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&mut User) -> bool + Send,
    {
        for user in self.store.values().await? {
            let Some(handle) = self.handle(&user.username).await? else {
                continue;
            };
            let mut current = handle.lock().await;
            if f(&mut current) {
                self.store.put(current.clone()).await?;
            }
        }
        Ok(())
    }

    /// Remove idle login IPs last seen before `now - retention`
    ///
    /// Returns the number of records removed.
    pub async fn sweep_login_ips(&self, now: DateTime<Utc>, retention: Duration) -> Result<usize> {
        let cutoff = now.timestamp() - retention.as_secs() as i64;
        let mut removed = 0;
        self.for_each_user(|user| {
            let before = user.login_ips.len();
            user.login_ips
                .retain(|_, info| info.ref_count > 0 || info.latest_time >= cutoff);
            removed += before - user.login_ips.len();
            before != user.login_ips.len()
        })
        .await?;
        if removed > 0 {
            debug!("Swept {} stale login IPs", removed);
        }
        Ok(removed)
    }

    /// Zero every user's traffic counters
    pub async fn reset_counters(&self, now: DateTime<Utc>) -> Result<()> {
        self.for_each_user(|user| {
            for info in user.login_ips.values_mut() {
                info.total_active_seconds = 0;
                info.total_read_bytes = 0;
                info.total_write_bytes = 0;
            }
            user.last_reset_time = Some(now);
            true
        })
        .await?;
        info!("Traffic counters reset at {}", now);
        Ok(())
    }

    /// Periodic maintenance: sweep stale IPs, then reset counters on the
    /// configured day of the month (at most once that day)
    pub async fn run_maintenance(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        reset_day_of_month: u32,
    ) -> Result<()> {
        self.sweep_login_ips(now, retention).await?;

        if reset_day_of_month == 0 || now.day() != reset_day_of_month {
            return Ok(());
        }
        let mut due = false;
        for user in self.store.values().await? {
            let last = match self.handle(&user.username).await? {
                Some(handle) => handle.lock().await.last_reset_time,
                None => continue,
            };
            if last.map_or(true, |t| t.date_naive() != now.date_naive()) {
                due = true;
                break;
            }
        }
        if due {
            self.reset_counters(now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for DbAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Option<UserHandle> {
        let offered = password_digest(password);
        let handle = match self.handle(username).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("User lookup for {} failed: {:#}", username, e);
                None
            }
        };
        let Some(handle) = handle else {
            // Same amount of work as a real comparison
            let _ = digest_eq(&offered, &self.dummy_digest);
            return None;
        };
        let expected = password_digest(&handle.lock().await.password);
        if digest_eq(&offered, &expected) {
            Some(handle)
        } else {
            None
        }
    }

    async fn on_connect(&self, user: &UserHandle, ip: IpAddr) -> Result<LoginGuard, RelayError> {
        if user.is_anonymous() {
            return Ok(LoginGuard::untracked());
        }
        let mut record = user.lock().await;
        if record.max_ip_count != -1
            && !record.is_active_ip(&ip)
            && record.active_ip_count() >= record.max_ip_count.max(0) as usize
        {
            return Err(RelayError::Auth(format!(
                "User {} reached IP limit {} ({} rejected)",
                record.username, record.max_ip_count, ip
            )));
        }
        let refs = {
            let info = record.login_ips.entry(ip).or_default();
            info.ref_count += 1;
            info.latest_time = Utc::now().timestamp();
            info.ref_count
        };
        debug!("User {} connected from {} (refs {})", record.username, ip, refs);

        if let Err(e) = self.store.put(record.clone()).await {
            warn!("Failed to persist login of {}: {:#}", record.username, e);
        }
        Ok(LoginGuard {
            tracked: Some(Tracked {
                store: self.store.clone(),
                user: user.clone(),
                ip,
            }),
        })
    }
}

struct Tracked {
    store: Arc<dyn UserStore>,
    user: UserHandle,
    ip: IpAddr,
}

impl Tracked {
    async fn finish(self, active: Duration, read: u64, write: u64) {
        let mut record = self.user.lock().await;
        let info = record.login_ips.entry(self.ip).or_default();
        info.ref_count = (info.ref_count - 1).max(0);
        info.total_active_seconds += active.as_secs();
        info.total_read_bytes += read;
        info.total_write_bytes += write;
        debug!(
            "User {} disconnected from {} (read {}, write {})",
            record.username, self.ip, read, write
        );
        if let Err(e) = self.store.put(record.clone()).await {
            warn!("Failed to persist logout of {}: {:#}", record.username, e);
        }
    }
}

/// Open login of one connection
///
/// [`finish`](LoginGuard::finish) folds the connection's traffic into the
/// user's record. A guard dropped without finishing still releases its IP
/// reference, on a spawned task.
#[must_use = "a login guard must be finished when the connection closes"]
pub struct LoginGuard {
    tracked: Option<Tracked>,
}

impl LoginGuard {
    /// Guard that records nothing, for anonymous connections
    pub fn untracked() -> Self {
        LoginGuard { tracked: None }
    }

    /// Whether this guard updates a user record
    pub fn is_tracked(&self) -> bool {
        self.tracked.is_some()
    }

    /// Release the IP reference and accumulate `traffic`
    pub async fn finish(mut self, traffic: &TrafficCounter) {
        if let Some(tracked) = self.tracked.take() {
            tracked
                .finish(traffic.elapsed(), traffic.read_bytes(), traffic.write_bytes())
                .await;
        }
    }
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        let Some(tracked) = self.tracked.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(tracked.finish(Duration::ZERO, 0, 0));
            }
            Err(_) => warn!(
                "Login guard of {} dropped outside the runtime",
                tracked.user.username()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LoginInfo;
    use crate::config::UserConfig;
    use chrono::TimeZone;

    async fn authenticator_with(users: &[(&str, &str, i32)]) -> DbAuthenticator {
        let config = AuthConfig {
            users: users
                .iter()
                .map(|(u, p, m)| UserConfig {
                    username: u.to_string(),
                    password: p.to_string(),
                    max_ip_count: *m,
                })
                .collect(),
            ..Default::default()
        };
        DbAuthenticator::from_config(&config).await.unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_login() {
        let auth = authenticator_with(&[("alice", "wonderland", -1)]).await;
        assert!(auth.login("alice", "wonderland").await.is_some());
        assert!(auth.login("alice", "wrong").await.is_none());
        assert!(auth.login("nobody", "wonderland").await.is_none());

        // Same shared handle for repeated logins
        let a = auth.login("alice", "wonderland").await.unwrap();
        let b = auth.login("alice", "wonderland").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_ip_limit() {
        let auth = authenticator_with(&[("alice", "pw", 2)]).await;
        let user = auth.login("alice", "pw").await.unwrap();

        let g1 = auth.on_connect(&user, ip("10.0.0.1")).await.unwrap();
        let g2 = auth.on_connect(&user, ip("10.0.0.2")).await.unwrap();

        let third = auth.on_connect(&user, ip("10.0.0.3")).await;
        assert!(matches!(third, Err(RelayError::Auth(_))));

        // Re-login from an active IP is fine
        let g3 = auth.on_connect(&user, ip("10.0.0.1")).await.unwrap();
        assert_eq!(
            user.snapshot().await.login_ips[&ip("10.0.0.1")].ref_count,
            2
        );

        let traffic = TrafficCounter::new();
        g1.finish(&traffic).await;
        g3.finish(&traffic).await;
        // 10.0.0.1 is no longer active, so a new IP fits
        let g4 = auth.on_connect(&user, ip("10.0.0.3")).await.unwrap();
        g2.finish(&traffic).await;
        g4.finish(&traffic).await;
    }

    #[tokio::test]
    async fn test_finish_accumulates_traffic() {
        let auth = authenticator_with(&[("bob", "pw", -1)]).await;
        let user = auth.login("bob", "pw").await.unwrap();

        let guard = auth.on_connect(&user, ip("192.168.1.5")).await.unwrap();
        assert!(guard.is_tracked());
        let traffic = TrafficCounter::new();
        traffic.add_read(100);
        traffic.add_write(40);
        guard.finish(&traffic).await;

        let stored = auth.get("bob").await.unwrap().unwrap();
        let info = &stored.login_ips[&ip("192.168.1.5")];
        assert_eq!(info.ref_count, 0);
        assert_eq!(info.total_read_bytes, 100);
        assert_eq!(info.total_write_bytes, 40);
        assert!(info.latest_time > 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_reference() {
        let auth = authenticator_with(&[("carol", "pw", 1)]).await;
        let user = auth.login("carol", "pw").await.unwrap();

        let guard = auth.on_connect(&user, ip("10.1.1.1")).await.unwrap();
        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(user.snapshot().await.active_ip_count(), 0);
        let again = auth.on_connect(&user, ip("10.1.1.2")).await.unwrap();
        again.finish(&TrafficCounter::new()).await;
    }

    #[tokio::test]
    async fn test_anonymous_untracked() {
        let auth = authenticator_with(&[]).await;
        let guard = auth
            .on_connect(&UserHandle::anonymous(), ip("10.0.0.9"))
            .await
            .unwrap();
        assert!(!guard.is_tracked());
        guard.finish(&TrafficCounter::new()).await;
        assert_eq!(auth.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_and_delete() {
        let auth = authenticator_with(&[("dave", "pw", -1)]).await;
        let handle = auth.login("dave", "pw").await.unwrap();

        auth.save(User::new("dave", "new-pw", 1)).await.unwrap();
        assert_eq!(handle.snapshot().await.password, "new-pw");
        assert!(auth.login("dave", "new-pw").await.is_some());

        assert!(auth.delete("dave").await.unwrap().is_some());
        assert!(auth.login("dave", "new-pw").await.is_none());
        assert_eq!(auth.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_login_ips() {
        let auth = authenticator_with(&[("erin", "pw", -1)]).await;
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let old = now.timestamp() - 3 * 24 * 3600;

        let mut user = auth.get("erin").await.unwrap().unwrap();
        user.login_ips.insert(
            ip("10.0.0.1"),
            LoginInfo {
                latest_time: old,
                ..Default::default()
            },
        );
        user.login_ips.insert(
            ip("10.0.0.2"),
            LoginInfo {
                latest_time: old,
                ref_count: 1,
                ..Default::default()
            },
        );
        user.login_ips.insert(
            ip("10.0.0.3"),
            LoginInfo {
                latest_time: now.timestamp() - 60,
                ..Default::default()
            },
        );
        auth.save(user).await.unwrap();

        let removed = auth
            .sweep_login_ips(now, Duration::from_secs(2 * 24 * 3600))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let user = auth.get("erin").await.unwrap().unwrap();
        assert!(!user.login_ips.contains_key(&ip("10.0.0.1")));
        assert_eq!(user.login_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_resets_once_on_reset_day() {
        let auth = authenticator_with(&[("frank", "pw", -1)]).await;
        let user = auth.login("frank", "pw").await.unwrap();
        let guard = auth.on_connect(&user, ip("10.0.0.1")).await.unwrap();
        let traffic = TrafficCounter::new();
        traffic.add_read(500);
        guard.finish(&traffic).await;

        let retention = Duration::from_secs(365 * 24 * 3600);
        let not_reset_day = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        auth.run_maintenance(not_reset_day, retention, 1).await.unwrap();
        assert_eq!(user.snapshot().await.total_read_bytes(), 500);

        let reset_day = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        auth.run_maintenance(reset_day, retention, 1).await.unwrap();
        let snapshot = user.snapshot().await;
        assert_eq!(snapshot.total_read_bytes(), 0);
        assert_eq!(snapshot.last_reset_time, Some(reset_day));

        // Traffic after the reset survives a second run the same day
        let guard = auth.on_connect(&user, ip("10.0.0.1")).await.unwrap();
        traffic.add_read(1);
        guard.finish(&traffic).await;
        let later = Utc.with_ymd_and_hms(2024, 4, 1, 6, 0, 0).unwrap();
        auth.run_maintenance(later, retention, 1).await.unwrap();
        assert_eq!(user.snapshot().await.total_read_bytes(), 501);
    }
}
