//! Authentication and accounting configuration

use serde::{Deserialize, Serialize};

/// Default retention of login IP records: two days
fn default_ip_retention_secs() -> u64 {
    2 * 24 * 3600
}

/// Default day of month for counter resets
fn default_reset_day_of_month() -> u32 {
    1
}

/// Default maintenance interval: hourly
fn default_maintenance_interval_secs() -> u64 {
    3600
}

/// Default per-user concurrent IP limit (unlimited)
fn default_max_ip_count() -> i32 {
    -1
}

/// User store backend
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// Ephemeral in-memory store
    #[default]
    #[serde(rename = "memory")]
    Memory,
    /// bincode file persisted on every change
    #[serde(rename = "file")]
    File,
}

/// A user declared in configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Concurrent IP limit, -1 for unlimited
    #[serde(default = "default_max_ip_count")]
    pub max_ip_count: i32,
}

/// Authentication configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Path of the user store file (file backend)
    #[serde(default)]
    pub store_path: Option<String>,

    /// Login IP records older than this are swept
    #[serde(default = "default_ip_retention_secs")]
    pub ip_retention_secs: u64,

    /// Day of month on which traffic counters are reset, 0 disables
    #[serde(default = "default_reset_day_of_month")]
    pub reset_day_of_month: u32,

    /// How often maintenance runs
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Users seeded into the store at startup
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            backend: StoreBackend::default(),
            store_path: None,
            ip_retention_secs: default_ip_retention_secs(),
            reset_day_of_month: default_reset_day_of_month(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            users: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.backend == StoreBackend::File && self.store_path.is_none() {
            return Err("File user store requires store_path".to_string());
        }
        if self.reset_day_of_month > 28 {
            return Err(format!(
                "reset_day_of_month must be between 0 and 28, got {}",
                self.reset_day_of_month
            ));
        }
        if self.users.iter().any(|u| u.username.is_empty()) {
            return Err("User with empty username".to_string());
        }
        Ok(())
    }
}
