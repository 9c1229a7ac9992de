//! User stores
//!
//! [`MemoryUserStore`] keeps users for the lifetime of the process.
//! [`FileUserStore`] additionally persists the whole table with bincode after
//! every change, writing a temporary file and renaming it into place.

use super::User;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Async key-value store of users
#[async_trait]
pub trait UserStore: Send + Sync + Debug {
    /// Fetch a user by name
    async fn get(&self, username: &str) -> Result<Option<User>>;

    /// Insert or replace a user
    async fn put(&self, user: User) -> Result<()>;

    /// Remove a user, returning the old record
    async fn remove(&self, username: &str) -> Result<Option<User>>;

    /// Number of users
    async fn size(&self) -> Result<usize>;

    /// All users
    async fn values(&self) -> Result<Vec<User>>;
}

/// In-memory user store
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn put(&self, user: User) -> Result<()> {
        self.users.write().await.insert(user.username.clone(), user);
        Ok(())
    }

    async fn remove(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.write().await.remove(username))
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.users.read().await.len())
    }

    async fn values(&self) -> Result<Vec<User>> {
        Ok(self.users.read().await.values().cloned().collect())
    }
}

/// bincode file-backed user store
#[derive(Debug)]
pub struct FileUserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
}

impl FileUserStore {
    /// Open the store at `path`, loading existing users if the file exists
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let users = match tokio::fs::read(&path).await {
            Ok(bytes) => bincode::deserialize::<HashMap<String, User>>(&bytes)
                .with_context(|| format!("Failed to decode user store: {:?}", path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("User store {:?} does not exist yet", path);
                HashMap::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read user store: {:?}", path))
            }
        };
        info!("Loaded {} users from {:?}", users.len(), path);
        Ok(FileUserStore {
            path,
            users: RwLock::new(users),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, users: &HashMap<String, User>) -> Result<()> {
        let bytes = bincode::serialize(users).with_context(|| "Failed to encode user store")?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn get(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn put(&self, user: User) -> Result<()> {
        let mut users = self.users.write().await;
        users.insert(user.username.clone(), user);
        self.persist(&users).await
    }

    async fn remove(&self, username: &str) -> Result<Option<User>> {
        let mut users = self.users.write().await;
        let removed = users.remove(username);
        if removed.is_some() {
            self.persist(&users).await?;
        }
        Ok(removed)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.users.read().await.len())
    }

    async fn values(&self) -> Result<Vec<User>> {
        Ok(self.users.read().await.values().cloned().collect())
    }
}
