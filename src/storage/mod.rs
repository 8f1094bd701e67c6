//! Durable key/value storage behind the session registry.
//!
//! The registry only ever talks to a [`KeyValueStore`], so tests run against
//! an isolated [`MemoryStore`] while the binary uses a [`FileStore`] or,
//! with the `libsql` feature, a [`LibSqlStore`].

mod file;
#[cfg(feature = "libsql")]
mod libsql;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::StorageError;

pub use self::file::FileStore;
#[cfg(feature = "libsql")]
pub use self::libsql::LibSqlStore;

/// String key/value storage, the moral equivalent of browser `localStorage`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys currently stored, in no particular order.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

/// In-memory store. Each instance is independent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// Get the default keychain directory (~/.cartridge).
pub fn default_keychain_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cartridge")
}

/// Open the store selected by configuration.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn KeyValueStore>, StorageError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::File => Ok(Arc::new(FileStore::open(&config.path).await?)),
        #[cfg(feature = "libsql")]
        StorageBackend::LibSql => Ok(Arc::new(LibSqlStore::open(&config.path).await?)),
        #[cfg(not(feature = "libsql"))]
        StorageBackend::LibSql => Err(StorageError::Connection(
            "libsql storage requires the `libsql` feature".to_string(),
        )),
    }
}
