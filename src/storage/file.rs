//! JSON-file key/value store.
//!
//! The whole map lives in one file (e.g. `~/.cartridge/keychain.json`) and
//! is rewritten on every mutation. The file holds session grants, so it is
//! created with owner-only permissions on unix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::storage::KeyValueStore;

pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A file that exists but does not parse is logged and treated as empty;
    /// the next write replaces it.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let entries = match tokio::fs::read(path).await {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, String>>(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring unparseable keychain store {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(StorageError::Io {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let io_err = |e: std::io::Error| StorageError::Io {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms)
                .await
                .map_err(io_err)?;
        }

        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        tracing::debug!("Keychain store saved to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        let mut staged = entries.clone();
        staged.insert(key.to_string(), value.to_string());
        self.persist(&staged).await?;
        *entries = staged;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut staged = entries.clone();
        staged.remove(key);
        self.persist(&staged).await?;
        *entries = staged;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("keychain.json");

        let store = FileStore::open(&path).await.unwrap();
        store.set("@cartridge/active", "0xabc").await.unwrap();
        store.set("features", "{}").await.unwrap();
        store.remove("features").await.unwrap();

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("@cartridge/active").await.unwrap().as_deref(),
            Some("0xabc")
        );
        assert_eq!(reopened.get("features").await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("keychain.json");
        let store = FileStore::open(&path).await.unwrap();
        store.set("k", "v").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keychain.json");
        let store = FileStore::open(&path).await.unwrap();
        store.set("kept", "1").await.unwrap();

        // A directory in the file's place makes the final rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.set("lost", "2").await.is_err());
        assert!(store.remove("kept").await.is_err());
        assert_eq!(store.get("lost").await.unwrap(), None);
        assert_eq!(store.get("kept").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys().await.unwrap(), vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_opens_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keychain.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }
}
