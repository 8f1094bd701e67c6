//! libSQL backend for the key/value store.
//!
//! Embedded SQLite-compatible file database; one row per key in
//! `keychain_kv`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase};

use crate::error::StorageError;
use crate::storage::KeyValueStore;

pub struct LibSqlStore {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlStore {
    /// Open (creating if needed) a local database file and ensure the schema.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.display().to_string(),
                reason: format!("Failed to create database directory: {}", e),
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to open libSQL database: {}", e))
            })?;

        let store = Self { db: Arc::new(db) };
        let conn = store.connect().await?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS keychain_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            (),
        )
        .await?;
        Ok(store)
    }

    /// Create a new connection.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` so concurrent writers wait instead
    /// of failing with "database is locked".
    async fn connect(&self) -> Result<Connection, StorageError> {
        let conn = self.db.connect().map_err(|e| {
            StorageError::Connection(format!("Failed to create connection: {}", e))
        })?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| StorageError::Connection(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }
}

#[async_trait]
impl KeyValueStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT value FROM keychain_kv WHERE key = ?1",
                libsql::params![key],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StorageError::Query(e.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO keychain_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            libsql::params![key, value, chrono::Utc::now().to_rfc3339()],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.connect().await?;
        conn.execute(
            "DELETE FROM keychain_kv WHERE key = ?1",
            libsql::params![key],
        )
        .await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.connect().await?;
        let mut rows = conn.query("SELECT key FROM keychain_kv", ()).await?;

        let mut keys = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => keys.push(row.get::<String>(0)?),
                Ok(None) => break,
                Err(e) => return Err(StorageError::Query(e.to_string())),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_remove_and_list() {
        // File-backed so every connection sees the same database.
        let dir = tempfile::tempdir().unwrap();
        let store = LibSqlStore::open(&dir.path().join("keychain.db"))
            .await
            .unwrap();

        store.set("@cartridge/active", "0x1").await.unwrap();
        store.set("@cartridge/active", "0x2").await.unwrap();
        store.set("features", "{}").await.unwrap();
        assert_eq!(
            store.get("@cartridge/active").await.unwrap().as_deref(),
            Some("0x2")
        );

        store.remove("@cartridge/active").await.unwrap();
        assert_eq!(store.get("@cartridge/active").await.unwrap(), None);
        assert_eq!(store.keys().await.unwrap(), vec!["features".to_string()]);
    }
}
