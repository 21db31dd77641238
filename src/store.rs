//! Persistent key/value store for session and source metadata.
//!
//! The engine persists per-user mode state and knowledge-source records as
//! JSON values so they survive process restarts. Vector data never lives
//! here; it belongs to the collection manager. The [`KvStore`] trait keeps
//! the backend pluggable: SQLite for deployments, in-memory for tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Persistent store capability: `get/put/delete` by key.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.map.read().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.map
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.map.write().unwrap().remove(key);
        Ok(())
    }
}

/// SQLite-backed store. Values are stored as JSON text in a single table.
pub struct SqliteKv {
    pool: SqlitePool,
}

impl SqliteKv {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists. Idempotent.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let kv = MemoryKv::new();
        assert!(kv.get("a").await.unwrap().is_none());
        kv.put("a", &serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().unwrap()["n"], 1);
        kv.delete("a").await.unwrap();
        assert!(kv.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_overwrite() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kb.sqlite");
        let kv = SqliteKv::connect(&path).await.unwrap();

        kv.put("mode:u1", &serde_json::json!({"rag_enabled": true}))
            .await
            .unwrap();
        kv.put("mode:u1", &serde_json::json!({"rag_enabled": false}))
            .await
            .unwrap();

        let value = kv.get("mode:u1").await.unwrap().unwrap();
        assert_eq!(value["rag_enabled"], false);

        // Reconnect: values survive.
        drop(kv);
        let kv = SqliteKv::connect(&path).await.unwrap();
        assert!(kv.get("mode:u1").await.unwrap().is_some());
    }
}
