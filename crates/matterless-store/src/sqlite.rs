// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store.
//!
//! Used as the durable local cache of a [`ReplicatedStore`](crate::ReplicatedStore)
//! so a restarted node resumes the replication log instead of replaying it.
//! Values are stored as JSON text; keys compare bytewise, which matches
//! Rust's `str` ordering.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{debug, info};

use crate::{QueryResult, Result, Store};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Key-value store in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are run before returning.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool, path: None })
    }

    /// Open (creating if needed) a database file.
    ///
    /// Parent directories are created. [`Store::delete_store`] removes the file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        MIGRATOR.run(&pool).await?;

        info!(path = %path.display(), "Opened SQLite store");
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self> {
        // A memory database lives per connection, so the pool must hold exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_rows(rows: Vec<(String, String)>) -> Result<Vec<QueryResult>> {
        rows.into_iter()
            .map(|(key, raw)| {
                Ok(QueryResult {
                    key,
                    value: serde_json::from_str(&raw)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<(String,)> = sqlx::query_as("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match raw {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_range(&self, start: &str, end: &str) -> Result<Vec<QueryResult>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT key, value FROM kv
            WHERE key >= ? AND key < ?
            ORDER BY key
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }

    async fn query_prefix(&self, prefix: &str) -> Result<Vec<QueryResult>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT key, value FROM kv
            WHERE key >= ?1 AND substr(key, 1, length(?1)) = ?1
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_rows(rows)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn delete_store(&self) -> Result<()> {
        match &self.path {
            Some(path) => {
                self.pool.close().await;
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                debug!(path = %path.display(), "Removed SQLite store");
            }
            None => {
                sqlx::query("DELETE FROM kv").execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_overwrites_and_get_decodes_json() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put("person:1", json!({"name": "John", "age": 20})).await.unwrap();
        store.put("person:1", json!({"name": "John", "age": 21})).await.unwrap();

        let value = store.get("person:1").await.unwrap().unwrap();
        assert_eq!(value["age"], json!(21));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queries_are_ordered_and_bounded() {
        let store = SqliteStore::in_memory().await.unwrap();
        for key in ["person:2", "person:1", "pet:1", "person"] {
            store.put(key, json!(key)).await.unwrap();
        }

        let prefix: Vec<_> = store
            .query_prefix("person:")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(prefix, ["person:1", "person:2"]);

        let range = store.query_range("person:", "person:~").await.unwrap();
        assert_eq!(range.len(), 2);
        assert!(store.query_range("person:2", "person:2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen_and_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store.put("$$seq", json!(42)).await.unwrap();
        store.close().await.unwrap();

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        assert_eq!(reopened.get("$$seq").await.unwrap(), Some(json!(42)));

        reopened.delete_store().await.unwrap();
        assert!(!path.exists());
    }
}
