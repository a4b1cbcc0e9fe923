//! SQLite storage backend.
//!
//! Uses a single SQLite database file with one table:
//! - `kv`: key/value rows, primary-keyed by the path-like key so prefix
//!   scans are index range scans

use async_trait::async_trait;
use chrono::Utc;
use parley_core::error::StoreError;
use parley_core::storage::{StorageBackend, StorageQuery};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// Upper bound appended to a prefix to turn it into a key range.
const PREFIX_END: char = char::MAX;

/// A SQLite-backed storage engine.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (or create) a database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        info!("SQLite storage initialized at {path}");
        Ok(backend)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let backend = Self { pool };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY NOT NULL,
                value      BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(format!("kv table migration: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.map(|r| r.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(unavailable)
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() > 0)
    }

    async fn query(&self, query: StorageQuery) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let upper = format!("{}{PREFIX_END}", query.prefix);
        // SQLite treats a negative LIMIT as unbounded.
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = if query.tail {
            "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key DESC LIMIT ?"
        } else {
            "SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key ASC LIMIT ?"
        };

        let rows = sqlx::query(sql)
            .bind(query.prefix.clone())
            .bind(upper)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        let mut results = rows
            .iter()
            .map(|r| Ok((r.try_get::<String, _>("key")?, r.try_get::<Vec<u8>, _>("value")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(unavailable)?;

        if query.tail {
            results.reverse();
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_backend() -> (SqliteBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("sqlite://{}", dir.path().join("parley.db").display());
        (SqliteBackend::new(&path).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn upsert_and_read() {
        let (backend, _dir) = temp_backend().await;
        backend.write("settings/a/x", b"1").await.unwrap();
        backend.write("settings/a/x", b"2").await.unwrap();
        assert_eq!(backend.read("settings/a/x").await.unwrap(), Some(b"2".to_vec()));
        assert!(backend.read("settings/a/y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prefix_scan_with_tail() {
        let (backend, _dir) = temp_backend().await;
        for key in ["m/c1/1", "m/c1/2", "m/c1/3", "m/c10/1", "m/c2/1"] {
            backend.write(key, key.as_bytes()).await.unwrap();
        }

        let rows = backend.query(StorageQuery::prefix("m/c1/")).await.unwrap();
        assert_eq!(rows.len(), 3);

        let rows = backend.query(StorageQuery::prefix("m/c1/").limit(2).tail()).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m/c1/2", "m/c1/3"]);
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("sqlite://{}", dir.path().join("parley.db").display());
        {
            let backend = SqliteBackend::new(&path).await.unwrap();
            backend.write("user/1", b"alice").await.unwrap();
            backend.pool.close().await;
        }
        let backend = SqliteBackend::new(&path).await.unwrap();
        assert_eq!(backend.read("user/1").await.unwrap(), Some(b"alice".to_vec()));
        assert!(backend.delete("user/1").await.unwrap());
    }
}
