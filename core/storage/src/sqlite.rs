//! SQLite-backed durable store.
//!
//! All collections share one `records` table keyed by `(collection, key)`.
//! The `kind` and `expiresAt` fields of each record are copied into indexed
//! columns on write so that dispatch by kind and expiry sweeps are range scans.
//! Expiry is stored in nanoseconds so sweeps agree with the cache's own
//! expiry check. Statements run on the blocking pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use lantern_common::{Collection, Error, Result};
use crate::provider::{expiry_of, kind_of, DurableStore, Record};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    kind        TEXT,
    expires_at_ns INTEGER,
    PRIMARY KEY (collection, key)
);

CREATE INDEX IF NOT EXISTS idx_records_kind ON records(collection, kind);
CREATE INDEX IF NOT EXISTS idx_records_expiry ON records(collection, expires_at_ns);
"#;

/// Durable store persisted in a SQLite database file.
///
/// The database is opened lazily on first use. Concurrent first calls
/// serialize on an async mutex, so schema setup runs exactly once per open.
pub struct SqliteStore {
    path: PathBuf,
    conn: tokio::sync::Mutex<Option<Arc<Mutex<Connection>>>>,
}

impl SqliteStore {
    /// Create a store backed by the database file at `path`.
    ///
    /// Nothing is touched on disk until the first operation.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// Create a store backed by a private in-memory database (for testing).
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default database location: `{data_dir}/lantern/offline.db`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::data_dir()
            .or_else(|| {
                dirs::home_dir().map(|mut h| {
                    h.push(".local");
                    h.push("share");
                    h
                })
            })
            .ok_or_else(|| {
                Error::Configuration("failed to resolve OS app data directory".to_string())
            })?;

        Ok(base.join("lantern").join("offline.db"))
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let path = self.path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(task_failed)??;
        info!("Durable store opened at {:?}", self.path);

        let conn = Arc::new(Mutex::new(conn));
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            f(&conn)
        })
        .await
        .map_err(task_failed)?
        .map_err(unavailable)
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    if path.as_os_str() != ":memory:" {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StorageUnavailable(format!(
                        "failed to create store directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }
    }

    let conn = Connection::open(path).map_err(unavailable)?;
    conn.execute_batch(SCHEMA).map_err(unavailable)?;
    Ok(conn)
}

/// Nanoseconds since the epoch, saturating outside the representable range.
fn expiry_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or(if at.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

fn unavailable(err: rusqlite::Error) -> Error {
    Error::StorageUnavailable(err.to_string())
}

fn task_failed(err: tokio::task::JoinError) -> Error {
    Error::StorageUnavailable(format!("store task failed: {}", err))
}

fn decode(value: String) -> rusqlite::Result<Record> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn open(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.take().is_some() {
            debug!("Durable store closed at {:?}", self.path);
        }
        Ok(())
    }

    async fn put(&self, collection: Collection, key: &str, value: Record) -> Result<()> {
        let kind = kind_of(&value).map(str::to_string);
        let expires_at = expiry_of(&value).map(expiry_nanos);
        let encoded = serde_json::to_string(&value)?;
        let key = key.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO records (collection, key, value, kind, expires_at_ns)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![collection.as_str(), key, encoded, kind, expires_at],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Record>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let row = conn.query_row(
                "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
                |row| row.get::<_, String>(0),
            );

            match row {
                Ok(value) => decode(value).map(Some),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection.as_str(), key],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Record>> {
        Ok(self
            .entries(collection)
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Record)>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM records WHERE collection = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![collection.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, value) = row?;
                entries.push((key, decode(value)?));
            }
            Ok(entries)
        })
        .await
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE collection = ?1",
                params![collection.as_str()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get_all_by_kind(&self, collection: Collection, kind: &str) -> Result<Vec<Record>> {
        let kind = kind.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT value FROM records WHERE collection = ?1 AND kind = ?2 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![collection.as_str(), kind], |row| {
                row.get::<_, String>(0)
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(decode(row?)?);
            }
            Ok(records)
        })
        .await
    }

    async fn delete_expired(&self, collection: Collection, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = expiry_nanos(now);
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                DELETE FROM records
                WHERE collection = ?1
                  AND expires_at_ns IS NOT NULL
                  AND expires_at_ns <= ?2
                "#,
                params![collection.as_str(), cutoff],
            )
        })
        .await
    }
}
