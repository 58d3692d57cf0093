//! Durable store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use lantern_common::{Collection, Result};

/// A stored document.
///
/// Records are JSON documents. Two top-level fields are recognized by stores
/// that keep secondary indexes: `kind` (string) and `expiresAt` (RFC 3339
/// timestamp). All other fields are opaque to the store.
pub type Record = Value;

/// Field name indexed for dispatch by kind.
pub const KIND_FIELD: &str = "kind";

/// Field name indexed for expiry sweeps.
pub const EXPIRES_AT_FIELD: &str = "expiresAt";

/// Persistent, transactional key-value store with independent collections.
///
/// Every operation is atomic on its own: a failed call leaves no partial
/// write visible. Implementations open themselves lazily on first use and
/// must tolerate concurrent first calls (initialization runs exactly once).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Get the store backend name (e.g., "sqlite", "memory").
    fn name(&self) -> &str;

    /// Open the store.
    ///
    /// Idempotent: calling it on an open store is a no-op. Other operations
    /// call it implicitly.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the medium cannot be opened
    async fn open(&self) -> Result<()>;

    /// Release the underlying medium. A later call reopens it.
    async fn close(&self) -> Result<()>;

    /// Insert or replace the record stored under `key`.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the medium is unavailable or full
    async fn put(&self, collection: Collection, key: &str, value: Record) -> Result<()>;

    /// Fetch the record stored under `key`.
    ///
    /// A missing key is `Ok(None)`, never an error.
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Record>>;

    /// Remove the record stored under `key`. Removing a missing key succeeds.
    async fn delete(&self, collection: Collection, key: &str) -> Result<()>;

    /// All records of a collection, ordered by key.
    async fn get_all(&self, collection: Collection) -> Result<Vec<Record>>;

    /// All `(key, record)` pairs of a collection, ordered by key.
    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Record)>>;

    /// Remove every record of a collection.
    async fn clear(&self, collection: Collection) -> Result<()>;

    /// Records whose `kind` field equals `kind`, ordered by key.
    async fn get_all_by_kind(&self, collection: Collection, kind: &str) -> Result<Vec<Record>> {
        let records = self.get_all(collection).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.get(KIND_FIELD).and_then(Value::as_str) == Some(kind))
            .collect())
    }

    /// Remove every record whose `expiresAt` is at or before `now`.
    ///
    /// Returns the number of records removed. Records without an `expiresAt`
    /// field never expire.
    async fn delete_expired(&self, collection: Collection, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for (key, record) in self.entries(collection).await? {
            if let Some(expires_at) = expiry_of(&record) {
                if expires_at <= now {
                    self.delete(collection, &key).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Extract the indexed expiry timestamp of a record, if present and valid.
pub fn expiry_of(record: &Record) -> Option<DateTime<Utc>> {
    record
        .get(EXPIRES_AT_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Extract the indexed kind of a record, if present.
pub fn kind_of(record: &Record) -> Option<&str> {
    record.get(KIND_FIELD).and_then(Value::as_str)
}
