//! Time-to-live cache over the durable store's `cachedData` collection.
//!
//! Staleness is checked on every read: an expired entry behaves as a miss and
//! is deleted on the spot. `cleanup_expired_cache` sweeps the whole
//! collection for callers that want to reclaim space proactively. There is no
//! size bound; callers that care about footprint should pick short TTLs.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use lantern_common::{Clock, Collection, Error, Result, SystemClock};
use crate::provider::DurableStore;

/// Default freshness window.
pub const DEFAULT_TTL_MINUTES: u32 = 60;

/// A memoized value with its freshness window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedItem {
    pub key: String,
    pub data: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedItem {
    /// Whether the item is stale at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// TTL cache backed by a durable store.
#[derive(Clone)]
pub struct TtlCache {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl TtlCache {
    /// Create a cache over `store` reading time from `clock`.
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create a cache using the wall clock.
    pub fn with_system_clock(store: Arc<dyn DurableStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    /// Store `data` under `key` for `ttl_minutes`, replacing any existing entry.
    pub async fn cache_data(&self, key: &str, data: Value, ttl_minutes: u32) -> Result<()> {
        self.cache_data_for(key, data, Duration::minutes(i64::from(ttl_minutes)))
            .await
    }

    /// Store `data` under `key` for an arbitrary TTL.
    pub async fn cache_data_for(&self, key: &str, data: Value, ttl: Duration) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("cache key cannot be empty".to_string()));
        }

        let stored_at = self.clock.now();
        let item = CachedItem {
            key: key.to_string(),
            data,
            stored_at,
            expires_at: stored_at + ttl,
        };

        self.store
            .put(Collection::CachedData, key, serde_json::to_value(&item)?)
            .await?;
        debug!(key, expires_at = %item.expires_at, "Cached data");
        Ok(())
    }

    /// Read the entry under `key`.
    ///
    /// Returns `None` for a missing key and for an expired one; in the
    /// latter case the stale entry is deleted before returning.
    pub async fn get_cached_data(&self, key: &str) -> Result<Option<Value>> {
        let Some(record) = self.store.get(Collection::CachedData, key).await? else {
            return Ok(None);
        };

        let item: CachedItem = match serde_json::from_value(record) {
            Ok(item) => item,
            Err(e) => {
                warn!(key, "Dropping unreadable cache entry: {}", e);
                self.store.delete(Collection::CachedData, key).await?;
                return Ok(None);
            }
        };

        if item.is_expired_at(self.clock.now()) {
            debug!(key, "Cache entry expired");
            self.store.delete(Collection::CachedData, key).await?;
            return Ok(None);
        }

        Ok(Some(item.data))
    }

    /// Read and deserialize the entry under `key`.
    pub async fn get_cached_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_cached_data(key).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Remove the entry under `key`, if any.
    pub async fn remove_cached_data(&self, key: &str) -> Result<()> {
        self.store.delete(Collection::CachedData, key).await
    }

    /// Delete every entry whose expiry is at or before now.
    ///
    /// Returns the number of entries removed.
    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        let removed = self
            .store
            .delete_expired(Collection::CachedData, self.clock.now())
            .await?;
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        Ok(removed)
    }

    /// Remove every cache entry regardless of freshness.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(Collection::CachedData).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::sqlite::SqliteStore;
    use lantern_common::ManualClock;
    use serde_json::json;

    fn setup() -> (TtlCache, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let cache = TtlCache::new(store.clone(), Arc::new(clock.clone()));
        (cache, store, clock)
    }

    #[tokio::test]
    async fn test_fresh_read_returns_data() {
        let (cache, _, _) = setup();

        cache.cache_data("k", json!({ "score": 7 }), 1).await.unwrap();

        let value = cache.get_cached_data("k").await.unwrap();
        assert_eq!(value, Some(json!({ "score": 7 })));
    }

    #[tokio::test]
    async fn test_expired_read_is_miss_and_evicts() {
        let (cache, store, clock) = setup();

        cache.cache_data("k", json!("v"), 1).await.unwrap();
        clock.advance(Duration::seconds(61));

        assert!(cache.get_cached_data("k").await.unwrap().is_none());
        assert!(store.get_all(Collection::CachedData).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_boundary_is_stale() {
        let (cache, _, clock) = setup();

        cache.cache_data("k", json!("v"), 1).await.unwrap();
        clock.advance(Duration::seconds(59));
        assert!(cache.get_cached_data("k").await.unwrap().is_some());

        clock.advance(Duration::seconds(1));
        assert!(cache.get_cached_data("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_resets_ttl() {
        let (cache, _, clock) = setup();

        cache.cache_data("k", json!(1), 1).await.unwrap();
        clock.advance(Duration::seconds(50));
        cache.cache_data("k", json!(2), 1).await.unwrap();
        clock.advance(Duration::seconds(50));

        assert_eq!(cache.get_cached_data("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_only_expired() {
        let (cache, store, clock) = setup();

        cache.cache_data("short", json!(1), 1).await.unwrap();
        cache.cache_data("long", json!(2), DEFAULT_TTL_MINUTES).await.unwrap();
        clock.advance(Duration::minutes(2));

        let removed = cache.cleanup_expired_cache().await.unwrap();

        assert_eq!(removed, 1);
        let remaining = store.get_all(Collection::CachedData).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["key"], json!("long"));
    }

    #[tokio::test]
    async fn test_cleanup_on_sqlite_uses_index() {
        let store = Arc::new(SqliteStore::in_memory());
        let clock = ManualClock::default();
        let cache = TtlCache::new(store.clone(), Arc::new(clock.clone()));

        cache.cache_data("a", json!(1), 1).await.unwrap();
        cache.cache_data("b", json!(2), 10).await.unwrap();
        clock.advance(Duration::minutes(5));

        assert_eq!(cache.cleanup_expired_cache().await.unwrap(), 1);
        assert_eq!(cache.get_cached_data("b").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_remove_and_typed_read() {
        let (cache, _, _) = setup();

        cache.cache_data("n", json!(42), 5).await.unwrap();
        assert_eq!(cache.get_cached_as::<u32>("n").await.unwrap(), Some(42));

        cache.remove_cached_data("n").await.unwrap();
        assert!(cache.get_cached_data("n").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (cache, _, _) = setup();
        assert!(cache.cache_data("", json!(1), 1).await.is_err());
    }
}
