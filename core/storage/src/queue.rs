//! Durable queue of offline actions.
//!
//! Actions are persisted in the `pendingActions` collection keyed by their
//! id. The queue never interprets payloads; `kind` is used only to find the
//! handler that replays an action.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use lantern_common::{ActionId, Clock, Collection, Error, Result, SystemClock};
use crate::provider::DurableStore;

/// Retry ceiling applied when the caller does not supply one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    /// Unique, time-ordered identifier.
    pub id: ActionId,
    /// Tag naming the caller/operation that owns this action.
    pub kind: String,
    /// Opaque caller data.
    pub payload: String,
    /// When the action was queued.
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts that have been rescheduled so far.
    pub retry_count: u32,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
}

impl OfflineAction {
    /// Create a new action with no retries recorded.
    pub fn new(
        kind: impl Into<String>,
        payload: impl Into<String>,
        max_retries: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ActionId::generate(),
            kind: kind.into(),
            payload: payload.into(),
            enqueued_at,
            retry_count: 0,
            max_retries,
        }
    }

    /// Whether another retry fits under the ceiling.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Record one more scheduled retry.
    ///
    /// Returns `false` without changing the count when the ceiling has been
    /// reached; the caller must then drop the action.
    pub fn record_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }
        self.retry_count += 1;
        true
    }

    /// Decode the payload as JSON, for callers that stored JSON.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Queue of pending actions over a durable store.
#[derive(Clone)]
pub struct ActionQueue {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    default_max_retries: u32,
}

impl ActionQueue {
    /// Create a queue over `store`.
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Create a queue using the wall clock.
    pub fn with_system_clock(store: Arc<dyn DurableStore>) -> Self {
        Self::new(store, Arc::new(SystemClock))
    }

    /// Set the ceiling used when `enqueue` gets no explicit one.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Queue a new action and return its id.
    ///
    /// # Errors
    /// - `InvalidInput` if `kind` is empty
    /// - `StorageUnavailable` if the store rejects the write
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: impl Into<String>,
        max_retries: Option<u32>,
    ) -> Result<ActionId> {
        if kind.is_empty() {
            return Err(Error::InvalidInput("action kind cannot be empty".to_string()));
        }

        let action = OfflineAction::new(
            kind,
            payload,
            max_retries.unwrap_or(self.default_max_retries),
            self.clock.now(),
        );
        self.save(&action).await?;
        debug!(action_id = %action.id, kind, "Enqueued offline action");
        Ok(action.id)
    }

    /// Persist the current state of an action (insert or replace).
    pub async fn save(&self, action: &OfflineAction) -> Result<()> {
        self.store
            .put(
                Collection::PendingActions,
                action.id.as_str(),
                serde_json::to_value(action)?,
            )
            .await
    }

    /// Fetch a single action.
    pub async fn get(&self, id: &ActionId) -> Result<Option<OfflineAction>> {
        match self.store.get(Collection::PendingActions, id.as_str()).await? {
            Some(record) => Ok(Some(serde_json::from_value(record)?)),
            None => Ok(None),
        }
    }

    /// Whether the action is still queued.
    pub async fn contains(&self, id: &ActionId) -> Result<bool> {
        Ok(self
            .store
            .get(Collection::PendingActions, id.as_str())
            .await?
            .is_some())
    }

    /// Remove an action. Removing an absent action succeeds.
    pub async fn remove(&self, id: &ActionId) -> Result<()> {
        self.store
            .delete(Collection::PendingActions, id.as_str())
            .await
    }

    /// Snapshot of every queued action in FIFO order.
    pub async fn pending(&self) -> Result<Vec<OfflineAction>> {
        let records = self.store.get_all(Collection::PendingActions).await?;
        Ok(fifo(decode_all(records)))
    }

    /// Snapshot of queued actions of one kind in FIFO order.
    pub async fn pending_of_kind(&self, kind: &str) -> Result<Vec<OfflineAction>> {
        let records = self
            .store
            .get_all_by_kind(Collection::PendingActions, kind)
            .await?;
        Ok(fifo(decode_all(records)))
    }

    /// Number of queued actions.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.get_all(Collection::PendingActions).await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every queued action.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(Collection::PendingActions).await
    }
}

fn decode_all(records: Vec<serde_json::Value>) -> Vec<OfflineAction> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(action) => Some(action),
            Err(e) => {
                warn!("Skipping unreadable queued action: {}", e);
                None
            }
        })
        .collect()
}

fn fifo(mut actions: Vec<OfflineAction>) -> Vec<OfflineAction> {
    actions.sort_by(|a, b| {
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::sqlite::SqliteStore;
    use chrono::Duration;
    use lantern_common::ManualClock;
    use tempfile::TempDir;

    fn memory_queue() -> (ActionQueue, ManualClock) {
        let clock = ManualClock::default();
        let queue = ActionQueue::new(Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        (queue, clock)
    }

    #[test]
    fn test_record_retry_respects_ceiling() {
        let mut action = OfflineAction::new("k", "{}", 2, Utc::now());

        assert!(action.record_retry());
        assert!(action.record_retry());
        assert!(!action.record_retry());
        assert_eq!(action.retry_count, 2);
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (queue, _) = memory_queue();

        let id = queue.enqueue("mission_submission", "{\"x\":1}", None).await.unwrap();
        let action = queue.get(&id).await.unwrap().unwrap();

        assert_eq!(action.kind, "mission_submission");
        assert_eq!(action.retry_count, 0);
        assert_eq!(action.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(action.payload, "{\"x\":1}");
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_kind() {
        let (queue, _) = memory_queue();
        assert!(matches!(
            queue.enqueue("", "", None).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_is_fifo() {
        let (queue, clock) = memory_queue();

        let first = queue.enqueue("b_kind", "1", None).await.unwrap();
        clock.advance(Duration::milliseconds(5));
        let second = queue.enqueue("a_kind", "2", None).await.unwrap();
        clock.advance(Duration::milliseconds(5));
        let third = queue.enqueue("c_kind", "3", None).await.unwrap();

        let ids: Vec<ActionId> = queue.pending().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_same_instant_falls_back_to_id_order() {
        let (queue, _) = memory_queue();

        let first = queue.enqueue("k", "1", None).await.unwrap();
        let second = queue.enqueue("k", "2", None).await.unwrap();

        let ids: Vec<ActionId> = queue.pending().await.unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![first, second]);
    }

    #[tokio::test]
    async fn test_pending_of_kind() {
        let (queue, _) = memory_queue();

        queue.enqueue("error_log", "a", None).await.unwrap();
        queue.enqueue("mission_submission", "b", None).await.unwrap();

        let logs = queue.pending_of_kind("error_log").await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].payload, "a");
    }

    #[tokio::test]
    async fn test_save_and_remove() {
        let (queue, _) = memory_queue();

        let id = queue.enqueue("k", "p", Some(5)).await.unwrap();
        let mut action = queue.get(&id).await.unwrap().unwrap();
        action.record_retry();
        queue.save(&action).await.unwrap();

        assert_eq!(queue.get(&id).await.unwrap().unwrap().retry_count, 1);

        queue.remove(&id).await.unwrap();
        assert!(!queue.contains(&id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offline.db");

        let id = {
            let store = Arc::new(SqliteStore::new(&path));
            let queue = ActionQueue::with_system_clock(store.clone());
            let id = queue.enqueue("sync_test", "payload", Some(2)).await.unwrap();

            let mut action = queue.get(&id).await.unwrap().unwrap();
            action.record_retry();
            queue.save(&action).await.unwrap();

            store.close().await.unwrap();
            id
        };

        let queue = ActionQueue::with_system_clock(Arc::new(SqliteStore::new(&path)));
        let restored = queue.get(&id).await.unwrap().unwrap();

        assert_eq!(restored.retry_count, 1);
        assert_eq!(restored.max_retries, 2);
        assert_eq!(restored.payload, "payload");
    }
}
