//! In-memory durable store for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use lantern_common::{Collection, Error, Result};
use crate::provider::{DurableStore, Record};

type Collections = HashMap<Collection, BTreeMap<String, Record>>;

/// In-memory durable store.
///
/// Useful for testing and development. Data survives `close`/`open` cycles
/// for the lifetime of the value, which lets tests simulate a process
/// restart by building fresh components over the same store. Writes can be
/// made to fail with `StorageUnavailable` to exercise the full-disk path.
pub struct MemoryStore {
    storage: RwLock<Collections>,
    open: AtomicBool,
    available: AtomicBool,
    opens: AtomicUsize,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            storage: RwLock::new(HashMap::new()),
            open: AtomicBool::new(false),
            available: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
        }
    }

    /// Simulate the storage medium becoming unavailable (or available again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of times the store has been initialized.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) {
        if self
            .open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.opens.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StorageUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<()> {
        self.ensure_open();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, collection: Collection, key: &str, value: Record) -> Result<()> {
        self.ensure_open();
        self.check_writable()?;
        self.storage
            .write()
            .unwrap()
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Record>> {
        self.ensure_open();
        let storage = self.storage.read().unwrap();
        Ok(storage.get(&collection).and_then(|c| c.get(key)).cloned())
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<()> {
        self.ensure_open();
        self.check_writable()?;
        if let Some(records) = self.storage.write().unwrap().get_mut(&collection) {
            records.remove(key);
        }
        Ok(())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Record>> {
        self.ensure_open();
        let storage = self.storage.read().unwrap();
        Ok(storage
            .get(&collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn entries(&self, collection: Collection) -> Result<Vec<(String, Record)>> {
        self.ensure_open();
        let storage = self.storage.read().unwrap();
        Ok(storage
            .get(&collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.ensure_open();
        self.check_writable()?;
        self.storage.write().unwrap().remove(&collection);
        Ok(())
    }
}
