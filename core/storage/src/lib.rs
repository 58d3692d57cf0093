//! Durable local storage for the offline core.
//!
//! This module provides a trait-based interface for transactional key-value
//! stores with three independent collections, and the components built on
//! top of it: the pending-action queue, the TTL cache and typed preferences.
//!
//! # Design Principles
//! - Store isolation: components reach storage only through [`DurableStore`]
//! - Async operations: every read and write is awaited
//! - Lazy lifecycle: stores open themselves on first use
//! - Unified error semantics: write failures surface as `StorageUnavailable`

pub mod cache;
pub mod memory;
pub mod preferences;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod sqlite;

pub use cache::{CachedItem, TtlCache, DEFAULT_TTL_MINUTES};
pub use memory::MemoryStore;
pub use preferences::{Preferences, AUTH_TOKEN_KEY};
pub use provider::{DurableStore, Record};
pub use queue::{ActionQueue, OfflineAction, DEFAULT_MAX_RETRIES};
pub use registry::{create_default_registry, StoreFactory, StoreRegistry};
pub use sqlite::SqliteStore;
