//! Store registry for resolving a durable store backend by name.

use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use lantern_common::{Error, Result};
use crate::memory::MemoryStore;
use crate::provider::DurableStore;
use crate::sqlite::SqliteStore;

/// Factory function type for creating stores from JSON configuration.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn DurableStore>> + Send + Sync>;

/// Registry for durable store factories.
///
/// Allows the backend to be chosen from configuration at runtime.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Store backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by backend name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid for the backend
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn DurableStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Store backend '{}' is not registered", name))
        })?;
        factory(config)
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends.
///
/// - `memory`: no configuration
/// - `sqlite`: `{ "path": "<file>" }`, defaulting to [`SqliteStore::default_path`]
pub fn create_default_registry() -> StoreRegistry {
    let mut registry = StoreRegistry::new();

    registry.factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>)),
    );

    registry.factories.insert(
        "sqlite".to_string(),
        Box::new(|config| {
            let path = match config.get("path") {
                Some(Value::String(path)) => PathBuf::from(path),
                Some(Value::Null) | None => SqliteStore::default_path()?,
                Some(other) => {
                    return Err(Error::Configuration(format!(
                        "sqlite store 'path' must be a string, got {}",
                        other
                    )))
                }
            };
            Ok(Arc::new(SqliteStore::new(path)) as Arc<dyn DurableStore>)
        }),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>)))
            .unwrap();

        let store = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = create_default_registry();
        let result = registry.register("memory", Box::new(|_| Ok(Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>)));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = create_default_registry();
        assert!(registry.resolve("indexeddb", Value::Null).is_err());
    }

    #[test]
    fn test_default_backends() {
        let registry = create_default_registry();
        assert_eq!(registry.backends(), vec!["memory", "sqlite"]);

        let store = registry
            .resolve("sqlite", json!({ "path": "/tmp/lantern-test.db" }))
            .unwrap();
        assert_eq!(store.name(), "sqlite");
    }

    #[test]
    fn test_sqlite_rejects_bad_path_type() {
        let registry = create_default_registry();
        assert!(registry.resolve("sqlite", json!({ "path": 5 })).is_err());
    }
}
