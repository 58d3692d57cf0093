//! Typed access to the `preferences` collection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use lantern_common::{Collection, Result};
use crate::provider::DurableStore;

/// Key under which the session credential is stored.
pub const AUTH_TOKEN_KEY: &str = "auth_token";

/// User preferences, including the stored session credential.
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn DurableStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Read a preference.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(Collection::Preferences, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Write a preference.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.store
            .put(Collection::Preferences, key, serde_json::to_value(value)?)
            .await
    }

    /// Remove a preference.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.store.delete(Collection::Preferences, key).await
    }

    pub async fn auth_token(&self) -> Result<Option<String>> {
        self.get(AUTH_TOKEN_KEY).await
    }

    pub async fn set_auth_token(&self, token: &str) -> Result<()> {
        self.set(AUTH_TOKEN_KEY, token).await
    }

    /// Forget the stored credential (session teardown).
    pub async fn clear_auth_token(&self) -> Result<()> {
        self.remove(AUTH_TOKEN_KEY).await
    }
}
