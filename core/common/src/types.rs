//! Common types used throughout the offline core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a queued offline action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(String);

impl ActionId {
    /// Generate a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Wrap an existing identifier.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ActionId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The independent collections held by a durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    /// Deferred work waiting for connectivity.
    PendingActions,
    /// Memoized responses with an expiry.
    CachedData,
    /// User preferences and the stored credential.
    Preferences,
}

impl Collection {
    /// All collections, in a stable order.
    pub const ALL: [Collection; 3] = [
        Collection::PendingActions,
        Collection::CachedData,
        Collection::Preferences,
    ];

    /// Stable name used in storage keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::PendingActions => "pendingActions",
            Collection::CachedData => "cachedData",
            Collection::Preferences => "preferences",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown collection: {}", s)))
    }
}

/// Taxonomy label of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Api,
    Validation,
    Runtime,
    Auth,
    Permission,
}

impl ErrorKind {
    /// All kinds, in a stable order.
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Network,
        ErrorKind::Api,
        ErrorKind::Validation,
        ErrorKind::Runtime,
        ErrorKind::Auth,
        ErrorKind::Permission,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Api => "api",
            ErrorKind::Validation => "validation",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        ErrorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown error kind: {}", s)))
    }
}

/// Severity of a classified error, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| crate::Error::InvalidInput(format!("Unknown severity: {}", s)))
    }
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Connected; queued work may be replayed.
    Online,
    /// Network unreachable; new work should prefer the queue.
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        *self == ConnectivityState::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_generation_is_ordered() {
        let a = ActionId::generate();
        let b = ActionId::generate();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_action_id_empty_fails() {
        assert!(ActionId::new("").is_err());
        assert_eq!(ActionId::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_collection_names_round_trip() {
        for collection in Collection::ALL {
            let parsed: Collection = collection.as_str().parse().unwrap();
            assert_eq!(parsed, collection);
        }
        assert!("nope".parse::<Collection>().is_err());
    }

    #[test]
    fn test_error_kind_serde_is_lowercase() {
        let json = serde_json::to_string(&ErrorKind::Permission).unwrap();
        assert_eq!(json, "\"permission\"");
        assert_eq!("api".parse::<ErrorKind>().unwrap(), ErrorKind::Api);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("severe".parse::<Severity>().is_err());
    }
}
