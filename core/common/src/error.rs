//! Common error types for the offline core.

use thiserror::Error;

use crate::types::{ErrorKind, Severity};

/// Top-level error type for offline core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The local storage medium is unavailable or full.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Connectivity or transport failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote endpoint answered with a failure status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Input rejected before any network call was made.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Session expired or credential invalid.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A device capability was denied.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Programming fault or unexpected condition.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided to the core itself.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Build an API error from a status code and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Taxonomy label this error is classified under when the caller gives no hint.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Api { .. } => ErrorKind::Api,
            Error::Validation(_) | Error::InvalidInput(_) => ErrorKind::Validation,
            Error::Auth(_) => ErrorKind::Auth,
            Error::Permission(_) => ErrorKind::Permission,
            Error::StorageUnavailable(_)
            | Error::Runtime(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::Configuration(_) => ErrorKind::Runtime,
        }
    }

    /// Severity assigned when the caller gives no hint.
    pub fn default_severity(&self) -> Severity {
        match self {
            Error::StorageUnavailable(_) | Error::Runtime(_) | Error::Auth(_) => Severity::High,
            Error::Network(_) | Error::Permission(_) | Error::Io(_) => Severity::Medium,
            Error::Api { status, .. } if *status >= 500 => Severity::High,
            Error::Api { .. } => Severity::Medium,
            Error::Validation(_) | Error::InvalidInput(_) | Error::NotFound(_) => Severity::Low,
            Error::Serialization(_) | Error::Configuration(_) => Severity::High,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
