//! Core configuration file.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use lantern_common::{Error, ErrorKind, Result};
use lantern_storage::{DEFAULT_MAX_RETRIES, DEFAULT_TTL_MINUTES};
use lantern_sync::{RetryPolicy, RetryPolicyEngine, DEFAULT_ERROR_LOG_RETENTION};

/// Configuration file name inside the config directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Partial retry policy; unset fields keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
}

impl PolicyOverride {
    /// Apply the set fields on top of `policy`.
    pub fn apply(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(max_retries) = self.max_retries {
            policy.max_retries = max_retries;
        }
        if let Some(ms) = self.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        if let Some(jitter) = self.jitter {
            policy.jitter = jitter;
        }
        policy
    }
}

/// Settings for building an [`OfflineCore`](crate::OfflineCore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Store backend name (`"sqlite"` or `"memory"`).
    pub store: String,
    /// Database file for the sqlite backend. `None` uses the platform data dir.
    pub database_path: Option<PathBuf>,
    /// Base URL actions are replayed against.
    pub api_base_url: Option<String>,
    /// Path probed for reachability, relative to `api_base_url`.
    pub health_path: String,
    pub default_max_retries: u32,
    pub default_ttl_minutes: u32,
    pub probe_interval_secs: u64,
    /// Location recorded in error contexts.
    pub app_url: String,
    pub notification_capacity: usize,
    /// Queued error records kept before the oldest are dropped.
    pub error_log_retention: usize,
    /// Per-kind retry policy overrides.
    pub policies: HashMap<ErrorKind, PolicyOverride>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            store: "sqlite".to_string(),
            database_path: None,
            api_base_url: None,
            health_path: "health".to_string(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            probe_interval_secs: 30,
            app_url: "app://".to_string(),
            notification_capacity: 64,
            error_log_retention: DEFAULT_ERROR_LOG_RETENTION,
            policies: HashMap::new(),
        }
    }
}

impl CoreConfig {
    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("lantern").join(CONFIG_FILENAME))
            .ok_or_else(|| Error::Configuration("no config directory on this platform".to_string()))
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write configuration to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Configuration(format!("invalid config: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON handed to the store factory.
    pub fn store_config(&self) -> Value {
        match &self.database_path {
            Some(path) => json!({ "path": path.to_string_lossy() }),
            None => Value::Null,
        }
    }

    /// Parsed API base URL, if configured.
    pub fn api_base(&self) -> Result<Option<Url>> {
        self.api_base_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| Error::Configuration(format!("invalid api_base_url '{}': {}", raw, e)))
            })
            .transpose()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Install the configured overrides into `engine`.
    pub fn apply_policies(&self, engine: &RetryPolicyEngine) {
        for (kind, overrides) in &self.policies {
            engine.register(*kind, overrides.apply(engine.policy(*kind)));
        }
    }
}
