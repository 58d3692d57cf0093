//! HTTP implementations of the connectivity probe and the replay handler.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use lantern_common::{Error, Result};
use lantern_storage::{OfflineAction, Preferences};
use lantern_sync::{ActionHandler, ConnectivityProbe};

const USER_AGENT: &str = concat!("lantern/", env!("CARGO_PKG_VERSION"));

/// Header carrying the action id so the server can drop duplicate replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))
}

/// Append one path segment to `base`.
fn join_segment(base: &Url, segment: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::Configuration(format!("'{}' cannot be used as a base URL", base)))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

/// Reports online when the health endpoint answers at all.
pub struct HttpProbe {
    http: Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(base: &Url, health_path: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            url: join_segment(base, health_path)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn is_online(&self) -> bool {
        match self.http.get(self.url.clone()).send().await {
            Ok(response) => {
                debug!(status = %response.status(), "Health probe answered");
                true
            }
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                false
            }
        }
    }
}

/// Replays an action by POSTing its payload to `<base>/<kind>`.
///
/// The stored credential, if any, is sent as a bearer token.
pub struct HttpReplayHandler {
    http: Client,
    base: Url,
    preferences: Preferences,
}

impl HttpReplayHandler {
    pub fn new(base: Url, preferences: Preferences, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_client(timeout)?,
            base,
            preferences,
        })
    }

    pub fn endpoint(&self, kind: &str) -> Result<Url> {
        join_segment(&self.base, kind)
    }
}

#[async_trait]
impl ActionHandler for HttpReplayHandler {
    async fn handle(&self, action: &OfflineAction) -> Result<()> {
        let url = self.endpoint(&action.kind)?;

        let mut request = self
            .http
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, action.id.as_str())
            .body(action.payload.clone());
        if let Some(token) = self.preferences.auth_token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to replay {}: {}", action.kind, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            Err(Error::Auth(format!("Invalid or expired token: {}", body)))
        } else {
            Err(Error::api(status.as_u16(), body))
        }
    }
}
