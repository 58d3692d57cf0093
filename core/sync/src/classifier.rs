//! Error classification, persistence and notification policy.
//!
//! Every failure the core sees, from handler errors to captured panics, is
//! turned into an [`ErrorRecord`] here. The record is logged, persisted as
//! an `error_log` action for later upload and, depending on kind and
//! severity, surfaced to the user.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lantern_common::{Clock, Error, ErrorKind, Result, Severity};
use lantern_storage::{ActionQueue, Preferences};

use crate::notify::{notification_for, should_notify, Notifier};

/// Action kind under which error records are queued for upload.
pub const ERROR_LOG_KIND: &str = "error_log";

/// Queued error records kept before the oldest are dropped.
pub const DEFAULT_ERROR_LOG_RETENTION: usize = 100;

const RESERVED_CONTEXT_KEYS: [&str; 4] = ["url", "timestamp", "sessionId", "userAgent"];

/// Environment captured with every error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    /// Logical location (route or endpoint) active when the error happened.
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub user_agent: String,
    /// Caller-supplied fields. Never contains the automatic keys above.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ErrorContext {
    pub fn new(url: impl Into<String>, timestamp: DateTime<Utc>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timestamp,
            session_id: session_id.into(),
            user_agent: user_agent(),
            extra: BTreeMap::new(),
        }
    }

    /// Merge caller fields. Keys naming an automatic field are dropped.
    pub fn merge(&mut self, fields: BTreeMap<String, Value>) {
        for (key, value) in fields {
            if RESERVED_CONTEXT_KEYS.contains(&key.as_str()) {
                debug!(key, "Ignoring context field that shadows an automatic one");
                continue;
            }
            self.extra.insert(key, value);
        }
    }
}

fn user_agent() -> String {
    format!(
        "lantern/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// A classified failure.
///
/// Kind and severity are fixed at creation. Retry bookkeeping and the
/// resolved flag may change afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub id: String,
    kind: ErrorKind,
    severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub context: ErrorContext,
    pub resolved: bool,
    pub user_notified: bool,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl ErrorRecord {
    pub fn new(
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        stack_trace: Option<String>,
        context: ErrorContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            severity,
            message: message.into(),
            stack_trace,
            context,
            resolved: false,
            user_notified: false,
            retry_count: 0,
            max_retries: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn mark_resolved(&mut self) {
        self.resolved = true;
    }

    /// Whether the failed work used up its retry allowance.
    pub fn retries_exhausted(&self) -> bool {
        self.max_retries
            .is_some_and(|max_retries| self.retry_count >= max_retries)
    }
}

/// Raw failure handed to the classifier.
#[derive(Debug)]
pub enum Fault {
    /// A typed error from the core or a handler.
    Error(Error),
    /// A bare message with no structure.
    Message(String),
    /// A captured panic.
    Panic {
        message: String,
        location: Option<String>,
        backtrace: Option<String>,
    },
}

impl Fault {
    pub fn message(&self) -> String {
        match self {
            Fault::Error(err) => err.to_string(),
            Fault::Message(message) => message.clone(),
            Fault::Panic { message, .. } => message.clone(),
        }
    }

    fn stack_trace(&self) -> Option<String> {
        match self {
            Fault::Panic {
                location,
                backtrace,
                ..
            } => match (location, backtrace) {
                (Some(location), Some(backtrace)) => Some(format!("at {location}\n{backtrace}")),
                (Some(location), None) => Some(format!("at {location}")),
                (None, backtrace) => backtrace.clone(),
            },
            _ => None,
        }
    }

    fn inferred_kind(&self) -> ErrorKind {
        match self {
            Fault::Error(err) => err.kind(),
            _ => ErrorKind::Runtime,
        }
    }

    fn inferred_severity(&self) -> Severity {
        match self {
            Fault::Error(err) => err.default_severity(),
            Fault::Message(_) => Severity::Medium,
            Fault::Panic { .. } => Severity::High,
        }
    }
}

impl From<Error> for Fault {
    fn from(err: Error) -> Self {
        Fault::Error(err)
    }
}

impl From<String> for Fault {
    fn from(message: String) -> Self {
        Fault::Message(message)
    }
}

impl From<&str> for Fault {
    fn from(message: &str) -> Self {
        Fault::Message(message.to_string())
    }
}

/// Everything the classifier needs to know about one failure.
#[derive(Debug)]
pub struct ErrorReport {
    fault: Fault,
    kind: Option<ErrorKind>,
    severity: Option<Severity>,
    context: BTreeMap<String, Value>,
    show_to_user: Option<bool>,
    persistent: bool,
    persist: bool,
    retry_count: u32,
    max_retries: Option<u32>,
}

impl ErrorReport {
    pub fn new(fault: impl Into<Fault>) -> Self {
        Self {
            fault: fault.into(),
            kind: None,
            severity: None,
            context: BTreeMap::new(),
            show_to_user: None,
            persistent: false,
            persist: true,
            retry_count: 0,
            max_retries: None,
        }
    }

    /// Override the inferred kind.
    pub fn kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Override the inferred severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Attach one caller context field.
    pub fn context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach several caller context fields.
    pub fn context_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.context.extend(fields);
        self
    }

    /// Request (`true`) or suppress (`false`) the notification. Unset, the
    /// kind's default applies.
    pub fn show_to_user(mut self, show: bool) -> Self {
        self.show_to_user = Some(show);
        self
    }

    /// Ask for a notification that stays until dismissed.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Skip queueing the record for upload.
    pub fn skip_persist(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = Some(max_retries);
        self
    }
}

/// Classifies failures, records them and decides what the user sees.
pub struct ErrorClassifier {
    queue: ActionQueue,
    preferences: Preferences,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    session_id: String,
    location: RwLock<String>,
    log_retention: usize,
}

impl ErrorClassifier {
    pub fn new(
        queue: ActionQueue,
        preferences: Preferences,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session_id = format!(
            "session_{}_{}",
            clock.now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            queue,
            preferences,
            notifier,
            clock,
            session_id,
            location: RwLock::new(String::from("app://")),
            log_retention: DEFAULT_ERROR_LOG_RETENTION,
        }
    }

    /// Keep at most `max` queued error records, dropping the oldest.
    pub fn with_log_retention(mut self, max: usize) -> Self {
        self.log_retention = max;
        self
    }

    /// Set the location recorded in every subsequent error context.
    pub fn set_location(&self, url: impl Into<String>) {
        *self.location.write().unwrap() = url.into();
    }

    pub fn location(&self) -> String {
        self.location.read().unwrap().clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    /// Classify, log, persist and possibly surface a failure.
    ///
    /// Persistence and credential teardown failures are logged and never
    /// propagated: reporting an error must not fail.
    pub async fn report(&self, report: ErrorReport) -> ErrorRecord {
        let kind = report.kind.unwrap_or_else(|| report.fault.inferred_kind());
        let severity = report
            .severity
            .unwrap_or_else(|| report.fault.inferred_severity());

        let mut context = ErrorContext::new(self.location(), self.clock.now(), self.session_id.clone());
        context.merge(report.context);

        let mut record = ErrorRecord::new(
            kind,
            severity,
            report.fault.message(),
            report.fault.stack_trace(),
            context,
        );
        record.retry_count = report.retry_count;
        record.max_retries = report.max_retries;

        log_record(&record);

        if kind == ErrorKind::Auth {
            if let Err(e) = self.preferences.clear_auth_token().await {
                error!(error = %e, "Failed to clear stored credential");
            } else {
                info!("Stored credential cleared after authentication failure");
            }
        }

        if should_notify(&record, report.show_to_user) {
            let mut notification = notification_for(&record);
            notification.persistent |= report.persistent;
            record.user_notified = true;
            self.notifier.notify(notification);
        }

        if report.persist {
            self.persist(&record).await;
        }

        record
    }

    /// Report a failure with explicit hints.
    pub async fn report_error(
        &self,
        fault: impl Into<Fault>,
        kind: Option<ErrorKind>,
        severity: Option<Severity>,
        context: BTreeMap<String, Value>,
        show_to_user: Option<bool>,
    ) -> ErrorRecord {
        let mut report = ErrorReport::new(fault).context_fields(context);
        report.show_to_user = show_to_user;
        report.kind = kind;
        report.severity = severity;
        self.report(report).await
    }

    async fn persist(&self, record: &ErrorRecord) {
        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, error_id = %record.id, "Failed to encode error record");
                return;
            }
        };
        if let Err(e) = self.queue.enqueue(ERROR_LOG_KIND, payload, None).await {
            error!(error = %e, error_id = %record.id, "Failed to queue error record");
            return;
        }
        if let Err(e) = self.prune_logs().await {
            warn!(error = %e, "Failed to prune queued error records");
        }
    }

    async fn prune_logs(&self) -> Result<()> {
        let logs = self.queue.pending_of_kind(ERROR_LOG_KIND).await?;
        let excess = logs.len().saturating_sub(self.log_retention);
        for action in &logs[..excess] {
            self.queue.remove(&action.id).await?;
        }
        if excess > 0 {
            debug!(dropped = excess, "Dropped oldest queued error records");
        }
        Ok(())
    }
}

fn log_record(record: &ErrorRecord) {
    let kind = record.kind().as_str();
    match record.severity() {
        Severity::Critical | Severity::High => error!(
            error_id = %record.id,
            kind,
            severity = ?record.severity(),
            "{}",
            record.message
        ),
        Severity::Medium => warn!(error_id = %record.id, kind, "{}", record.message),
        Severity::Low => debug!(error_id = %record.id, kind, "{}", record.message),
    }
}
