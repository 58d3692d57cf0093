//! User-facing notification events.
//!
//! The core never renders anything. It emits [`UserNotification`] values
//! through a [`Notifier`] and the embedding application decides how to show
//! them.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use lantern_common::{ErrorKind, Severity};

use crate::classifier::ErrorRecord;

/// Visual treatment requested for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStyle {
    Error,
    Warning,
    Info,
    Success,
}

/// Remedial action offered alongside a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemedialAction {
    Retry,
    WorkOffline,
    LogIn,
    GrantPermission,
    Reload,
}

impl RemedialAction {
    /// Button label for the action.
    pub fn label(&self) -> &'static str {
        match self {
            RemedialAction::Retry => "Retry",
            RemedialAction::WorkOffline => "Work Offline",
            RemedialAction::LogIn => "Log In",
            RemedialAction::GrantPermission => "Grant Permission",
            RemedialAction::Reload => "Reload",
        }
    }
}

/// A notification event for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotification {
    pub style: NotificationStyle,
    pub title: String,
    pub message: String,
    pub actions: Vec<RemedialAction>,
    /// Stays visible until dismissed.
    pub persistent: bool,
    /// Id of the error record that produced this notification, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

impl UserNotification {
    /// A transient success notice.
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            style: NotificationStyle::Success,
            title: title.into(),
            message: message.into(),
            actions: Vec::new(),
            persistent: false,
            error_id: None,
        }
    }

    /// A transient informational notice.
    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            style: NotificationStyle::Info,
            ..Self::success(title, message)
        }
    }
}

/// Whether an error record warrants a notification at all.
///
/// `show_to_user` is the caller's override: `Some(false)` always
/// suppresses, `Some(true)` requests a notification for kinds that are
/// otherwise quiet. Unset, the kind decides:
///
/// - validation errors are rendered inline by the caller and never surface
/// - auth and permission errors always surface, they need user action
/// - network and api errors surface once their retries are exhausted
/// - runtime faults surface from high severity up
///
/// Low-severity records other than auth and permission are only logged.
pub fn should_notify(record: &ErrorRecord, show_to_user: Option<bool>) -> bool {
    if show_to_user == Some(false) {
        return false;
    }
    let requested = show_to_user == Some(true);
    match record.kind() {
        ErrorKind::Validation => false,
        ErrorKind::Auth | ErrorKind::Permission => true,
        _ if record.severity() == Severity::Low => false,
        ErrorKind::Network | ErrorKind::Api => requested || record.retries_exhausted(),
        ErrorKind::Runtime => requested || record.severity() >= Severity::High,
    }
}

/// Map an error record to the notification shown for it.
pub fn notification_for(record: &ErrorRecord) -> UserNotification {
    let (style, title, message, actions) = match record.kind() {
        ErrorKind::Network => (
            NotificationStyle::Warning,
            "Connection Problem",
            "You appear to be offline. Changes will sync when the connection returns.".to_string(),
            vec![RemedialAction::Retry, RemedialAction::WorkOffline],
        ),
        ErrorKind::Api if mentions_session_expiry(&record.message) => (
            NotificationStyle::Warning,
            "Session Expired",
            "Your session has expired. Please log in again.".to_string(),
            vec![RemedialAction::LogIn],
        ),
        ErrorKind::Api => (
            NotificationStyle::Error,
            "Server Error",
            "The server could not complete the request. Please try again shortly.".to_string(),
            vec![RemedialAction::Retry],
        ),
        ErrorKind::Validation => (
            NotificationStyle::Warning,
            "Invalid Input",
            record.message.clone(),
            Vec::new(),
        ),
        ErrorKind::Auth => (
            NotificationStyle::Warning,
            "Authentication Required",
            "Please log in to continue.".to_string(),
            vec![RemedialAction::LogIn],
        ),
        ErrorKind::Permission => (
            NotificationStyle::Info,
            "Permission Needed",
            "This feature needs a permission that has not been granted.".to_string(),
            vec![RemedialAction::GrantPermission],
        ),
        ErrorKind::Runtime => (
            NotificationStyle::Error,
            "Unexpected Error",
            "Something went wrong. Reloading may help.".to_string(),
            vec![RemedialAction::Reload],
        ),
    };

    UserNotification {
        style,
        title: title.to_string(),
        message,
        actions,
        persistent: record.severity() == Severity::Critical,
        error_id: Some(record.id.clone()),
    }
}

fn mentions_session_expiry(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("session") || message.contains("expired")
}

/// Sink for notification events.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: UserNotification);
}

/// Fans notifications out to any number of subscribers.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<UserNotification>,
}

impl BroadcastNotifier {
    /// Create a notifier buffering up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, notification: UserNotification) {
        if self.sender.send(notification).is_err() {
            debug!("Notification dropped: no subscribers");
        }
    }
}

/// Keeps every notification in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<UserNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far, oldest first.
    pub fn notifications(&self) -> Vec<UserNotification> {
        self.seen.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: UserNotification) {
        self.seen.lock().unwrap().push(notification);
    }
}
