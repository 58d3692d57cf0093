//! Offline sync for the Lantern core.
//!
//! This crate turns failures and queued work into eventual delivery:
//! - Error classification, persistence and user notification policy
//! - Per-kind retry policies with capped exponential backoff
//! - Connectivity tracking with reconnect notification
//! - Queue draining with retry timers and re-entrancy protection
//! - Background scheduling of probes and drains

pub mod capture;
pub mod classifier;
pub mod network;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;

// Re-export main types
pub use capture::install_panic_hook;
pub use classifier::{
    ErrorClassifier, ErrorContext, ErrorRecord, ErrorReport, Fault, DEFAULT_ERROR_LOG_RETENTION,
    ERROR_LOG_KIND,
};
pub use network::{ConnectivityProbe, ManualProbe, NetworkMonitor, ReconnectListener, Transition};
pub use notify::{
    notification_for, should_notify, BroadcastNotifier, NotificationStyle, Notifier,
    RecordingNotifier, RemedialAction, UserNotification,
};
pub use orchestrator::{
    handler_fn, invoke_handler, ActionHandler, DrainReport, DrainStatus, FnHandler, HandlerRegistry,
    SyncOrchestrator,
};
pub use retry::{RetryCondition, RetryPolicy, RetryPolicyEngine};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
