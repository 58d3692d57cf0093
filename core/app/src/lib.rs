//! Lantern offline core.
//!
//! The facade the UI and domain layers use to defer work, memoize data,
//! report failures and receive user notifications. See [`OfflineCore`].

pub mod config;
pub mod offline;
pub mod http;

pub use crate::config::{CoreConfig, PolicyOverride, CONFIG_FILENAME};
pub use crate::offline::{CoreBuilder, OfflineCore, Submission};
pub use crate::http::{HttpProbe, HttpReplayHandler, IDEMPOTENCY_HEADER};

pub use lantern_common::{ActionId, Error, ErrorKind, Result, Severity};
pub use lantern_sync::{
    handler_fn, ActionHandler, DrainReport, ErrorRecord, ErrorReport, NotificationStyle,
    RemedialAction, SyncMode, UserNotification,
};
