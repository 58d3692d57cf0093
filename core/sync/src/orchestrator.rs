//! Replay of queued actions.
//!
//! A drain takes a snapshot of the pending queue and invokes the registered
//! handler for each action, oldest first. Failures are either rescheduled
//! according to the retry policy for their error kind, or dropped and
//! reported once the ceiling is reached. Rescheduled actions are retried by
//! background tasks and skipped by later drains while their timer is armed.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use lantern_common::{ActionId, ConnectivityState, Error, Result, Severity};
use lantern_storage::{ActionQueue, OfflineAction};

use crate::classifier::{ErrorClassifier, ErrorReport, ERROR_LOG_KIND};
use crate::network::ReconnectListener;
use crate::notify::UserNotification;
use crate::retry::RetryPolicyEngine;

/// Replays one kind of action against the outside world.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &OfflineAction) -> Result<()>;
}

/// Handler built from an async closure over the payload.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, action: &OfflineAction) -> Result<()> {
        (self.f)(action.payload.clone()).await
    }
}

/// Wrap an async closure taking the action payload as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handlers keyed by action kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    fallback: RwLock<Option<Arc<dyn ActionHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let kind = kind.into();
        debug!(kind = %kind, "Registered action handler");
        self.handlers.write().unwrap().insert(kind, handler);
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.handlers.write().unwrap().remove(kind).is_some()
    }

    /// Handler used for kinds with no dedicated registration.
    pub fn set_fallback(&self, handler: Arc<dyn ActionHandler>) {
        *self.fallback.write().unwrap() = Some(handler);
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .unwrap()
            .get(kind)
            .cloned()
            .or_else(|| self.fallback.read().unwrap().clone())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.read().unwrap().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Why a drain did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Completed,
    AlreadyDraining,
    Offline,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub status: DrainStatus,
    /// Actions replayed successfully and removed.
    pub succeeded: usize,
    /// Actions that failed and have a retry timer armed.
    pub rescheduled: usize,
    /// Actions dropped after a non-retryable failure or the ceiling.
    pub abandoned: usize,
    /// Actions left queued because no handler knows their kind.
    pub unhandled: usize,
    /// Actions skipped because a retry timer already owns them.
    pub in_flight: usize,
    /// Actions left for later because connectivity dropped mid-drain.
    pub deferred: usize,
    /// Actions deleted elsewhere, e.g. by a data wipe, before or while they ran.
    pub vanished: usize,
}

impl DrainReport {
    fn with_status(status: DrainStatus) -> Self {
        Self {
            status,
            succeeded: 0,
            rescheduled: 0,
            abandoned: 0,
            unhandled: 0,
            in_flight: 0,
            deferred: 0,
            vanished: 0,
        }
    }

    pub fn ran(&self) -> bool {
        self.status == DrainStatus::Completed
    }

    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retry(_) => self.rescheduled += 1,
            Outcome::Abandoned => self.abandoned += 1,
            Outcome::Unhandled => self.unhandled += 1,
            Outcome::Vanished => self.vanished += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Retry(Duration),
    Abandoned,
    Unhandled,
    Vanished,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Inner {
    queue: ActionQueue,
    engine: Arc<RetryPolicyEngine>,
    classifier: Arc<ErrorClassifier>,
    handlers: Arc<HandlerRegistry>,
    connectivity: Option<watch::Receiver<ConnectivityState>>,
    draining: AtomicBool,
    scheduled: Mutex<HashSet<ActionId>>,
    retries: Mutex<JoinSet<()>>,
}

/// Drives queued actions to completion. Cheap to clone.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: ActionQueue,
        engine: Arc<RetryPolicyEngine>,
        classifier: Arc<ErrorClassifier>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self::build(queue, engine, classifier, handlers, None)
    }

    /// Like [`new`](Self::new), gating replay on `connectivity`.
    pub fn with_connectivity(
        queue: ActionQueue,
        engine: Arc<RetryPolicyEngine>,
        classifier: Arc<ErrorClassifier>,
        handlers: Arc<HandlerRegistry>,
        connectivity: watch::Receiver<ConnectivityState>,
    ) -> Self {
        Self::build(queue, engine, classifier, handlers, Some(connectivity))
    }

    fn build(
        queue: ActionQueue,
        engine: Arc<RetryPolicyEngine>,
        classifier: Arc<ErrorClassifier>,
        handlers: Arc<HandlerRegistry>,
        connectivity: Option<watch::Receiver<ConnectivityState>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                engine,
                classifier,
                handlers,
                connectivity,
                draining: AtomicBool::new(false),
                scheduled: Mutex::new(HashSet::new()),
                retries: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    /// Whether a drain pass is running right now.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Actions currently owned by a retry timer.
    pub fn scheduled_retries(&self) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self.inner.scheduled.lock().unwrap().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Replay every pending action once.
    ///
    /// A call made while another drain is running, or while offline,
    /// returns immediately without touching the queue.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the queue cannot be read or updated
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        if !inner.is_online() {
            debug!("Skipping drain while offline");
            return Ok(DrainReport::with_status(DrainStatus::Offline));
        }
        if inner.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress");
            return Ok(DrainReport::with_status(DrainStatus::AlreadyDraining));
        }
        let _guard = DrainGuard(&inner.draining);

        let snapshot = inner.queue.pending().await?;
        info!(pending = snapshot.len(), "Draining offline queue");

        let mut report = DrainReport::with_status(DrainStatus::Completed);
        let mut synced = 0;
        let total = snapshot.len();
        for (index, action) in snapshot.into_iter().enumerate() {
            if !inner.is_online() {
                report.deferred = total - index;
                info!(deferred = report.deferred, "Connectivity lost, stopping drain");
                break;
            }
            if inner.scheduled.lock().unwrap().contains(&action.id) {
                report.in_flight += 1;
                continue;
            }

            let Some(action) = inner.queue.get(&action.id).await? else {
                debug!(action_id = %action.id, "Action removed before its turn, skipping");
                report.record(Outcome::Vanished);
                continue;
            };

            let id = action.id.clone();
            let internal = action.kind == ERROR_LOG_KIND;
            let outcome = inner.attempt(action).await?;
            match outcome {
                Outcome::Retry(delay) => self.schedule_retry(id, delay),
                Outcome::Succeeded if !internal => synced += 1,
                _ => {}
            }
            report.record(outcome);
            tokio::task::yield_now().await;
        }

        info!(
            succeeded = report.succeeded,
            rescheduled = report.rescheduled,
            abandoned = report.abandoned,
            unhandled = report.unhandled,
            "Drain finished"
        );
        if synced > 0 {
            let noun = if synced == 1 { "item" } else { "items" };
            inner.classifier.notifier().notify(UserNotification::success(
                "Back in Sync",
                format!("{} offline {} synced", synced, noun),
            ));
        }

        Ok(report)
    }

    /// Wait until every armed retry timer has run to completion.
    pub async fn wait_idle(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.inner.retries.lock().unwrap());
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Retry task failed");
                }
            }
        }
    }

    fn schedule_retry(&self, id: ActionId, delay: Duration) {
        self.inner.scheduled.lock().unwrap().insert(id.clone());
        let inner = self.inner.clone();
        let mut tasks = self.inner.retries.lock().unwrap();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            inner.retry_loop(&id, delay).await;
            inner.scheduled.lock().unwrap().remove(&id);
        });
    }
}

impl Inner {
    fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map(|rx| rx.borrow().is_online())
            .unwrap_or(true)
    }

    async fn retry_loop(&self, id: &ActionId, mut delay: Duration) {
        loop {
            tokio::time::sleep(delay).await;

            if !self.is_online() {
                debug!(action_id = %id, "Offline when retry fired, leaving action queued");
                return;
            }
            let action = match self.queue.get(id).await {
                Ok(Some(action)) => action,
                Ok(None) => {
                    debug!(action_id = %id, "Action removed before its retry fired");
                    return;
                }
                Err(e) => {
                    error!(action_id = %id, error = %e, "Failed to load action for retry");
                    return;
                }
            };

            match self.attempt(action).await {
                Ok(Outcome::Retry(next)) => delay = next,
                Ok(_) => return,
                Err(e) => {
                    error!(action_id = %id, error = %e, "Retry attempt failed to update the queue");
                    return;
                }
            }
        }
    }

    async fn attempt(&self, action: OfflineAction) -> Result<Outcome> {
        let Some(handler) = self.handlers.resolve(&action.kind) else {
            if action.kind == ERROR_LOG_KIND {
                debug!(action_id = %action.id, "No uploader for error records, leaving queued");
            } else {
                warn!(action_id = %action.id, kind = %action.kind, "No handler registered, leaving action queued");
            }
            return Ok(Outcome::Unhandled);
        };

        match invoke_handler(handler.as_ref(), &action).await {
            Ok(()) => {
                self.queue.remove(&action.id).await?;
                debug!(action_id = %action.id, kind = %action.kind, "Action replayed");
                Ok(Outcome::Succeeded)
            }
            Err(err) => self.on_failure(action, err).await,
        }
    }

    async fn on_failure(&self, mut action: OfflineAction, err: Error) -> Result<Outcome> {
        let kind = err.kind();
        if !self.queue.contains(&action.id).await? {
            debug!(action_id = %action.id, error = %err, "Action removed while its handler ran, dropping failure");
            return Ok(Outcome::Vanished);
        }

        if action.can_retry() && self.engine.should_retry(kind, action.retry_count, &err) {
            let delay = self.engine.next_delay(kind, action.retry_count);
            action.record_retry();
            self.queue.save(&action).await?;
            warn!(
                action_id = %action.id,
                kind = %action.kind,
                attempt = action.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Action failed, retry scheduled"
            );
            return Ok(Outcome::Retry(delay));
        }

        self.queue.remove(&action.id).await?;
        warn!(
            action_id = %action.id,
            kind = %action.kind,
            retries = action.retry_count,
            error = %err,
            "Action abandoned"
        );

        let mut report = ErrorReport::new(err)
            .kind(kind)
            .severity(Severity::High)
            .show_to_user(true)
            .persistent(true)
            .context("actionId", action.id.as_str())
            .context("actionKind", action.kind.as_str())
            .retries(action.retry_count, action.max_retries);
        if action.kind == ERROR_LOG_KIND {
            report = report.skip_persist();
        }
        self.classifier.report(report).await;

        Ok(Outcome::Abandoned)
    }
}

/// Run `handler` on `action`, turning a panic into a runtime error.
pub async fn invoke_handler(handler: &dyn ActionHandler, action: &OfflineAction) -> Result<()> {
    AssertUnwindSafe(handler.handle(action))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(Error::Runtime(panic_message(panic.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[async_trait]
impl ReconnectListener for SyncOrchestrator {
    async fn on_reconnect(&self) {
        if let Err(e) = self.drain_queue().await {
            error!(error = %e, "Reconnect drain failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkMonitor;
    use crate::notify::{NotificationStyle, RecordingNotifier};
    use crate::retry::RetryPolicy;
    use lantern_common::{ErrorKind, ManualClock};
    use lantern_storage::{DurableStore, MemoryStore, Preferences};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Harness {
        orchestrator: SyncOrchestrator,
        queue: ActionQueue,
        notifier: Arc<RecordingNotifier>,
        engine: Arc<RetryPolicyEngine>,
    }

    fn harness_with(connectivity: Option<watch::Receiver<ConnectivityState>>) -> Harness {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = ActionQueue::new(store.clone(), clock.clone());
        let notifier = Arc::new(RecordingNotifier::new());
        let classifier = Arc::new(ErrorClassifier::new(
            queue.clone(),
            Preferences::new(store),
            notifier.clone(),
            clock,
        ));
        let engine = Arc::new(RetryPolicyEngine::uniform(RetryPolicy::immediate(5)));
        let handlers = Arc::new(HandlerRegistry::new());
        let orchestrator = SyncOrchestrator::build(
            queue.clone(),
            engine.clone(),
            classifier,
            handlers,
            connectivity,
        );
        Harness {
            orchestrator,
            queue,
            notifier,
            engine,
        }
    }

    fn harness() -> Harness {
        harness_with(None)
    }

    /// Handler failing the first `failures` calls for every payload.
    fn flaky(failures: usize, calls: Arc<Mutex<HashMap<String, usize>>>) -> Arc<dyn ActionHandler> {
        handler_fn(move |payload: String| {
            let calls = calls.clone();
            async move {
                let count = {
                    let mut calls = calls.lock().unwrap();
                    let count = calls.entry(payload).or_insert(0);
                    *count += 1;
                    *count
                };
                if count <= failures {
                    Err(Error::Network("connection reset".into()))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn test_successful_actions_are_removed_in_order() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        h.orchestrator.handlers().register(
            "note",
            handler_fn(move |payload: String| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(payload);
                    Ok(())
                }
            }),
        );
        for payload in ["a", "b", "c"] {
            h.queue.enqueue("note", payload, None).await.unwrap();
        }

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(h.queue.is_empty().await.unwrap());
        assert_eq!(h.notifier.notifications()[0].style, NotificationStyle::Success);
    }

    #[tokio::test]
    async fn test_failing_action_retried_until_success() {
        let h = harness();
        let calls = Arc::new(Mutex::new(HashMap::new()));
        h.orchestrator.handlers().register("sync", flaky(2, calls.clone()));
        h.queue.enqueue("sync", "x", Some(2)).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        h.orchestrator.wait_idle().await;

        assert_eq!(calls.lock().unwrap()["x"], 3);
        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.orchestrator.scheduled_retries().is_empty());
    }

    #[tokio::test]
    async fn test_action_abandoned_after_ceiling() {
        let h = harness();
        let calls = Arc::new(Mutex::new(HashMap::new()));
        h.orchestrator.handlers().register("sync", flaky(usize::MAX, calls.clone()));
        h.queue.enqueue("sync", "x", Some(2)).await.unwrap();

        h.orchestrator.drain_queue().await.unwrap();
        h.orchestrator.wait_idle().await;

        assert_eq!(calls.lock().unwrap()["x"], 3);
        assert!(h.queue.pending_of_kind("sync").await.unwrap().is_empty());

        let seen = h.notifier.notifications();
        let failure = seen.iter().find(|n| n.title == "Connection Problem").unwrap();
        assert!(failure.persistent);
        assert_eq!(h.queue.pending_of_kind(ERROR_LOG_KIND).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_abandoned_immediately() {
        let h = harness();
        h.engine.register(ErrorKind::Validation, RetryPolicy::never());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        h.orchestrator.handlers().register(
            "form",
            handler_fn(move |_| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Validation("missing name".into()))
                }
            }),
        );
        h.queue.enqueue("form", "{}", Some(3)).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.abandoned, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.queue.pending_of_kind("form").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_kind_stays_queued() {
        let h = harness();
        let id = h.queue.enqueue("mystery", "?", None).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.unhandled, 1);
        assert!(h.queue.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_handler() {
        let h = harness();
        h.orchestrator
            .handlers()
            .set_fallback(handler_fn(|_| async { Ok(()) }));
        h.queue.enqueue("anything", "?", None).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let h = harness();
        h.engine.register_all(RetryPolicy::never());
        h.orchestrator.handlers().register(
            "explode",
            handler_fn(|payload: String| async move {
                if payload == "boom" {
                    panic!("handler exploded");
                }
                Ok(())
            }),
        );
        h.queue.enqueue("explode", "boom", None).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.abandoned, 1);
        let logged = h.queue.pending_of_kind(ERROR_LOG_KIND).await.unwrap();
        assert!(logged[0].payload.contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_noop() {
        let h = harness();
        let release = Arc::new(Notify::new());
        let release_clone = release.clone();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        h.orchestrator.handlers().register(
            "slow",
            handler_fn(move |_| {
                let release = release_clone.clone();
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            }),
        );
        h.queue.enqueue("slow", "1", None).await.unwrap();

        let first = h.orchestrator.drain_queue();
        let second = async {
            tokio::task::yield_now().await;
            let report = h.orchestrator.drain_queue().await.unwrap();
            release.notify_one();
            report
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().succeeded, 1);
        assert_eq!(second.status, DrainStatus::AlreadyDraining);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!h.orchestrator.is_draining());
    }

    #[tokio::test]
    async fn test_drain_is_noop_offline() {
        let monitor = NetworkMonitor::new(ConnectivityState::Offline);
        let h = harness_with(Some(monitor.subscribe()));
        h.orchestrator
            .handlers()
            .register("note", handler_fn(|_| async { Ok(()) }));
        h.queue.enqueue("note", "x", None).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.status, DrainStatus::Offline);
        assert_eq!(h.queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_stops_drain() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = ActionQueue::new(store.clone(), clock.clone());
        let classifier = Arc::new(ErrorClassifier::new(
            queue.clone(),
            Preferences::new(store.clone()),
            Arc::new(RecordingNotifier::new()),
            clock,
        ));
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register("note", handler_fn(|_| async { Ok(()) }));
        let orchestrator = SyncOrchestrator::new(
            queue.clone(),
            Arc::new(RetryPolicyEngine::new()),
            classifier,
            handlers,
        );
        queue.enqueue("note", "x", None).await.unwrap();
        store.set_available(false);

        let result = orchestrator.drain_queue().await;

        assert!(matches!(result, Err(Error::StorageUnavailable(_))));
        assert!(!orchestrator.is_draining());
    }

    #[tokio::test]
    async fn test_reconnect_triggers_drain() {
        let monitor = NetworkMonitor::new(ConnectivityState::Offline);
        let h = harness_with(Some(monitor.subscribe()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        h.orchestrator.handlers().register(
            "note",
            handler_fn(move |_| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        monitor.set_listener(Arc::new(h.orchestrator.clone()));
        h.queue.enqueue("note", "x", None).await.unwrap();

        monitor.handle_event(true).await;
        monitor.handle_event(true).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_firing_offline_leaves_action_queued() {
        let monitor = NetworkMonitor::new(ConnectivityState::Online);
        let h = harness_with(Some(monitor.subscribe()));
        h.engine.register_all(
            RetryPolicy::new(3)
                .with_base_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(5)),
        );
        let calls = Arc::new(Mutex::new(HashMap::new()));
        h.orchestrator.handlers().register("sync", flaky(1, calls.clone()));
        let id = h.queue.enqueue("sync", "x", None).await.unwrap();

        h.orchestrator.drain_queue().await.unwrap();
        assert_eq!(h.orchestrator.scheduled_retries(), vec![id.clone()]);

        monitor.handle_event(false).await;
        h.orchestrator.wait_idle().await;

        assert_eq!(calls.lock().unwrap()["x"], 1);
        let action = h.queue.get(&id).await.unwrap().unwrap();
        assert_eq!(action.retry_count, 1);
        assert!(h.orchestrator.scheduled_retries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_skips_actions_with_armed_timer() {
        let h = harness();
        h.engine.register_all(
            RetryPolicy::new(3)
                .with_base_delay(Duration::from_secs(30))
                .with_max_delay(Duration::from_secs(30)),
        );
        let calls = Arc::new(Mutex::new(HashMap::new()));
        h.orchestrator.handlers().register("sync", flaky(1, calls.clone()));
        h.queue.enqueue("sync", "x", None).await.unwrap();

        h.orchestrator.drain_queue().await.unwrap();
        let second = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(second.in_flight, 1);
        assert_eq!(calls.lock().unwrap()["x"], 1);

        h.orchestrator.wait_idle().await;
        assert_eq!(calls.lock().unwrap()["x"], 2);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_actions_cleared_mid_drain_are_neither_replayed_nor_restored() {
        let h = harness();
        let release = Arc::new(Notify::new());
        let release_clone = release.clone();
        h.orchestrator.handlers().register(
            "slow",
            handler_fn(move |_| {
                let release = release_clone.clone();
                async move {
                    release.notified().await;
                    Err(Error::Network("timed out".into()))
                }
            }),
        );
        let later_calls = Arc::new(AtomicUsize::new(0));
        let later_clone = later_calls.clone();
        h.orchestrator.handlers().register(
            "later",
            handler_fn(move |_| {
                let calls = later_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Network("connection reset".into()))
                }
            }),
        );
        h.queue.enqueue("slow", "1", None).await.unwrap();
        h.queue.enqueue("later", "2", None).await.unwrap();

        let drain = h.orchestrator.drain_queue();
        let wipe = async {
            tokio::task::yield_now().await;
            h.queue.clear().await.unwrap();
            release.notify_one();
        };
        let (report, ()) = tokio::join!(drain, wipe);
        let report = report.unwrap();
        h.orchestrator.wait_idle().await;

        assert_eq!(report.vanished, 2);
        assert_eq!(report.rescheduled, 0);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.orchestrator.scheduled_retries().is_empty());
    }

    #[tokio::test]
    async fn test_error_log_uploads_do_not_announce_sync() {
        let h = harness();
        h.orchestrator
            .handlers()
            .register(ERROR_LOG_KIND, handler_fn(|_| async { Ok(()) }));
        h.queue.enqueue(ERROR_LOG_KIND, "{}", None).await.unwrap();

        let report = h.orchestrator.drain_queue().await.unwrap();

        assert_eq!(report.succeeded, 1);
        assert!(h.notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_handler_catches_panics() {
        let handler = handler_fn(|payload: String| async move {
            if payload.is_empty() {
                panic!("kaboom");
            }
            Ok(())
        });
        let action = OfflineAction::new("boom", "", 0, chrono::Utc::now());

        let result = invoke_handler(handler.as_ref(), &action).await;

        match result {
            Err(Error::Runtime(message)) => assert!(message.contains("kaboom")),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
