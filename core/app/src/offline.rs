//! The offline core facade.
//!
//! [`OfflineCore`] wires the store, queue, cache, classifier, retry engine,
//! network monitor and orchestrator together and exposes the surface the
//! UI and domain layers call.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lantern_common::{
    ActionId, Clock, Collection, ConnectivityState, ErrorKind, Result, Severity, SystemClock,
};
use lantern_storage::{
    create_default_registry, ActionQueue, DurableStore, OfflineAction, Preferences, TtlCache,
    DEFAULT_MAX_RETRIES, DEFAULT_TTL_MINUTES,
};
use lantern_sync::{
    install_panic_hook, invoke_handler, ActionHandler, BroadcastNotifier, ConnectivityProbe, DrainReport,
    ErrorClassifier, ErrorRecord, ErrorReport, Fault, HandlerRegistry, NetworkMonitor,
    RetryPolicyEngine, SyncMode, SyncOrchestrator, SyncScheduler, Transition, UserNotification,
    DEFAULT_ERROR_LOG_RETENTION,
};

use crate::config::CoreConfig;
use crate::http::{HttpProbe, HttpReplayHandler};

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of [`OfflineCore::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The handler ran and succeeded immediately.
    Completed,
    /// The work was queued for replay.
    Queued(ActionId),
}

/// Builder for [`OfflineCore`].
pub struct CoreBuilder {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    engine: Option<Arc<RetryPolicyEngine>>,
    fallback: Option<Arc<dyn ActionHandler>>,
    default_max_retries: u32,
    default_ttl_minutes: u32,
    app_url: String,
    notification_capacity: usize,
    error_log_retention: usize,
}

impl CoreBuilder {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            probe: None,
            engine: None,
            fallback: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
            app_url: "app://".to_string(),
            notification_capacity: 64,
            error_log_retention: DEFAULT_ERROR_LOG_RETENTION,
        }
    }

    /// Builder for a configuration file.
    ///
    /// Resolves the store backend and, when an API base URL is set, installs
    /// an HTTP probe and an HTTP replay handler as the fallback for every
    /// action kind.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let registry = create_default_registry();
        let store = registry.resolve(&config.store, config.store_config())?;

        let engine = RetryPolicyEngine::new();
        config.apply_policies(&engine);

        let mut builder = Self::new(store.clone())
            .retry_engine(Arc::new(engine))
            .default_max_retries(config.default_max_retries)
            .default_ttl_minutes(config.default_ttl_minutes)
            .app_url(config.app_url.clone())
            .notification_capacity(config.notification_capacity)
            .error_log_retention(config.error_log_retention);

        if let Some(base) = config.api_base()? {
            let probe = HttpProbe::new(&base, &config.health_path, HTTP_TIMEOUT)?;
            let replay = HttpReplayHandler::new(base, Preferences::new(store), HTTP_TIMEOUT)?;
            builder = builder.probe(Arc::new(probe)).fallback_handler(Arc::new(replay));
        }

        Ok(builder)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Probe used for the initial connectivity state. Without one the core starts online.
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn retry_engine(mut self, engine: Arc<RetryPolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Handler for action kinds with no dedicated registration.
    pub fn fallback_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_ttl_minutes(mut self, ttl_minutes: u32) -> Self {
        self.default_ttl_minutes = ttl_minutes;
        self
    }

    pub fn app_url(mut self, url: impl Into<String>) -> Self {
        self.app_url = url.into();
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity;
        self
    }

    /// Cap on queued error records awaiting upload.
    pub fn error_log_retention(mut self, max: usize) -> Self {
        self.error_log_retention = max;
        self
    }

    pub async fn build(self) -> OfflineCore {
        let queue = ActionQueue::new(self.store.clone(), self.clock.clone())
            .with_default_max_retries(self.default_max_retries);
        let cache = TtlCache::new(self.store.clone(), self.clock.clone());
        let preferences = Preferences::new(self.store.clone());
        let notifier = Arc::new(BroadcastNotifier::new(self.notification_capacity));

        let classifier = Arc::new(
            ErrorClassifier::new(
                queue.clone(),
                preferences.clone(),
                notifier.clone(),
                self.clock.clone(),
            )
            .with_log_retention(self.error_log_retention),
        );
        classifier.set_location(self.app_url);

        let monitor = Arc::new(match &self.probe {
            Some(probe) => NetworkMonitor::from_probe(probe.as_ref()).await,
            None => NetworkMonitor::new(ConnectivityState::Online),
        });

        let handlers = Arc::new(HandlerRegistry::new());
        if let Some(fallback) = self.fallback {
            handlers.set_fallback(fallback);
        }
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(RetryPolicyEngine::new()));

        let orchestrator = SyncOrchestrator::with_connectivity(
            queue.clone(),
            engine.clone(),
            classifier.clone(),
            handlers.clone(),
            monitor.subscribe(),
        );
        monitor.set_listener(Arc::new(orchestrator.clone()));

        info!(store = self.store.name(), online = monitor.is_online(), "Offline core ready");

        OfflineCore {
            store: self.store,
            queue,
            cache,
            preferences,
            notifier,
            classifier,
            engine,
            handlers,
            monitor,
            probe: self.probe,
            orchestrator,
            clock: self.clock,
            default_ttl_minutes: self.default_ttl_minutes,
        }
    }
}

/// Offline-resilience core: durable queue, TTL cache, error policy and sync.
pub struct OfflineCore {
    store: Arc<dyn DurableStore>,
    queue: ActionQueue,
    cache: TtlCache,
    preferences: Preferences,
    notifier: Arc<BroadcastNotifier>,
    classifier: Arc<ErrorClassifier>,
    engine: Arc<RetryPolicyEngine>,
    handlers: Arc<HandlerRegistry>,
    monitor: Arc<NetworkMonitor>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    orchestrator: SyncOrchestrator,
    clock: Arc<dyn Clock>,
    default_ttl_minutes: u32,
}

impl OfflineCore {
    pub fn builder(store: Arc<dyn DurableStore>) -> CoreBuilder {
        CoreBuilder::new(store)
    }

    /// Build a core from a configuration file's settings.
    pub async fn from_config(config: &CoreConfig) -> Result<Self> {
        Ok(CoreBuilder::from_config(config)?.build().await)
    }

    /// Defer work for replay. Returns the new action's id.
    pub async fn enqueue(&self, kind: &str, payload: impl Into<String>, max_retries: Option<u32>) -> Result<ActionId> {
        self.queue.enqueue(kind, payload, max_retries).await
    }

    /// Declare how actions of `kind` are replayed.
    pub fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.register(kind, handler);
    }

    /// Run the handler for `kind` now, or queue the work.
    ///
    /// Work is queued when offline, when no handler is registered yet, or
    /// when the immediate attempt fails with an error its retry policy
    /// considers transient. Other failures, including handler panics, are
    /// classified and returned to the caller.
    pub async fn submit(&self, kind: &str, payload: impl Into<String>, max_retries: Option<u32>) -> Result<Submission> {
        let payload = payload.into();
        let handler = match self.handlers.resolve(kind) {
            Some(handler) if self.monitor.is_online() => handler,
            _ => {
                let id = self.enqueue(kind, payload, max_retries).await?;
                debug!(action_id = %id, kind, "Submission queued");
                return Ok(Submission::Queued(id));
            }
        };

        let action = OfflineAction::new(
            kind,
            payload,
            max_retries.unwrap_or(self.queue.default_max_retries()),
            self.clock.now(),
        );
        match invoke_handler(handler.as_ref(), &action).await {
            Ok(()) => Ok(Submission::Completed),
            Err(err) if self.engine.should_retry(err.kind(), 0, &err) => {
                warn!(kind, error = %err, "Immediate attempt failed, queueing");
                self.queue.save(&action).await?;
                Ok(Submission::Queued(action.id))
            }
            Err(err) => {
                self.classifier
                    .report(
                        ErrorReport::new(err.to_string())
                            .kind(err.kind())
                            .severity(err.default_severity())
                            .context("actionKind", kind),
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Cache `data` under `key` for `ttl_minutes` (default from configuration).
    pub async fn cache(&self, key: &str, data: Value, ttl_minutes: Option<u32>) -> Result<()> {
        self.cache
            .cache_data(key, data, ttl_minutes.unwrap_or(self.default_ttl_minutes))
            .await
    }

    /// Read a cached value, or `None` once it has expired.
    pub async fn read_cache(&self, key: &str) -> Result<Option<Value>> {
        self.cache.get_cached_data(key).await
    }

    pub async fn remove_cache(&self, key: &str) -> Result<()> {
        self.cache.remove_cached_data(key).await
    }

    /// Delete every expired cache entry. Returns how many were removed.
    pub async fn cleanup_expired_cache(&self) -> Result<usize> {
        self.cache.cleanup_expired_cache().await
    }

    /// Report a failure to the classifier.
    pub async fn report_error(
        &self,
        fault: impl Into<Fault>,
        kind: Option<ErrorKind>,
        severity: Option<Severity>,
        context: BTreeMap<String, Value>,
        show_to_user: Option<bool>,
    ) -> ErrorRecord {
        self.classifier
            .report_error(fault, kind, severity, context, show_to_user)
            .await
    }

    /// Report a failure built with [`ErrorReport`].
    pub async fn report(&self, report: ErrorReport) -> ErrorRecord {
        self.classifier.report(report).await
    }

    /// Subscribe to user notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.notifier.subscribe()
    }

    /// Wipe every collection: queued actions, cache and preferences.
    pub async fn clear_all_data(&self) -> Result<()> {
        for collection in Collection::ALL {
            self.store.clear(collection).await?;
        }
        info!("All offline data cleared");
        Ok(())
    }

    pub async fn pending(&self) -> Result<Vec<OfflineAction>> {
        self.queue.pending().await
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Apply a connectivity event from the platform.
    ///
    /// Going online drains the queue before this returns.
    pub async fn connectivity_changed(&self, online: bool) -> Transition {
        self.monitor.handle_event(online).await
    }

    /// Drain the queue now.
    pub async fn drain(&self) -> Result<DrainReport> {
        self.orchestrator.drain_queue().await
    }

    /// Wait for every armed retry timer to finish.
    pub async fn wait_idle(&self) {
        self.orchestrator.wait_idle().await
    }

    /// Start the background scheduler on the current runtime.
    ///
    /// Periodic mode needs a probe; without one the scheduler only serves
    /// explicit drain requests.
    pub fn start_scheduler(&self, mode: SyncMode) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(mode);
        let probe: Arc<dyn ConnectivityProbe> = match &self.probe {
            Some(probe) => probe.clone(),
            None => Arc::new(lantern_sync::ManualProbe::new(true)),
        };
        let task = tokio::spawn(handle.run(self.monitor.clone(), probe, self.orchestrator.clone()));
        (scheduler, task)
    }

    /// Report panics anywhere in the process through this core.
    pub fn capture_panics(&self) -> JoinHandle<()> {
        install_panic_hook(self.classifier.clone())
    }

    /// Close the store. It reopens on next use.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn retry_engine(&self) -> &Arc<RetryPolicyEngine> {
        &self.engine
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn monitor(&self) -> &Arc<NetworkMonitor> {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }
}
