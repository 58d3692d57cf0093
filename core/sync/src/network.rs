//! Connectivity tracking.
//!
//! The monitor holds the single online/offline flag for the process and
//! fires the reconnect listener on every offline-to-online transition,
//! exactly once per transition.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use lantern_common::ConnectivityState;

/// Source of connectivity facts.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe whose answer is set by hand.
#[derive(Debug)]
pub struct ManualProbe {
    online: AtomicBool,
}

impl ManualProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Reacts to connectivity coming back.
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    async fn on_reconnect(&self);
}

/// Outcome of applying a connectivity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    WentOnline,
    WentOffline,
}

/// Process-wide connectivity state.
pub struct NetworkMonitor {
    state: watch::Sender<ConnectivityState>,
    listener: RwLock<Option<Arc<dyn ReconnectListener>>>,
}

impl NetworkMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state,
            listener: RwLock::new(None),
        }
    }

    /// Create a monitor whose initial state mirrors what `probe` reports.
    pub async fn from_probe(probe: &dyn ConnectivityProbe) -> Self {
        let initial = ConnectivityState::from_online(probe.is_online().await);
        info!(state = ?initial, "Network monitor started");
        Self::new(initial)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Watch connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    /// Register the listener fired on reconnect, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn ReconnectListener>) {
        *self.listener.write().unwrap() = Some(listener);
    }

    /// Apply a connectivity event from the platform.
    ///
    /// Repeated events with the same value are no-ops. The listener is
    /// awaited only on an offline-to-online transition.
    pub async fn handle_event(&self, online: bool) -> Transition {
        let next = ConnectivityState::from_online(online);
        let previous = self.state.send_replace(next);

        let transition = match (previous, next) {
            (ConnectivityState::Offline, ConnectivityState::Online) => Transition::WentOnline,
            (ConnectivityState::Online, ConnectivityState::Offline) => Transition::WentOffline,
            _ => Transition::Unchanged,
        };

        match transition {
            Transition::WentOnline => {
                info!("Connectivity restored");
                let listener = self.listener.read().unwrap().clone();
                if let Some(listener) = listener {
                    listener.on_reconnect().await;
                }
            }
            Transition::WentOffline => info!("Connectivity lost"),
            Transition::Unchanged => debug!(state = ?next, "Connectivity unchanged"),
        }

        transition
    }

    /// Ask `probe` for the current state and apply it.
    pub async fn poll(&self, probe: &dyn ConnectivityProbe) -> Transition {
        self.handle_event(probe.is_online().await).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReconnectListener for CountingListener {
        async fn on_reconnect(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor_with_listener(initial: ConnectivityState) -> (NetworkMonitor, Arc<CountingListener>) {
        let monitor = NetworkMonitor::new(initial);
        let listener = Arc::new(CountingListener::default());
        monitor.set_listener(listener.clone());
        (monitor, listener)
    }

    #[tokio::test]
    async fn test_initial_state_mirrors_probe() {
        let offline = NetworkMonitor::from_probe(&ManualProbe::new(false)).await;
        let online = NetworkMonitor::from_probe(&ManualProbe::new(true)).await;

        assert!(!offline.is_online());
        assert!(online.is_online());
    }

    #[tokio::test]
    async fn test_reconnect_fires_once_per_transition() {
        let (monitor, listener) = monitor_with_listener(ConnectivityState::Offline);

        assert_eq!(monitor.handle_event(true).await, Transition::WentOnline);
        assert_eq!(monitor.handle_event(true).await, Transition::Unchanged);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        assert_eq!(monitor.handle_event(false).await, Transition::WentOffline);
        assert_eq!(monitor.handle_event(true).await, Transition::WentOnline);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_going_offline_does_not_fire() {
        let (monitor, listener) = monitor_with_listener(ConnectivityState::Online);

        monitor.handle_event(false).await;
        monitor.handle_event(false).await;

        assert_eq!(listener.calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_concurrent_online_events_fire_once() {
        let (monitor, listener) = monitor_with_listener(ConnectivityState::Offline);

        let events = (0..8).map(|_| monitor.handle_event(true));
        let transitions = futures::future::join_all(events).await;

        let went_online = transitions
            .iter()
            .filter(|t| **t == Transition::WentOnline)
            .count();
        assert_eq!(went_online, 1);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_and_subscribe() {
        let monitor = NetworkMonitor::new(ConnectivityState::Online);
        let mut watcher = monitor.subscribe();
        let probe = ManualProbe::new(false);

        assert_eq!(monitor.poll(&probe).await, Transition::WentOffline);
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), ConnectivityState::Offline);
    }
}
