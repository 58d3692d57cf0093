//! Background scheduling of connectivity probes and queue drains.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use lantern_common::{Error, Result};

use crate::network::{ConnectivityProbe, NetworkMonitor, Transition};
use crate::orchestrator::{DrainReport, SyncOrchestrator};

/// Scheduling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Drain only when asked or on reconnect.
    Manual,
    /// Also probe connectivity and drain at regular intervals.
    Periodic { interval: Duration },
}

/// Requests accepted by the scheduler task.
#[derive(Debug)]
enum SchedulerRequest {
    Drain(oneshot::Sender<Result<DrainReport>>),
    Shutdown,
}

/// Client side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Ask the scheduler task to drain the queue now.
    pub async fn request_drain(&self) -> Result<DrainReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::Drain(response_tx))
            .await
            .map_err(|_| Error::Runtime("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Runtime("Failed to receive drain result".to_string()))?
    }

    /// Change the mode. Takes effect at the next loop iteration.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    pub async fn mode(&self) -> SyncMode {
        *self.mode.read().await
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Task side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl SyncSchedulerHandle {
    /// Run until shutdown. Spawn this on the runtime.
    ///
    /// On each periodic tick the monitor polls `probe`. A tick that finds
    /// the process already online drains the queue, which picks up actions
    /// enqueued while online. Reconnect drains are fired by the monitor.
    pub async fn run(
        mut self,
        monitor: Arc<NetworkMonitor>,
        probe: Arc<dyn ConnectivityProbe>,
        orchestrator: SyncOrchestrator,
    ) {
        let mut current = *self.mode.read().await;
        let mut ticker = Self::ticker(current);

        info!(mode = ?current, "Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some(SchedulerRequest::Drain(response_tx)) => {
                        debug!("Processing drain request");
                        let _ = response_tx.send(orchestrator.drain_queue().await);
                    }
                    Some(SchedulerRequest::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = Self::wait_for_tick(&mut ticker) => {
                    let transition = monitor.poll(probe.as_ref()).await;
                    if transition == Transition::Unchanged && monitor.is_online() {
                        match orchestrator.drain_queue().await {
                            Ok(report) if report.ran() => debug!(
                                succeeded = report.succeeded,
                                rescheduled = report.rescheduled,
                                "Periodic drain completed"
                            ),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Periodic drain failed"),
                        }
                    }
                }
            }

            let mode = *self.mode.read().await;
            if mode != current {
                debug!(mode = ?mode, "Sync mode changed");
                current = mode;
                ticker = Self::ticker(current);
            }
        }
    }

    fn ticker(mode: SyncMode) -> Option<tokio::time::Interval> {
        match mode {
            SyncMode::Periodic { interval: period } => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
            SyncMode::Manual => None,
        }
    }

    async fn wait_for_tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
