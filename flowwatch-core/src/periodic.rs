//! Background task that runs `monitor_once` on an interval.

use std::sync::Arc;
use std::time::Duration;

use flowwatch_types::LatencyReport;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::monitor::LatencyMonitor;

/// Handle for controlling the periodic monitor.
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct PeriodicHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeriodicHandle {
    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Spawn a task that runs `monitor_once` every `interval`, logs each alert
/// and forwards the report to `reports` if given.
pub fn spawn(
    monitor: Arc<LatencyMonitor>,
    interval: Duration,
    reports: Option<mpsc::Sender<LatencyReport>>,
) -> PeriodicHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = monitor.monitor_once();
                    for alert in &report.alerts {
                        warn!(key = %alert.key, metric = %alert.metric, observed = alert.observed, bound = alert.bound, "{}", alert.message);
                    }
                    debug!(
                        flows = report.flow_count,
                        samples = report.latency_samples,
                        healthy = report.is_healthy(),
                        "periodic latency check"
                    );
                    if let Some(tx) = &reports {
                        if tx.send(report).await.is_err() {
                            break;
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    PeriodicHandle { stop_tx, task }
}
