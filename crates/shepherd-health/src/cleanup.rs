//! Cleanup driver: the periodic trigger behind self-healing.
//!
//! After an initial delay the driver ticks on a fixed interval and starts
//! one inspection cycle per pool. Pools run as independent tasks: a pool
//! whose previous cycle is still running is skipped for that tick, and the
//! others proceed unaffected.

use std::time::Duration;

use shepherd_core::CleanupConfig;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::monitor::{HealthMonitor, PoolReport};

/// Runs every pool's health monitor on a fixed interval.
pub struct CleanupDriver {
    interval: Duration,
    initial_delay: Duration,
    monitors: Vec<HealthMonitor>,
}

impl CleanupDriver {
    pub fn new(config: &CleanupConfig, monitors: Vec<HealthMonitor>) -> Self {
        Self {
            interval: config.interval,
            initial_delay: config.initial_delay,
            monitors,
        }
    }

    /// Run one cycle across every pool concurrently and collect the reports.
    pub async fn run_once(&self) -> Vec<PoolReport> {
        let mut join_set = JoinSet::new();
        for monitor in &self.monitors {
            let monitor = monitor.clone();
            join_set.spawn(async move { monitor.inspect_pool().await });
        }

        let mut reports = Vec::with_capacity(self.monitors.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "pool cycle did not complete"),
            }
        }
        reports
    }

    /// Run until `shutdown` flips. In-flight pool cycles get one interval to
    /// finish before they are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pools = self.monitors.len(),
            interval = ?self.interval,
            initial_delay = ?self.initial_delay,
            "cleanup driver starting"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = shutdown.changed() => {
                info!("cleanup driver stopped before first cycle");
                return;
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut in_flight: Vec<Option<JoinHandle<PoolReport>>> =
            self.monitors.iter().map(|_| None).collect();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (monitor, slot) in self.monitors.iter().zip(in_flight.iter_mut()) {
                        if let Some(handle) = slot.take_if(|h| h.is_finished()) {
                            log_cycle(monitor.pool_name(), handle.await);
                        }
                        if slot.is_some() {
                            warn!(pool = %monitor.pool_name(), "previous cycle still running; skipping tick");
                            continue;
                        }
                        let monitor = monitor.clone();
                        *slot = Some(tokio::spawn(async move { monitor.inspect_pool().await }));
                    }
                }
                _ = shutdown.changed() => {
                    debug!("cleanup driver received shutdown");
                    break;
                }
            }
        }

        for (monitor, slot) in self.monitors.iter().zip(in_flight) {
            let Some(mut handle) = slot else { continue };
            match tokio::time::timeout(self.interval, &mut handle).await {
                Ok(joined) => log_cycle(monitor.pool_name(), joined),
                Err(_) => {
                    warn!(pool = %monitor.pool_name(), "aborting pool cycle at shutdown");
                    handle.abort();
                }
            }
        }
        info!("cleanup driver stopped");
    }
}

fn log_cycle(pool: &str, joined: Result<PoolReport, tokio::task::JoinError>) {
    match joined {
        Ok(report) => debug!(
            %pool,
            alive = report.alive.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "pool cycle finished"
        ),
        Err(e) => error!(%pool, error = %e, "pool cycle did not complete"),
    }
}
