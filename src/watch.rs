// ABOUTME: Interval loop that repeats a sync pass until shutdown
// ABOUTME: Drives the watch (one direction) and bisync (both directions) commands

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::{BidirectionalCoordinator, RunStatus, SyncEngine};

/// One unit of work repeated by [`WatchLoop`].
#[async_trait]
pub trait Pass: Send + Sync {
    /// Run once and log the outcome.
    async fn run_pass(&self) -> RunStatus;
}

#[async_trait]
impl Pass for SyncEngine {
    async fn run_pass(&self) -> RunStatus {
        let report = self.run().await;
        report.log_summary();
        report.status
    }
}

#[async_trait]
impl Pass for BidirectionalCoordinator {
    async fn run_pass(&self) -> RunStatus {
        let report = self.run_once().await;
        report.forward.log_summary();
        report.reverse.log_summary();
        report.status()
    }
}

/// Counters of a finished loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    pub passes: u64,
    /// Passes whose status was not `Success`
    pub unsuccessful: u64,
}

/// Runs a [`Pass`] every `interval` until a shutdown signal arrives.
///
/// A pass that overruns the interval delays the next tick instead of
/// triggering a burst of catch-up passes. A shutdown received mid-pass
/// abandons the pass; committed batches stay committed.
pub struct WatchLoop<P> {
    pass: P,
    interval: Duration,
}

impl<P: Pass> WatchLoop<P> {
    pub fn new(pass: P, interval: Duration) -> Self {
        Self { pass, interval }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> WatchStats {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = WatchStats::default();

        tracing::info!("Watching with interval={:?}", self.interval);

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping");
                    break;
                }
                _ = ticker.tick() => {
                    stats.passes += 1;
                    tracing::debug!("Starting pass {}", stats.passes);

                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during pass {}, aborting", stats.passes);
                            break;
                        }
                        status = self.pass.run_pass() => {
                            if status != RunStatus::Success {
                                stats.unsuccessful += 1;
                                tracing::warn!("Pass {} finished with status {}", stats.passes, status);
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            "Stopped after {} passes ({} unsuccessful)",
            stats.passes,
            stats.unsuccessful
        );
        stats
    }
}
