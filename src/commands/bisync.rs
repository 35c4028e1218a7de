// ABOUTME: Bidirectional sync command
// ABOUTME: Runs a->b and b->a concurrently, once or on an interval until Ctrl+C

use anyhow::Result;
use std::time::Duration;

use super::{shutdown_on_ctrl_c, Endpoints};
use crate::config::{BisyncOptions, SyncOptions};
use crate::engine::{BidirectionalCoordinator, RunStatus};
use crate::watch::WatchLoop;

/// Keep `source` (A) and `target` (B) in sync in both directions.
///
/// With `interval = None` a single coordinated pass runs and its combined
/// status is returned. Otherwise passes repeat until Ctrl+C and the result
/// is `Success`.
pub async fn bisync(
    endpoints: &Endpoints,
    options: SyncOptions,
    bisync: BisyncOptions,
    interval: Option<Duration>,
) -> Result<RunStatus> {
    let (a, b) = endpoints.open()?;
    let coordinator = BidirectionalCoordinator::new(a, b, options, bisync)
        .with_state_store(endpoints.state_store());

    let Some(interval) = interval else {
        let report = coordinator.run_once().await;
        report.forward.log_summary();
        report.reverse.log_summary();
        return Ok(report.status());
    };

    let stats = WatchLoop::new(coordinator, interval)
        .run(shutdown_on_ctrl_c())
        .await;
    tracing::info!(
        "Bidirectional sync stopped: {} passes, {} unsuccessful",
        stats.passes,
        stats.unsuccessful
    );
    Ok(RunStatus::Success)
}
