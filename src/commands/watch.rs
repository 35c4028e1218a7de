// ABOUTME: Watch command - repeats the sync pass on an interval until Ctrl+C
// ABOUTME: Each pass is skipped cheaply when the source signature is unchanged

use anyhow::Result;
use std::time::Duration;

use super::{shutdown_on_ctrl_c, Endpoints};
use crate::config::SyncOptions;
use crate::engine::SyncEngine;
use crate::watch::WatchLoop;

pub async fn watch(endpoints: &Endpoints, options: SyncOptions, interval: Duration) -> Result<()> {
    let (source, target) = endpoints.open()?;
    if !options.change_detector {
        tracing::warn!("Change detection is off; every pass diffs every table");
    }

    let engine = SyncEngine::new(source, target, options).with_state_store(endpoints.state_store());
    let stats = WatchLoop::new(engine, interval)
        .run(shutdown_on_ctrl_c())
        .await;

    tracing::info!(
        "Watch stopped: {} passes, {} unsuccessful",
        stats.passes,
        stats.unsuccessful
    );
    Ok(())
}
