// ABOUTME: One-shot sync command
// ABOUTME: Opens both databases, runs one pass with change detection, logs the report

use anyhow::Result;

use super::Endpoints;
use crate::config::SyncOptions;
use crate::engine::{self, RunStatus};

/// Sync the target to match the source once.
///
/// # Returns
///
/// The run status; table-level failures are not errors here.
pub async fn sync(endpoints: &Endpoints, options: SyncOptions) -> Result<RunStatus> {
    let (source, target) = endpoints.open()?;
    let report = engine::sync(source, target, options, Some(endpoints.state_store())).await;
    report.log_summary();
    Ok(report.status)
}
