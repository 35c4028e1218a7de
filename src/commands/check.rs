// ABOUTME: Quick change check command
// ABOUTME: Compares the source signature with the stored one without syncing anything

use anyhow::{Context, Result};

use super::Endpoints;
use crate::config::SyncOptions;
use crate::engine::has_changes;

/// Check whether the source changed since the last successful sync.
///
/// Prints `changed <signature>` or `unchanged <signature>` to stdout. With
/// `write_current` the current signature becomes the new baseline and the
/// check reports unchanged.
///
/// # Returns
///
/// `true` when the source changed.
pub async fn check(endpoints: &Endpoints, options: SyncOptions, write_current: bool) -> Result<bool> {
    let (source, target) = endpoints.open()?;
    let store = endpoints.state_store();

    let detection = has_changes(source.as_ref(), target.as_ref(), &options, &store)
        .await
        .context("Change check failed")?;

    if write_current {
        detection
            .commit(&store)
            .await
            .context("Failed to write current signature")?;
        tracing::info!("Stored current signature {}", detection.signature);
        println!("unchanged {}", detection.signature);
        return Ok(false);
    }

    let verdict = if detection.changed { "changed" } else { "unchanged" };
    println!("{} {}", verdict, detection.signature);
    Ok(detection.changed)
}
