// ABOUTME: Command implementations for the CLI subcommands
// ABOUTME: Exports sync, check, watch and bisync, plus shared endpoint handling

pub mod bisync;
pub mod check;
pub mod sync;
pub mod watch;

pub use bisync::bisync;
pub use check::check;
pub use sync::sync;
pub use watch::watch;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::db::{open_database, Database};
use crate::engine::StateStore;
use crate::utils::{check_mysql_port, sanitize_url, validate_source_target_different};

/// The two databases a command works on, as given on the command line.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub source: String,
    pub target: String,
    /// Accept `mysql://` URLs on port 5432
    pub allow_mysql_port_5432: bool,
    /// Where signatures are persisted
    pub state_file: PathBuf,
}

impl Endpoints {
    /// Validate both URLs and open database handles for them.
    ///
    /// Nothing connects yet; connection errors surface when a run starts.
    pub fn open(&self) -> Result<(Arc<dyn Database>, Arc<dyn Database>)> {
        check_mysql_port(&self.source, self.allow_mysql_port_5432)?;
        check_mysql_port(&self.target, self.allow_mysql_port_5432)?;
        validate_source_target_different(&self.source, &self.target)?;

        let source = open_database(&self.source)
            .with_context(|| format!("Invalid source {}", sanitize_url(&self.source)))?;
        let target = open_database(&self.target)
            .with_context(|| format!("Invalid target {}", sanitize_url(&self.target)))?;
        Ok((source, target))
    }

    pub fn state_store(&self) -> Arc<StateStore> {
        Arc::new(StateStore::new(self.state_file.clone()))
    }
}

/// Receiver that fires once on Ctrl+C.
pub(crate) fn shutdown_on_ctrl_c() -> broadcast::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    });
    shutdown_rx
}
