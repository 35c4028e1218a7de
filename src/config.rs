// ABOUTME: Immutable run configuration with documented defaults
// ABOUTME: Loads optional [sync] and [bisync] tables from a TOML file

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Strategy used to decide whether a run is needed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureType {
    /// Replication-log coordinate of the source server (binlog file + offset, WAL LSN).
    LogPosition,
    /// Order-independent digest over the row hashes of every tracked table.
    ContentHash,
    /// Try `LogPosition`, fall back to `ContentHash` when the log is unavailable.
    #[default]
    Auto,
}

impl SignatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureType::LogPosition => "log-position",
            SignatureType::ContentHash => "content-hash",
            SignatureType::Auto => "auto",
        }
    }
}

impl std::fmt::Display for SignatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SignatureType {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "log-position" | "logposition" | "binlog" => Ok(SignatureType::LogPosition),
            "content-hash" | "contenthash" | "content" => Ok(SignatureType::ContentHash),
            "auto" => Ok(SignatureType::Auto),
            other => Err(SyncError::Config(format!(
                "unknown signature type '{}' (expected log-position, content-hash or auto)",
                other
            ))),
        }
    }
}

/// How much of a bidirectional run a lock covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LockScope {
    /// One lock per table, held while that table is diffed and applied.
    #[default]
    Table,
    /// One lock for the whole run of a direction.
    Run,
}

/// Options for one synchronization run. Built once, shared read-only by every worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Whitelist of table names; `None` means every table common to both sides.
    pub include: Option<Vec<String>>,
    /// Blacklist of table names, applied after `include`.
    pub exclude: Option<Vec<String>>,
    /// Maximum rows per applied batch.
    pub batch_size: usize,
    /// Compute and report changes without mutating the target.
    pub dry_run: bool,
    /// Leave foreign-key checks enabled while applying.
    pub keep_fk_checks: bool,
    /// Skip the whole run when the source has not changed since the last committed signature.
    pub change_detector: bool,
    /// Concurrency bound for table workers; `None` picks a value from the CPU count.
    pub max_workers: Option<usize>,
    pub signature_type: SignatureType,
    /// Ignore duplicate-key conflicts on insert instead of failing the batch.
    pub insert_ignore: bool,
    /// Rows fetched per page while streaming row signatures.
    pub page_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            batch_size: 1000,
            dry_run: false,
            keep_fk_checks: false,
            change_detector: true,
            max_workers: None,
            signature_type: SignatureType::Auto,
            insert_ignore: false,
            page_size: 5000,
        }
    }
}

impl SyncOptions {
    /// Reject values no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        if self.max_workers == Some(0) {
            return Err(SyncError::Config("max_workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Number of concurrent table workers for `table_count` tables.
    pub fn effective_workers(&self, table_count: usize) -> usize {
        let wanted = self.max_workers.unwrap_or_else(auto_workers);
        wanted.min(table_count).max(1)
    }

    /// Apply values from a config file; values already set on `self` by the
    /// caller are overwritten only where the file sets them.
    pub fn merge_file(mut self, file: &SyncSection) -> Self {
        if file.include.is_some() {
            self.include = file.include.clone();
        }
        if file.exclude.is_some() {
            self.exclude = file.exclude.clone();
        }
        if let Some(batch_size) = file.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(dry_run) = file.dry_run {
            self.dry_run = dry_run;
        }
        if let Some(keep) = file.keep_fk_checks {
            self.keep_fk_checks = keep;
        }
        if let Some(detect) = file.change_detector {
            self.change_detector = detect;
        }
        if file.max_workers.is_some() {
            self.max_workers = file.max_workers;
        }
        if let Some(signature_type) = file.signature_type {
            self.signature_type = signature_type;
        }
        if let Some(ignore) = file.insert_ignore {
            self.insert_ignore = ignore;
        }
        if let Some(page_size) = file.page_size {
            self.page_size = page_size;
        }
        self
    }
}

/// Worker count when none is configured: twice the CPU count, between 2 and 8.
pub fn auto_workers() -> usize {
    (num_cpus::get() * 2).clamp(2, 8)
}

/// Options for the bidirectional coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisyncOptions {
    pub lock_timeout: Duration,
    pub lock_scope: LockScope,
}

impl Default for BisyncOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            lock_scope: LockScope::Table,
        }
    }
}

/// `[sync]` table of a config file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub include: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
    pub batch_size: Option<usize>,
    pub dry_run: Option<bool>,
    pub keep_fk_checks: Option<bool>,
    pub change_detector: Option<bool>,
    pub max_workers: Option<usize>,
    pub signature_type: Option<SignatureType>,
    pub insert_ignore: Option<bool>,
    pub page_size: Option<usize>,
}

/// `[bisync]` table of a config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BisyncSection {
    pub lock_timeout_secs: Option<u64>,
    pub lock_scope: Option<LockScope>,
    pub interval_secs: Option<u64>,
}

/// Parsed config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub bisync: BisyncSection,
}

impl FileConfig {
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    pub fn bisync_options(&self) -> BisyncOptions {
        let defaults = BisyncOptions::default();
        BisyncOptions {
            lock_timeout: self
                .bisync
                .lock_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            lock_scope: self.bisync.lock_scope.unwrap_or(defaults.lock_scope),
        }
    }
}
