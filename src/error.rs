// ABOUTME: Error taxonomy for the synchronization engine
// ABOUTME: Separates run-fatal errors from per-table errors that are reported and skipped

use std::time::Duration;
use thiserror::Error;

use crate::config::SignatureType;

/// Boxed driver error carried as the source of a [`SyncError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which group of batches a batch failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Insert,
    Update,
    Delete,
}

impl BatchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchPhase::Insert => "insert",
            BatchPhase::Update => "update",
            BatchPhase::Delete => "delete",
        }
    }
}

impl std::fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// A database could not be reached. Fatal to the current run.
    #[error("Cannot reach {endpoint}: {source}")]
    Connectivity {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// The two sides disagree on a table's shape. The table is skipped.
    #[error("Schema mismatch on table '{table}': {reason}")]
    SchemaMismatch { table: String, reason: String },

    /// A batch transaction failed and was rolled back. Later batches of the
    /// same table are not attempted.
    #[error("Batch {batch_index} ({phase}) failed on table '{table}': {source}")]
    BatchApply {
        table: String,
        phase: BatchPhase,
        batch_index: usize,
        #[source]
        source: Box<SyncError>,
    },

    /// The per-table lock was not acquired in time (bidirectional mode only).
    #[error("Timed out after {waited:?} waiting for the lock on '{table}'")]
    LockTimeout { table: String, waited: Duration },

    /// The requested signature strategy cannot be computed on this server.
    #[error("{strategy} signature unavailable: {reason}")]
    DetectionUnavailable {
        strategy: SignatureType,
        reason: String,
    },

    /// A statement failed on the server.
    #[error("{context}: {source}")]
    Query {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A backend returned keys out of primary-key order.
    #[error("Rows of '{table}' on the {side} side are not ordered by primary key")]
    KeyOrder { table: String, side: &'static str },

    #[error("State store error at {path}: {source}")]
    State {
        path: String,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),
}

impl SyncError {
    pub fn connectivity(endpoint: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SyncError::Connectivity {
            endpoint: endpoint.into(),
            source: source.into(),
        }
    }

    pub fn query(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SyncError::Query {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn schema_mismatch(table: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::SchemaMismatch {
            table: table.into(),
            reason: reason.into(),
        }
    }

    /// Errors that abort the whole run rather than a single table.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Connectivity { .. } | SyncError::State { .. })
    }

    /// Errors worth another connection attempt.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity { .. })
    }

    /// Errors that make a detection strategy fall back instead of failing.
    pub fn is_detection_unavailable(&self) -> bool {
        matches!(self, SyncError::DetectionUnavailable { .. })
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
