// ABOUTME: Change detector - decides whether a sync run is needed at all
// ABOUTME: Log-position and content-hash signatures with auto fallback, decoupled commit

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::signature::RowHash;
use super::state::{StateStore, SyncStateRecord};
use crate::config::{SignatureType, SyncOptions};
use crate::db::{Connection, Database, TableSpec};
use crate::error::Result;
use crate::filters::TableFilter;

/// Observable state of a database at one point in time.
///
/// Signatures of different variants are never equal, so switching strategy
/// always reads as "changed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DatabaseSignature {
    /// Replication-log coordinate of the source server.
    LogPosition { file: String, offset: u64 },
    /// Hex SHA-256 over the per-table content digests.
    ContentHash { digest: String },
}

impl DatabaseSignature {
    pub fn strategy(&self) -> SignatureType {
        match self {
            DatabaseSignature::LogPosition { .. } => SignatureType::LogPosition,
            DatabaseSignature::ContentHash { .. } => SignatureType::ContentHash,
        }
    }
}

impl std::fmt::Display for DatabaseSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseSignature::LogPosition { file, offset } => write!(f, "binlog:{}:{}", file, offset),
            DatabaseSignature::ContentHash { digest } => write!(f, "content:{}", digest),
        }
    }
}

/// Outcome of a change check. Nothing is persisted until [`Detection::commit`].
#[derive(Debug, Clone)]
pub struct Detection {
    pub changed: bool,
    pub signature: DatabaseSignature,
    pub previous: Option<DatabaseSignature>,
    pair_key: String,
    source: String,
    target: String,
    filter_fingerprint: String,
}

impl Detection {
    /// Persist the signature as the new baseline of this pair.
    pub async fn commit(&self, store: &StateStore) -> Result<()> {
        let record = SyncStateRecord::new(
            &self.source,
            &self.target,
            self.signature.clone(),
            &self.filter_fingerprint,
        );
        store.put(&self.pair_key, record).await?;
        tracing::debug!("Committed signature {}", self.signature);
        Ok(())
    }
}

/// Checks a source against the stored baseline of one (source, target) pair.
pub struct ChangeDetector<'a> {
    store: &'a StateStore,
    source: String,
    target: String,
    filter_fingerprint: String,
    page_size: usize,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(
        store: &'a StateStore,
        source_identity: &str,
        target_identity: &str,
        filter: &TableFilter,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            source: source_identity.to_string(),
            target: target_identity.to_string(),
            filter_fingerprint: filter.fingerprint(),
            page_size,
        }
    }

    /// Compute the source's current signature over `tables` and compare it
    /// with the last committed one.
    ///
    /// A missing baseline, a different strategy, or a different table
    /// filter all report `changed = true`.
    pub async fn check(
        &self,
        source: &mut dyn Connection,
        tables: &[TableSpec],
        signature_type: SignatureType,
    ) -> Result<Detection> {
        let signature = compute_signature(source, tables, signature_type, self.page_size).await?;
        let pair_key = StateStore::pair_key(&self.source, &self.target);
        let stored = self.store.get(&pair_key).await?;

        let changed = match &stored {
            None => {
                tracing::info!("No stored signature for this pair; treating as changed");
                true
            }
            Some(record) if record.filter_fingerprint != self.filter_fingerprint => {
                tracing::info!("Table filter changed since last run; treating as changed");
                true
            }
            Some(record) if record.signature.strategy() != signature.strategy() => {
                tracing::info!(
                    "Signature strategy switched from {} to {}; treating as changed",
                    record.signature.strategy(),
                    signature.strategy()
                );
                true
            }
            Some(record) => record.signature != signature,
        };

        tracing::debug!(
            "Signature {} (previous: {})",
            signature,
            stored
                .as_ref()
                .map(|r| r.signature.to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        Ok(Detection {
            changed,
            signature,
            previous: stored.map(|r| r.signature),
            pair_key,
            source: self.source.clone(),
            target: self.target.clone(),
            filter_fingerprint: self.filter_fingerprint.clone(),
        })
    }
}

/// Compute a signature with the requested strategy.
///
/// `Auto` tries the log position first and falls back to the content hash
/// only when the log is unavailable; connectivity errors propagate.
pub async fn compute_signature(
    conn: &mut dyn Connection,
    tables: &[TableSpec],
    signature_type: SignatureType,
    page_size: usize,
) -> Result<DatabaseSignature> {
    match signature_type {
        SignatureType::LogPosition => log_signature(conn).await,
        SignatureType::ContentHash => content_signature(conn, tables, page_size).await,
        SignatureType::Auto => match log_signature(conn).await {
            Ok(signature) => Ok(signature),
            Err(e) if e.is_detection_unavailable() => {
                tracing::debug!("{}; falling back to content hash", e);
                content_signature(conn, tables, page_size).await
            }
            Err(e) => Err(e),
        },
    }
}

async fn log_signature(conn: &mut dyn Connection) -> Result<DatabaseSignature> {
    let position = conn.log_position().await?;
    Ok(DatabaseSignature::LogPosition {
        file: position.file,
        offset: position.offset,
    })
}

/// Order-independent digest of every row of `tables`.
///
/// Per table: XOR of the keyed row digests plus the row count. The database
/// digest hashes the `table:count:hex` lines in table-name order. Tables
/// without a primary key are left out.
async fn content_signature(
    conn: &mut dyn Connection,
    tables: &[TableSpec],
    page_size: usize,
) -> Result<DatabaseSignature> {
    let mut lines = Vec::with_capacity(tables.len());

    // Keyless tables cannot be paged in key order and are never synced.
    for table in tables.iter().filter(|t| !t.primary_key.is_empty()) {
        let mut acc: RowHash = [0u8; 32];
        let mut count: u64 = 0;
        let mut after = None;

        loop {
            let page = conn.fetch_signatures(table, after.as_ref(), page_size).await?;
            for row in &page {
                for (a, b) in acc.iter_mut().zip(row.keyed_digest()) {
                    *a ^= b;
                }
            }
            count += page.len() as u64;
            let full = page.len() == page_size;
            after = page.into_iter().last().map(|s| s.key);
            if !full {
                break;
            }
        }

        lines.push(format!("{}:{}:{}", table.name, count, hex(&acc)));
    }

    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    Ok(DatabaseSignature::ContentHash {
        digest: format!("{:x}", hasher.finalize()),
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Check whether the source changed since the last committed signature of
/// this (source, target) pair.
///
/// Connects to both sides to resolve the tracked tables (common tables passing
/// the filter). The signature is computed on the source only and is not
/// persisted; call [`Detection::commit`] to make it the new baseline.
pub async fn has_changes(
    source: &dyn Database,
    target: &dyn Database,
    options: &SyncOptions,
    store: &StateStore,
) -> Result<Detection> {
    let filter = TableFilter::from_options(options);

    let mut source_conn = source.connect().await?;
    let source_tables = source_conn.list_tables().await?;
    let target_tables = {
        let mut target_conn = target.connect().await?;
        target_conn.list_tables().await?
    };

    let names = filter.resolve(
        source_tables.iter().map(|t| t.name.as_str()),
        target_tables.iter().map(|t| t.name.as_str()),
    );
    let tracked: Vec<TableSpec> = source_tables
        .into_iter()
        .filter(|t| names.contains(&t.name))
        .collect();

    let detector = ChangeDetector::new(
        store,
        &source.identity(),
        &target.identity(),
        &filter,
        options.page_size,
    );
    detector
        .check(source_conn.as_mut(), &tracked, options.signature_type)
        .await
}
