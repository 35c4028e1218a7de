// ABOUTME: Worker scheduler - runs diff and apply per table on a bounded pool of workers
// ABOUTME: Aggregates per-table results into a SyncReport and commits the signature on success

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use super::applier::{apply, ApplyOutcome};
use super::coordinator::TableLocks;
use super::detector::{ChangeDetector, Detection};
use super::differ::diff;
use super::state::StateStore;
use crate::config::SyncOptions;
use crate::db::{Connection, Database, TableSpec};
use crate::error::{Result, SyncError};
use crate::filters::TableFilter;

/// Outcome of one table in one run.
#[derive(Debug)]
pub struct TableResult {
    pub table: String,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub elapsed: Duration,
    pub error: Option<SyncError>,
    /// At least one batch committed before the error.
    pub partially_applied: bool,
}

impl TableResult {
    /// Zero-count result of a table skipped because nothing changed.
    pub fn unchanged(table: &str) -> Self {
        Self {
            table: table.to_string(),
            inserted: 0,
            updated: 0,
            deleted: 0,
            elapsed: Duration::ZERO,
            error: None,
            partially_applied: false,
        }
    }

    fn failed(table: &str, error: SyncError, elapsed: Duration) -> Self {
        Self {
            elapsed,
            error: Some(error),
            ..Self::unchanged(table)
        }
    }

    fn from_outcome(table: &str, outcome: ApplyOutcome, elapsed: Duration) -> Self {
        let partially_applied = outcome.is_partial();
        Self {
            table: table.to_string(),
            inserted: outcome.inserted,
            updated: outcome.updated,
            deleted: outcome.deleted,
            elapsed,
            error: outcome.error,
            partially_applied,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn rows(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Whole-run outcome, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunStatus {
    /// Every table succeeded (or the run was skipped as unchanged).
    Success,
    /// At least one table errored; the others were still synced.
    Partial,
    /// The run stopped before any table started.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        })
    }
}

/// Aggregated result of one sync run.
#[derive(Debug)]
pub struct SyncReport {
    pub status: RunStatus,
    /// Every attempted table, by name.
    pub tables: BTreeMap<String, TableResult>,
    /// Change detection found nothing to do.
    pub skipped_unchanged: bool,
    /// Error that stopped the run before any table started.
    pub failure: Option<SyncError>,
    pub elapsed: Duration,
    pub dry_run: bool,
}

impl SyncReport {
    pub fn failed(error: SyncError, elapsed: Duration, dry_run: bool) -> Self {
        Self {
            status: RunStatus::Failed,
            tables: BTreeMap::new(),
            skipped_unchanged: false,
            failure: Some(error),
            elapsed,
            dry_run,
        }
    }

    fn from_tables(tables: BTreeMap<String, TableResult>, elapsed: Duration, dry_run: bool) -> Self {
        let status = if tables.values().all(TableResult::is_success) {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };
        Self {
            status,
            tables,
            skipped_unchanged: false,
            failure: None,
            elapsed,
            dry_run,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Rows were committed to the target. Never true for a dry run.
    pub fn wrote_rows(&self) -> bool {
        !self.dry_run && self.tables.values().any(|t| t.rows() > 0)
    }

    /// Tables that ended with an error.
    pub fn failed_tables(&self) -> Vec<&TableResult> {
        self.tables.values().filter(|t| t.error.is_some()).collect()
    }

    /// Total (inserted, updated, deleted) over every table.
    pub fn totals(&self) -> (u64, u64, u64) {
        self.tables.values().fold((0, 0, 0), |(i, u, d), t| {
            (i + t.inserted, u + t.updated, d + t.deleted)
        })
    }

    /// Log one line per table and a run summary.
    pub fn log_summary(&self) {
        if let Some(failure) = &self.failure {
            tracing::error!("Sync failed: {}", failure);
            return;
        }
        if self.skipped_unchanged {
            tracing::info!("No changes detected; {} tables skipped", self.tables.len());
            return;
        }

        for result in self.tables.values() {
            match &result.error {
                None => tracing::info!(
                    "[{}] inserted: {}, updated: {}, deleted: {} ({:.2}s)",
                    result.table,
                    result.inserted,
                    result.updated,
                    result.deleted,
                    result.elapsed.as_secs_f64()
                ),
                Some(e) => tracing::warn!(
                    "[{}] failed{}: {}",
                    result.table,
                    if result.partially_applied { " after partial apply" } else { "" },
                    e
                ),
            }
        }

        let (inserted, updated, deleted) = self.totals();
        tracing::info!(
            "{}Sync {} in {:.2}s: {} tables, {} failed | insert: {}, update: {}, delete: {}",
            if self.dry_run { "[DRY RUN] " } else { "" },
            self.status,
            self.elapsed.as_secs_f64(),
            self.tables.len(),
            self.failed_tables().len(),
            inserted,
            updated,
            deleted
        );
    }
}

/// One table to sync, with both sides' introspected schemas.
#[derive(Debug, Clone)]
struct TableJob {
    name: String,
    source: TableSpec,
    target: TableSpec,
}

/// Tables to sync plus the detection to commit after a successful run.
struct Plan {
    jobs: Vec<TableJob>,
    detection: Option<Detection>,
}

/// One-directional sync of `source` onto `target`.
///
/// A run connects to both sides, resolves the common tables, optionally
/// short-circuits on change detection, then fans the tables out to a fixed
/// pool of workers. Each worker holds its own pair of connections.
pub struct SyncEngine {
    source: Arc<dyn Database>,
    target: Arc<dyn Database>,
    options: Arc<SyncOptions>,
    store: Option<Arc<StateStore>>,
    locks: Option<TableLocks>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn Database>, target: Arc<dyn Database>, options: SyncOptions) -> Self {
        Self {
            source,
            target,
            options: Arc::new(options),
            store: None,
            locks: None,
        }
    }

    /// Enable change detection against `store` (when `change_detector` is set).
    pub fn with_state_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Lock each table in `locks` before diffing it.
    pub fn with_locks(mut self, locks: TableLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Run one sync pass. Never panics on database errors: every failure is in the report.
    pub async fn run(&self) -> SyncReport {
        let started = Instant::now();
        let dry_run = self.options.dry_run;

        tracing::info!(
            "{}Syncing {} -> {}",
            if dry_run { "[DRY RUN] " } else { "" },
            self.source.identity(),
            self.target.identity()
        );

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!("Sync stopped before any table started: {}", e);
                return SyncReport::failed(e, started.elapsed(), dry_run);
            }
        };

        if let Some(detection) = plan.detection.as_ref().filter(|d| !d.changed) {
            tracing::info!(
                "Source unchanged since last sync ({}); skipping {} tables",
                detection.signature,
                plan.jobs.len()
            );
            let tables = plan
                .jobs
                .iter()
                .map(|job| (job.name.clone(), TableResult::unchanged(&job.name)))
                .collect();
            let mut report = SyncReport::from_tables(tables, started.elapsed(), dry_run);
            report.skipped_unchanged = true;
            return report;
        }

        let tables = self.run_workers(plan.jobs).await;
        let report = SyncReport::from_tables(tables, started.elapsed(), dry_run);

        if report.is_success() && !dry_run {
            if let (Some(detection), Some(store)) = (&plan.detection, &self.store) {
                // The rows are synced either way; a lost baseline only costs a re-check.
                if let Err(e) = detection.commit(store).await {
                    tracing::error!("Failed to save sync state: {}", e);
                }
            }
        } else if !report.is_success() {
            tracing::warn!("Sync state not updated: {} tables failed", report.failed_tables().len());
        }

        report
    }

    /// Connect and introspect both sides, resolve the tables, run detection.
    async fn plan(&self) -> Result<Plan> {
        let (mut source, jobs, filter) = self.resolve().await?;
        let detection = self.detect(source.as_mut(), &jobs, &filter).await?;
        Ok(Plan { jobs, detection })
    }

    /// Store the source's current signature as this pair's baseline, without
    /// syncing. Does nothing when detection is off or in dry-run mode.
    ///
    /// Used after the opposite direction wrote into this direction's source,
    /// so those writes are not mistaken for new changes on the next pass.
    pub async fn rebaseline(&self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let (mut source, jobs, filter) = self.resolve().await?;
        if let Some(detection) = self.detect(source.as_mut(), &jobs, &filter).await? {
            detection.commit(store).await?;
            tracing::debug!("Baseline for {} refreshed to {}", self.source.identity(), detection.signature);
        }
        Ok(())
    }

    /// Connect to both sides and resolve the tables common to them.
    async fn resolve(&self) -> Result<(Box<dyn Connection>, Vec<TableJob>, TableFilter)> {
        self.options.validate()?;
        let filter = TableFilter::from_options(&self.options);

        let mut source = self.source.connect().await?;
        let source_tables = source.list_tables().await?;
        let target_tables = {
            let mut target = self.target.connect().await?;
            target.list_tables().await?
        };

        let names = filter.resolve(
            source_tables.iter().map(|t| t.name.as_str()),
            target_tables.iter().map(|t| t.name.as_str()),
        );
        let mut target_by_name: BTreeMap<String, TableSpec> = target_tables
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        let jobs: Vec<TableJob> = source_tables
            .into_iter()
            .filter(|t| names.contains(&t.name))
            .filter_map(|source| {
                let target = target_by_name.remove(&source.name)?;
                Some(TableJob {
                    name: source.name.clone(),
                    source,
                    target,
                })
            })
            .collect();

        tracing::info!("Resolved {} tables to sync", jobs.len());
        Ok((source, jobs, filter))
    }

    async fn detect(
        &self,
        source: &mut dyn Connection,
        jobs: &[TableJob],
        filter: &TableFilter,
    ) -> Result<Option<Detection>> {
        let Some(store) = self.store.as_ref().filter(|_| self.options.change_detector) else {
            return Ok(None);
        };
        if self.options.dry_run {
            tracing::info!("[DRY RUN] Change detection bypassed");
            return Ok(None);
        }

        let tables: Vec<TableSpec> = jobs.iter().map(|job| job.source.clone()).collect();
        let detector = ChangeDetector::new(
            store,
            &self.source.identity(),
            &self.target.identity(),
            filter,
            self.options.page_size,
        );
        match detector
            .check(source, &tables, self.options.signature_type)
            .await
        {
            Ok(detection) => Ok(Some(detection)),
            Err(e) if e.is_detection_unavailable() => {
                tracing::warn!("{}; running a full sync without change detection", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_workers(&self, jobs: Vec<TableJob>) -> BTreeMap<String, TableResult> {
        let workers = self.options.effective_workers(jobs.len());
        let names: Vec<String> = jobs.iter().map(|job| job.name.clone()).collect();
        tracing::info!("Syncing {} tables with {} workers", jobs.len(), workers);

        let (job_tx, job_rx) = mpsc::unbounded_channel::<TableJob>();
        for job in jobs {
            // The receiver is alive until the workers exit.
            let _ = job_tx.send(job);
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<TableResult>();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker = Worker {
                id,
                source: self.source.clone(),
                target: self.target.clone(),
                options: self.options.clone(),
                locks: self.locks.clone(),
            };
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            handles.push(tokio::spawn(worker.run(jobs, results)));
        }
        drop(result_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Sync worker task failed: {}", e);
            }
        }

        let mut tables = BTreeMap::new();
        while let Some(result) = result_rx.recv().await {
            tables.insert(result.table.clone(), result);
        }

        // A worker that panicked mid-table never reported it.
        for name in names {
            tables.entry(name.clone()).or_insert_with(|| {
                TableResult::failed(
                    &name,
                    SyncError::query(format!("sync of {}", name), "worker task aborted"),
                    Duration::ZERO,
                )
            });
        }

        tables
    }
}

struct Worker {
    id: usize,
    source: Arc<dyn Database>,
    target: Arc<dyn Database>,
    options: Arc<SyncOptions>,
    locks: Option<TableLocks>,
}

type ConnectionPair = (Box<dyn Connection>, Box<dyn Connection>);

impl Worker {
    async fn run(
        self,
        jobs: Arc<Mutex<mpsc::UnboundedReceiver<TableJob>>>,
        results: mpsc::UnboundedSender<TableResult>,
    ) {
        let mut connections: Option<ConnectionPair> = None;
        loop {
            let job = jobs.lock().await.recv().await;
            let Some(job) = job else { break };

            tracing::debug!("Worker {} picked up {}", self.id, job.name);
            let result = self.sync_table(&job, &mut connections).await;
            if results.send(result).is_err() {
                break;
            }
        }
    }

    async fn sync_table(&self, job: &TableJob, connections: &mut Option<ConnectionPair>) -> TableResult {
        let started = Instant::now();

        let _token = match &self.locks {
            Some(locks) => {
                match locks
                    .registry
                    .acquire(&job.name, locks.direction, locks.timeout)
                    .await
                {
                    Ok(token) => Some(token),
                    Err(e) => {
                        tracing::warn!("[{}] {} skipped: {}", job.name, locks.direction, e);
                        return TableResult::failed(&job.name, e, started.elapsed());
                    }
                }
            }
            None => None,
        };

        match self.diff_and_apply(job, connections).await {
            Ok(outcome) => {
                if let Some(e) = &outcome.error {
                    tracing::warn!("[{}] {}", job.name, e);
                }
                TableResult::from_outcome(&job.name, outcome, started.elapsed())
            }
            Err(e) => {
                tracing::warn!("[{}] {}", job.name, e);
                TableResult::failed(&job.name, e, started.elapsed())
            }
        }
    }

    /// Connections are reused across tables and dropped after any error, so a
    /// broken session never carries over to the next table.
    async fn diff_and_apply(&self, job: &TableJob, connections: &mut Option<ConnectionPair>) -> Result<ApplyOutcome> {
        let (mut source, mut target) = match connections.take() {
            Some(pair) => pair,
            None => (self.source.connect().await?, self.target.connect().await?),
        };

        let changes = diff(
            &job.source,
            &job.target,
            source.as_mut(),
            target.as_mut(),
            self.options.page_size,
        )
        .await?;

        tracing::info!(
            "[{}] Planned changes | insert: {}, update: {}, delete: {}",
            job.name,
            changes.inserts.len(),
            changes.updates.len(),
            changes.deletes.len()
        );

        let outcome = apply(&changes, target.as_mut(), &self.options).await?;
        if outcome.error.is_none() {
            *connections = Some((source, target));
        }
        Ok(outcome)
    }
}

/// Sync `source` onto `target` once.
///
/// With a `store`, the run is skipped when the source signature matches the
/// last one committed for this pair, and the new signature is committed after
/// a fully successful run.
pub async fn sync(
    source: Arc<dyn Database>,
    target: Arc<dyn Database>,
    options: SyncOptions,
    store: Option<Arc<StateStore>>,
) -> SyncReport {
    let mut engine = SyncEngine::new(source, target, options);
    if let Some(store) = store {
        engine = engine.with_state_store(store);
    }
    engine.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureType;
    use crate::db::testing::MemoryDatabase;
    use crate::db::{ColumnSpec, Row, Value};
    use tempfile::TempDir;

    fn table(name: &str) -> TableSpec {
        TableSpec::new(
            name,
            vec![ColumnSpec::new("id", "int"), ColumnSpec::new("val", "text")],
            vec!["id".to_string()],
        )
    }

    fn row(id: i64, val: &str) -> Row {
        vec![Value::Int(id), Value::from(val)]
    }

    /// Source with three tables; target with stale copies of them.
    fn pair() -> (Arc<MemoryDatabase>, Arc<MemoryDatabase>) {
        let source = MemoryDatabase::new("src");
        let target = MemoryDatabase::new("dst");
        for name in ["customers", "orders", "items"] {
            source.add_table(table(name), vec![row(1, "a"), row(2, "b"), row(3, "c")]);
            target.add_table(table(name), vec![row(1, "a"), row(2, "stale"), row(9, "gone")]);
        }
        (source, target)
    }

    fn options() -> SyncOptions {
        SyncOptions {
            signature_type: SignatureType::ContentHash,
            max_workers: Some(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sync_converges_every_table() {
        let (source, target) = pair();
        let report = sync(source.clone(), target.clone(), options(), None).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.tables.len(), 3);
        for name in ["customers", "orders", "items"] {
            assert_eq!(source.rows(name), target.rows(name));
            let result = &report.tables[name];
            assert_eq!((result.inserted, result.updated, result.deleted), (1, 1, 1));
        }
        assert_eq!(report.totals(), (3, 3, 3));
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let (source, target) = pair();
        sync(source.clone(), target.clone(), options(), None).await;
        let batches = target.state().batches.len();

        let report = sync(source.clone(), target.clone(), options(), None).await;
        assert!(report.is_success());
        assert_eq!(report.totals(), (0, 0, 0));
        assert_eq!(target.state().batches.len(), batches);
    }

    #[tokio::test]
    async fn test_failing_table_is_isolated() {
        let (source, target) = pair();
        target.state().failing_tables.insert("orders".to_string());

        let report = sync(source.clone(), target.clone(), options(), None).await;
        assert_eq!(report.status, RunStatus::Partial);
        assert!(matches!(
            report.tables["orders"].error,
            Some(SyncError::BatchApply { .. })
        ));
        assert_eq!(report.failed_tables().len(), 1);
        assert_eq!(source.rows("customers"), target.rows("customers"));
        assert_eq!(source.rows("items"), target.rows("items"));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_per_table() {
        let (source, target) = pair();
        target.add_table(
            TableSpec::new("orders", vec![ColumnSpec::new("id", "int")], vec!["id".to_string()]),
            vec![],
        );

        let report = sync(source.clone(), target.clone(), options(), None).await;
        assert_eq!(report.status, RunStatus::Partial);
        assert!(matches!(
            report.tables["orders"].error,
            Some(SyncError::SchemaMismatch { .. })
        ));
        assert!(report.tables["items"].is_success());
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_run() {
        let (source, target) = pair();
        target.state().unreachable = true;

        let report = sync(source, target, options(), None).await;
        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.tables.is_empty());
        assert!(matches!(report.failure, Some(SyncError::Connectivity { .. })));
    }

    #[tokio::test]
    async fn test_invalid_options_fail_run() {
        let (source, target) = pair();
        let report = sync(
            source,
            target,
            SyncOptions {
                batch_size: 0,
                ..options()
            },
            None,
        )
        .await;
        assert!(matches!(report.failure, Some(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_unchanged_source_skips_run() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (source, target) = pair();

        let first = sync(source.clone(), target.clone(), options(), Some(store.clone())).await;
        assert!(first.is_success());
        assert!(!first.skipped_unchanged);

        // A target-side edit is invisible to the source signature.
        target.put("orders", row(1, "edited on target"));
        let batches = target.state().batches.len();

        let second = sync(source.clone(), target.clone(), options(), Some(store.clone())).await;
        assert!(second.skipped_unchanged);
        assert_eq!(second.tables.len(), 3);
        assert_eq!(second.totals(), (0, 0, 0));
        assert_eq!(target.state().batches.len(), batches);

        source.put("items", row(4, "d"));
        let third = sync(source.clone(), target.clone(), options(), Some(store)).await;
        assert!(!third.skipped_unchanged);
        assert_eq!(third.tables["items"].inserted, 1);
    }

    #[tokio::test]
    async fn test_partial_run_does_not_commit_signature() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (source, target) = pair();
        target.state().failing_tables.insert("orders".to_string());

        let report = sync(source.clone(), target.clone(), options(), Some(store.clone())).await;
        assert_eq!(report.status, RunStatus::Partial);
        assert!(!store.path().exists());

        target.state().failing_tables.clear();
        let retry = sync(source.clone(), target.clone(), options(), Some(store)).await;
        assert!(!retry.skipped_unchanged);
        assert!(retry.is_success());
        assert_eq!(source.rows("orders"), target.rows("orders"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing_and_matches_real_counts() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (source, target) = pair();
        let before: Vec<Row> = target.rows("orders");

        let dry = sync(
            source.clone(),
            target.clone(),
            SyncOptions {
                dry_run: true,
                ..options()
            },
            Some(store.clone()),
        )
        .await;
        assert!(dry.dry_run);
        assert!(target.state().batches.is_empty());
        assert_eq!(target.rows("orders"), before);
        assert!(!store.path().exists());

        let real = sync(source, target, options(), Some(store)).await;
        assert_eq!(dry.totals(), real.totals());
    }

    #[tokio::test]
    async fn test_explicit_log_position_unavailable_falls_through_to_full_sync() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let (source, target) = pair();

        let report = sync(
            source.clone(),
            target.clone(),
            SyncOptions {
                signature_type: SignatureType::LogPosition,
                ..options()
            },
            Some(store.clone()),
        )
        .await;
        assert!(report.is_success());
        assert!(!report.skipped_unchanged);
        assert!(!store.path().exists());
        assert_eq!(source.rows("orders"), target.rows("orders"));
    }

    #[tokio::test]
    async fn test_include_filter_limits_tables() {
        let (source, target) = pair();
        let report = sync(
            source,
            target.clone(),
            SyncOptions {
                include: Some(vec!["orders".to_string()]),
                ..options()
            },
            None,
        )
        .await;
        assert_eq!(report.tables.keys().collect::<Vec<_>>(), vec!["orders"]);
        assert_eq!(target.rows("items").len(), 3);
        assert!(target.rows("items").contains(&row(9, "gone")));
    }

    #[test]
    fn test_status_ordering() {
        assert!(RunStatus::Success < RunStatus::Partial);
        assert!(RunStatus::Partial < RunStatus::Failed);
        assert_eq!(RunStatus::Partial.to_string(), "partial");
    }
}
