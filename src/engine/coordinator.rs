// ABOUTME: Bidirectional coordinator - runs both sync directions concurrently
// ABOUTME: Per-table (or per-run) named locks keep the directions from writing the same table at once

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

use super::scheduler::{RunStatus, SyncEngine, SyncReport};
use super::state::StateStore;
use crate::config::{BisyncOptions, LockScope, SyncOptions};
use crate::db::Database;
use crate::error::{Result, SyncError};

/// Name of the lock used when a direction locks its whole run.
pub const RUN_LOCK: &str = "*";

/// Which of the two pipelines of a bidirectional pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Database A is the source, B the target.
    Forward,
    /// Database B is the source, A the target.
    Reverse,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "a->b",
            Direction::Reverse => "b->a",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct Holders {
    current: HashMap<String, Direction>,
    acquisitions: u64,
    overlaps: u64,
    timeouts: u64,
}

/// Named locks shared by the two directions.
///
/// Locks are created on first use and never removed. Every worker holds at
/// most one lock at a time, so there is no lock ordering to get wrong.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    holders: Arc<Mutex<Holders>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    fn holders(&self) -> std::sync::MutexGuard<'_, Holders> {
        self.holders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout` for the lock named `name`.
    pub async fn acquire(&self, name: &str, direction: Direction, timeout: Duration) -> Result<LockToken> {
        let lock = self.lock_for(name);
        let started = Instant::now();

        let guard = match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                self.holders().timeouts += 1;
                return Err(SyncError::LockTimeout {
                    table: name.to_string(),
                    waited: timeout,
                });
            }
        };

        {
            let mut holders = self.holders();
            if holders.current.insert(name.to_string(), direction).is_some() {
                holders.overlaps += 1;
            }
            holders.acquisitions += 1;
        }

        let waited = started.elapsed();
        if waited > Duration::from_millis(100) {
            tracing::debug!("[{}] {} waited {:?} for the lock", name, direction, waited);
        }

        Ok(LockToken {
            name: name.to_string(),
            direction,
            holders: self.holders.clone(),
            _guard: guard,
        })
    }

    /// Direction currently holding `name`, if any.
    pub fn holder(&self, name: &str) -> Option<Direction> {
        self.holders().current.get(name).copied()
    }

    pub fn acquisitions(&self) -> u64 {
        self.holders().acquisitions
    }

    /// Times a lock was granted while the registry still recorded another holder.
    pub fn overlaps(&self) -> u64 {
        self.holders().overlaps
    }

    pub fn timeouts(&self) -> u64 {
        self.holders().timeouts
    }
}

/// A held lock. Released when dropped, whatever happened while it was held.
#[derive(Debug)]
pub struct LockToken {
    name: String,
    direction: Direction,
    holders: Arc<Mutex<Holders>>,
    _guard: OwnedMutexGuard<()>,
}

impl LockToken {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        // Runs before `_guard` is dropped, so the holder entry is gone by the
        // time the next waiter gets the lock.
        let mut holders = self.holders.lock().unwrap_or_else(|e| e.into_inner());
        holders.current.remove(&self.name);
    }
}

/// How a sync engine takes table locks in bidirectional mode.
#[derive(Debug, Clone)]
pub struct TableLocks {
    pub registry: Arc<LockRegistry>,
    pub direction: Direction,
    pub timeout: Duration,
}

/// Results of one coordinated pass.
#[derive(Debug)]
pub struct BidirectionalReport {
    pub forward: SyncReport,
    pub reverse: SyncReport,
}

impl BidirectionalReport {
    /// The worse of the two directions' statuses.
    pub fn status(&self) -> RunStatus {
        std::cmp::max(self.forward.status, self.reverse.status)
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Success
    }
}

/// Runs `a -> b` and `b -> a` concurrently over one pair of databases.
///
/// With [`LockScope::Table`] each worker locks a table for its diff and apply,
/// so the directions interleave on different tables. With [`LockScope::Run`]
/// a direction locks for its whole run and the two runs serialize.
///
/// Conflict policy: the direction that locks a table first applies its diff
/// first, deletes included. The other direction then diffs the result, so
/// a row changed on both sides since the last pass ends up with the value of
/// the first writer on both sides. There is no field-level merge.
pub struct BidirectionalCoordinator {
    a: Arc<dyn Database>,
    b: Arc<dyn Database>,
    options: SyncOptions,
    bisync: BisyncOptions,
    store: Option<Arc<StateStore>>,
    registry: Arc<LockRegistry>,
}

impl BidirectionalCoordinator {
    pub fn new(a: Arc<dyn Database>, b: Arc<dyn Database>, options: SyncOptions, bisync: BisyncOptions) -> Self {
        Self {
            a,
            b,
            options,
            bisync,
            store: None,
            registry: Arc::new(LockRegistry::new()),
        }
    }

    pub fn with_state_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> Arc<LockRegistry> {
        self.registry.clone()
    }

    fn engine(&self, direction: Direction) -> SyncEngine {
        let (source, target) = match direction {
            Direction::Forward => (self.a.clone(), self.b.clone()),
            Direction::Reverse => (self.b.clone(), self.a.clone()),
        };
        let mut engine = SyncEngine::new(source, target, self.options.clone());
        if let Some(store) = &self.store {
            engine = engine.with_state_store(store.clone());
        }
        if self.bisync.lock_scope == LockScope::Table {
            engine = engine.with_locks(TableLocks {
                registry: self.registry.clone(),
                direction,
                timeout: self.bisync.lock_timeout,
            });
        }
        engine
    }

    async fn run_direction(&self, direction: Direction) -> SyncReport {
        let engine = self.engine(direction);
        match self.bisync.lock_scope {
            LockScope::Table => engine.run().await,
            LockScope::Run => {
                let started = Instant::now();
                match self
                    .registry
                    .acquire(RUN_LOCK, direction, self.bisync.lock_timeout)
                    .await
                {
                    Ok(_token) => engine.run().await,
                    Err(e) => {
                        tracing::warn!("[{}] {}", direction, e);
                        SyncReport::failed(e, started.elapsed(), self.options.dry_run)
                    }
                }
            }
        }
    }

    /// Run both directions once, concurrently.
    pub async fn run_once(&self) -> BidirectionalReport {
        tracing::info!(
            "Starting bidirectional pass (lock scope: {:?}, lock timeout: {:?})",
            self.bisync.lock_scope,
            self.bisync.lock_timeout
        );
        let (forward, reverse) = tokio::join!(
            self.run_direction(Direction::Forward),
            self.run_direction(Direction::Reverse)
        );
        tracing::info!(
            "Bidirectional pass finished: a->b {:?}, b->a {:?}",
            forward.status,
            reverse.status
        );

        self.refresh_baselines(&forward, &reverse).await;
        BidirectionalReport { forward, reverse }
    }

    async fn refresh_baselines(&self, forward: &SyncReport, reverse: &SyncReport) {
        self.refresh_baseline(Direction::Reverse, forward, reverse).await;
        self.refresh_baseline(Direction::Forward, reverse, forward).await;
    }

    /// After `writer` committed rows into the source of `direction`, store
    /// that source's current signature as the baseline of `direction`.
    /// Otherwise the next pass would see the sync's own writes as a change
    /// and mirror them back over newer edits on the other side.
    ///
    /// A direction that did not succeed keeps its old baseline and re-diffs
    /// everything next pass.
    async fn refresh_baseline(&self, direction: Direction, writer: &SyncReport, own: &SyncReport) {
        if self.store.is_none() || !self.options.change_detector || !writer.wrote_rows() {
            return;
        }
        if !own.is_success() {
            return;
        }
        if let Err(e) = self.engine(direction).rebaseline().await {
            tracing::warn!("[{}] Failed to refresh baseline: {}", direction, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignatureType;
    use crate::db::testing::MemoryDatabase;
    use crate::db::{ColumnSpec, Row, TableSpec, Value};

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released_on_drop() {
        let registry = LockRegistry::new();
        let token = registry
            .acquire("orders", Direction::Forward, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(registry.holder("orders"), Some(Direction::Forward));

        let err = registry
            .acquire("orders", Direction::Reverse, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
        assert_eq!(registry.timeouts(), 1);

        drop(token);
        assert_eq!(registry.holder("orders"), None);
        let token = registry
            .acquire("orders", Direction::Reverse, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(token.direction(), Direction::Reverse);
    }

    #[tokio::test]
    async fn test_independent_tables_do_not_block() {
        let registry = LockRegistry::new();
        let _orders = registry
            .acquire("orders", Direction::Forward, Duration::from_millis(20))
            .await
            .unwrap();
        let customers = registry
            .acquire("customers", Direction::Reverse, Duration::from_millis(20))
            .await;
        assert!(customers.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let registry = Arc::new(LockRegistry::new());
        let token = registry
            .acquire("orders", Direction::Forward, Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .acquire("orders", Direction::Reverse, Duration::from_secs(5))
                    .await
                    .map(|t| t.direction())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(token);

        assert_eq!(waiter.await.unwrap().unwrap(), Direction::Reverse);
        assert_eq!(registry.overlaps(), 0);
        assert_eq!(registry.acquisitions(), 2);
    }

    fn notes() -> TableSpec {
        TableSpec::new(
            "notes",
            vec![ColumnSpec::new("id", "int"), ColumnSpec::new("body", "text")],
            vec!["id".to_string()],
        )
    }

    fn note(id: i64, body: &str) -> Row {
        vec![Value::Int(id), Value::from(body)]
    }

    #[tokio::test]
    async fn test_bidirectional_pass_converges() {
        let a = MemoryDatabase::new("a");
        a.add_table(notes(), vec![note(1, "from a")]);
        let b = MemoryDatabase::new("b");
        b.add_table(notes(), vec![note(1, "from a"), note(2, "from b")]);

        let coordinator = BidirectionalCoordinator::new(
            a.clone(),
            b.clone(),
            SyncOptions::default(),
            BisyncOptions::default(),
        );
        let report = coordinator.run_once().await;
        assert!(report.is_success());

        // Whichever direction locked first wins: both sides converge.
        assert_eq!(a.rows("notes"), b.rows("notes"));
        assert_eq!(coordinator.registry().acquisitions(), 2);
        assert_eq!(coordinator.registry().overlaps(), 0);
    }

    /// One pass with the directions in a fixed order, reverse first.
    async fn reverse_then_forward(coordinator: &BidirectionalCoordinator) -> BidirectionalReport {
        let reverse = coordinator.run_direction(Direction::Reverse).await;
        let forward = coordinator.run_direction(Direction::Forward).await;
        coordinator.refresh_baselines(&forward, &reverse).await;
        BidirectionalReport { forward, reverse }
    }

    #[tokio::test]
    async fn test_synced_rows_are_not_mirrored_back_over_new_edits() {
        let dir = tempfile::tempdir().unwrap();
        let a = MemoryDatabase::new("a");
        a.add_table(notes(), vec![note(1, "old")]);
        let b = MemoryDatabase::new("b");
        b.add_table(notes(), vec![note(1, "old")]);

        let options = SyncOptions {
            signature_type: SignatureType::ContentHash,
            ..Default::default()
        };
        let coordinator =
            BidirectionalCoordinator::new(a.clone(), b.clone(), options, BisyncOptions::default())
                .with_state_store(Arc::new(StateStore::new(dir.path().join("state.json"))));

        assert!(reverse_then_forward(&coordinator).await.is_success());

        a.put("notes", note(2, "new"));
        let second = reverse_then_forward(&coordinator).await;
        assert!(second.reverse.skipped_unchanged);
        assert_eq!(second.forward.totals(), (1, 0, 0));

        // B changed only through a->b, so b->a must not treat it as new.
        a.put("notes", note(1, "user edit"));
        let third = reverse_then_forward(&coordinator).await;
        assert!(third.reverse.skipped_unchanged);
        assert_eq!(third.reverse.totals(), (0, 0, 0));
        assert_eq!(third.forward.totals(), (0, 1, 0));

        assert_eq!(a.rows("notes"), vec![note(1, "user edit"), note(2, "new")]);
        assert_eq!(b.rows("notes"), a.rows("notes"));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_baselines_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().join("state.json")));
        let a = MemoryDatabase::new("a");
        a.add_table(notes(), vec![note(1, "x")]);
        let b = MemoryDatabase::new("b");
        b.add_table(notes(), vec![]);

        let options = SyncOptions {
            dry_run: true,
            signature_type: SignatureType::ContentHash,
            ..Default::default()
        };
        let coordinator =
            BidirectionalCoordinator::new(a.clone(), b.clone(), options, BisyncOptions::default())
                .with_state_store(store.clone());
        let report = coordinator.run_once().await;

        assert!(report.is_success());
        assert!(!report.forward.wrote_rows());
        assert!(!store.path().exists());
        assert!(b.rows("notes").is_empty());
    }

    #[tokio::test]
    async fn test_run_scope_serializes_directions() {
        let a = MemoryDatabase::new("a");
        a.add_table(notes(), vec![note(1, "x")]);
        let b = MemoryDatabase::new("b");
        b.add_table(notes(), vec![]);

        let bisync = BisyncOptions {
            lock_scope: LockScope::Run,
            ..Default::default()
        };
        let coordinator = BidirectionalCoordinator::new(a.clone(), b.clone(), SyncOptions::default(), bisync);
        let report = coordinator.run_once().await;

        assert!(report.is_success());
        assert_eq!(coordinator.registry().acquisitions(), 2);
        assert_eq!(a.rows("notes"), b.rows("notes"));
    }

    #[tokio::test]
    async fn test_lock_timeout_fails_only_that_table() {
        let a = MemoryDatabase::new("a");
        a.add_table(notes(), vec![note(1, "x")]);
        let b = MemoryDatabase::new("b");
        b.add_table(notes(), vec![]);

        let bisync = BisyncOptions {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let coordinator = BidirectionalCoordinator::new(a.clone(), b.clone(), SyncOptions::default(), bisync);
        let registry = coordinator.registry();
        let held = registry
            .acquire("notes", Direction::Forward, Duration::from_millis(10))
            .await
            .unwrap();

        let report = coordinator.run_once().await;
        drop(held);

        for direction in [&report.forward, &report.reverse] {
            assert_eq!(direction.status, RunStatus::Partial);
            assert!(matches!(
                direction.tables["notes"].error,
                Some(SyncError::LockTimeout { .. })
            ));
        }
        assert!(b.rows("notes").is_empty());
    }
}
