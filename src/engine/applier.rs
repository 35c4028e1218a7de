// ABOUTME: Batch applier - writes a ChangeSet to the target in bounded transactional batches
// ABOUTME: Handles the foreign-key toggle, dry-run logging, and partial-application reporting

use crate::config::SyncOptions;
use crate::db::{Batch, Connection};
use crate::error::{BatchPhase, Result, SyncError};

use super::differ::ChangeSet;

/// Rows committed per phase, and the batch error that stopped the table (if any).
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Batches committed (or, in dry-run, planned)
    pub batches: usize,
    pub error: Option<SyncError>,
}

impl ApplyOutcome {
    pub fn rows(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    /// Some batches committed before a later batch failed.
    pub fn is_partial(&self) -> bool {
        self.error.is_some() && self.batches > 0
    }

    fn record(&mut self, phase: BatchPhase, rows: usize) {
        let rows = rows as u64;
        match phase {
            BatchPhase::Insert => self.inserted += rows,
            BatchPhase::Update => self.updated += rows,
            BatchPhase::Delete => self.deleted += rows,
        }
        self.batches += 1;
    }
}

/// Apply `changes` to `target`.
///
/// Batches run in a fixed order (inserts, then updates, then deletes), each
/// holding at most `batch_size` rows in its own transaction. The first
/// failed batch stops the table; batches committed before it stay.
///
/// Unless `keep_fk_checks` is set, foreign-key checks are turned off for the
/// duration and the previous setting is restored afterwards, whatever the
/// outcome. In dry-run mode nothing is written and the planned batches are
/// logged; the counts equal those a real run would report.
///
/// Returns `Err` only when the connection itself fails while toggling
/// foreign-key checks; batch failures are carried in the outcome.
pub async fn apply(
    changes: &ChangeSet,
    target: &mut dyn Connection,
    options: &SyncOptions,
) -> Result<ApplyOutcome> {
    if changes.is_empty() {
        return Ok(ApplyOutcome::default());
    }
    if options.dry_run {
        return Ok(plan(changes, options.batch_size));
    }

    let restore = if options.keep_fk_checks {
        None
    } else {
        disable_fk_checks(target, &changes.table.name).await?
    };

    let mut outcome = apply_batches(changes, target, options).await;

    if let Some(previous) = restore {
        if let Err(e) = target.set_foreign_key_checks(previous).await {
            tracing::error!(
                "[{}] Failed to restore foreign key checks: {}",
                changes.table.name,
                e
            );
            if outcome.error.is_none() {
                outcome.error = Some(e);
            }
        }
    }

    Ok(outcome)
}

/// Turn foreign-key checks off, returning the setting to restore.
///
/// A server refusing the toggle (e.g. missing privilege) is logged and the
/// apply proceeds with checks on.
async fn disable_fk_checks(target: &mut dyn Connection, table: &str) -> Result<Option<bool>> {
    let previous = match target.foreign_key_checks().await {
        Ok(previous) => previous,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            tracing::warn!("[{}] Cannot read foreign key checks, leaving them as is: {}", table, e);
            return Ok(None);
        }
    };
    if !previous {
        return Ok(None);
    }
    match target.set_foreign_key_checks(false).await {
        Ok(()) => Ok(Some(previous)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            tracing::warn!("[{}] Cannot disable foreign key checks: {}", table, e);
            Ok(None)
        }
    }
}

fn batches<'a>(changes: &'a ChangeSet, batch_size: usize, insert_ignore: bool) -> Vec<Batch<'a>> {
    let size = batch_size.max(1);
    let mut batches: Vec<Batch<'a>> = Vec::new();
    batches.extend(changes.inserts.chunks(size).map(|rows| Batch::Insert {
        rows,
        ignore: insert_ignore,
    }));
    batches.extend(changes.updates.chunks(size).map(|rows| Batch::Upsert { rows }));
    batches.extend(changes.deletes.chunks(size).map(|keys| Batch::Delete { keys }));
    batches
}

async fn apply_batches(
    changes: &ChangeSet,
    target: &mut dyn Connection,
    options: &SyncOptions,
) -> ApplyOutcome {
    let table = &changes.table;
    let mut outcome = ApplyOutcome::default();

    for (index, batch) in batches(changes, options.batch_size, options.insert_ignore)
        .into_iter()
        .enumerate()
    {
        let phase = batch.phase();
        tracing::debug!("[{}] Applying {} batch {} ({} rows)", table.name, phase, index, batch.len());

        match target.apply_batch(table, batch).await {
            Ok(affected) => {
                if affected != batch.len() as u64 {
                    tracing::debug!(
                        "[{}] {} batch {}: server reported {} affected rows for {} rows",
                        table.name,
                        phase,
                        index,
                        affected,
                        batch.len()
                    );
                }
                outcome.record(phase, batch.len());
            }
            Err(e) => {
                tracing::warn!("[{}] {} batch {} rolled back: {}", table.name, phase, index, e);
                outcome.error = Some(SyncError::BatchApply {
                    table: table.name.clone(),
                    phase,
                    batch_index: index,
                    source: Box::new(e),
                });
                break;
            }
        }
    }

    outcome
}

/// Dry-run: log every batch that would be applied and count its rows.
fn plan(changes: &ChangeSet, batch_size: usize) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let mut offsets = [0usize; 3];

    for (index, batch) in batches(changes, batch_size, false).into_iter().enumerate() {
        let phase = batch.phase();
        let offset = &mut offsets[phase as usize];
        tracing::info!(
            "[{}] [DRY RUN] Would {} batch {} (rows {}..{})",
            changes.table.name,
            phase,
            index,
            *offset,
            *offset + batch.len()
        );
        *offset += batch.len();
        outcome.record(phase, batch.len());
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::MemoryDatabase;
    use crate::db::{ColumnSpec, Database, PrimaryKey, Row, TableSpec, Value};

    fn spec() -> TableSpec {
        TableSpec::new(
            "orders",
            vec![ColumnSpec::new("id", "int"), ColumnSpec::new("note", "text")],
            vec!["id".to_string()],
        )
    }

    fn row(id: i64) -> Row {
        vec![Value::Int(id), Value::from(format!("n{}", id))]
    }

    fn changes(inserts: std::ops::Range<i64>, updates: std::ops::Range<i64>, deletes: std::ops::Range<i64>) -> ChangeSet {
        ChangeSet {
            table: spec(),
            inserts: inserts.map(row).collect(),
            updates: updates.map(row).collect(),
            deletes: deletes.map(|i| PrimaryKey(vec![Value::Int(i)])).collect(),
        }
    }

    fn options(batch_size: usize) -> SyncOptions {
        SyncOptions {
            batch_size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_ordered() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), (100..110).map(row).collect());
        let mut conn = db.connect().await.unwrap();

        let outcome = apply(&changes(0..7, 100..103, 105..110), conn.as_mut(), &options(3))
            .await
            .unwrap();
        assert!(outcome.error.is_none());
        assert_eq!((outcome.inserted, outcome.updated, outcome.deleted), (7, 3, 5));

        let state = db.state();
        assert!(state.batches.iter().all(|b| b.len <= 3));
        let phases: Vec<BatchPhase> = state.batches.iter().map(|b| b.phase).collect();
        assert_eq!(
            phases,
            vec![
                BatchPhase::Insert,
                BatchPhase::Insert,
                BatchPhase::Insert,
                BatchPhase::Update,
                BatchPhase::Delete,
                BatchPhase::Delete,
            ]
        );
    }

    #[tokio::test]
    async fn test_fk_checks_disabled_then_restored() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), vec![]);
        let mut conn = db.connect().await.unwrap();

        apply(&changes(0..2, 0..0, 0..0), conn.as_mut(), &options(10)).await.unwrap();
        assert_eq!(db.state().fk_toggles, vec![false, true]);
        assert!(conn.foreign_key_checks().await.unwrap());
    }

    #[tokio::test]
    async fn test_fk_checks_restored_after_failure() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), vec![]);
        db.state().failing_tables.insert("orders".to_string());
        let mut conn = db.connect().await.unwrap();

        let outcome = apply(&changes(0..5, 0..0, 0..0), conn.as_mut(), &options(2))
            .await
            .unwrap();
        assert!(matches!(
            outcome.error,
            Some(SyncError::BatchApply { batch_index: 0, phase: BatchPhase::Insert, .. })
        ));
        assert!(!outcome.is_partial());
        assert_eq!(db.state().fk_toggles, vec![false, true]);
    }

    #[tokio::test]
    async fn test_keep_fk_checks_never_toggles() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), vec![]);
        let mut conn = db.connect().await.unwrap();
        let opts = SyncOptions {
            keep_fk_checks: true,
            ..options(10)
        };

        apply(&changes(0..2, 0..0, 0..0), conn.as_mut(), &opts).await.unwrap();
        assert!(db.state().fk_toggles.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_stops_table_and_keeps_earlier_batches() {
        let db = MemoryDatabase::new("dst");
        // Row 4 already exists, so the second insert batch (3, 4, 5) hits a duplicate key.
        db.add_table(spec(), vec![row(4)]);
        let mut conn = db.connect().await.unwrap();

        let outcome = apply(&changes(0..6, 0..0, 4..5), conn.as_mut(), &options(3))
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.deleted, 0);
        assert!(outcome.is_partial());
        assert!(matches!(
            outcome.error,
            Some(SyncError::BatchApply { batch_index: 1, .. })
        ));

        let keys: Vec<PrimaryKey> = db.keys("orders");
        assert_eq!(keys.len(), 4);
        assert_eq!(db.state().batches.len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_writing() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), (100..104).map(row).collect());
        let mut conn = db.connect().await.unwrap();
        let opts = SyncOptions {
            dry_run: true,
            ..options(2)
        };

        let set = changes(0..5, 100..102, 102..104);
        let planned = apply(&set, conn.as_mut(), &opts).await.unwrap();
        assert_eq!((planned.inserted, planned.updated, planned.deleted), (5, 2, 2));
        assert_eq!(planned.batches, 3 + 1 + 1);
        assert!(db.state().batches.is_empty());
        assert!(db.state().fk_toggles.is_empty());
        assert_eq!(db.rows("orders").len(), 4);

        let real = apply(&set, conn.as_mut(), &options(2)).await.unwrap();
        assert_eq!(
            (real.inserted, real.updated, real.deleted),
            (planned.inserted, planned.updated, planned.deleted)
        );
    }

    #[tokio::test]
    async fn test_insert_ignore_skips_existing_keys() {
        let db = MemoryDatabase::new("dst");
        db.add_table(spec(), vec![row(1)]);
        let mut conn = db.connect().await.unwrap();
        let opts = SyncOptions {
            insert_ignore: true,
            ..options(10)
        };

        let outcome = apply(&changes(0..3, 0..0, 0..0), conn.as_mut(), &opts).await.unwrap();
        assert!(outcome.error.is_none());
        assert_eq!(db.rows("orders").len(), 3);
    }
}
