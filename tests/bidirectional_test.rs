// ABOUTME: Bidirectional sync tests against two SQLite files
// ABOUTME: Convergence, per-table mutual exclusion, run-scoped locks and lock timeouts

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tablesync::engine::{BidirectionalCoordinator, Direction};
use tablesync::{
    open_database, BisyncOptions, Database, LockScope, RunStatus, StateStore, SyncError,
    SyncOptions,
};
use tempfile::TempDir;

const TABLES: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

fn create(dir: &TempDir, name: &str, rows: &[(&str, i64, &str)]) -> PathBuf {
    let path = dir.path().join(format!("{}.db", name));
    let conn = Connection::open(&path).unwrap();
    for table in TABLES {
        conn.execute_batch(&format!(
            "CREATE TABLE {} (id INTEGER PRIMARY KEY, body TEXT);",
            table
        ))
        .unwrap();
    }
    for (table, id, body) in rows {
        conn.execute(
            &format!("INSERT INTO {} VALUES (?1, ?2)", table),
            rusqlite::params![id, body],
        )
        .unwrap();
    }
    path
}

fn open(path: &Path) -> Arc<dyn Database> {
    open_database(path.to_str().unwrap()).unwrap()
}

fn dump(path: &Path, table: &str) -> Vec<(i64, String)> {
    let conn = Connection::open(path).unwrap();
    let mut stmt = conn
        .prepare(&format!("SELECT id, body FROM {} ORDER BY id", table))
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}

fn options() -> SyncOptions {
    SyncOptions {
        change_detector: false,
        max_workers: Some(4),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_both_sides_converge_without_overlapping_locks() {
    let dir = TempDir::new().unwrap();
    let a = create(
        &dir,
        "a",
        &[("alpha", 1, "a1"), ("beta", 1, "shared"), ("gamma", 5, "only a")],
    );
    let b = create(
        &dir,
        "b",
        &[("beta", 1, "shared"), ("beta", 2, "only b"), ("delta", 9, "only b")],
    );

    let coordinator =
        BidirectionalCoordinator::new(open(&a), open(&b), options(), BisyncOptions::default());
    let report = coordinator.run_once().await;

    assert!(report.is_success(), "{:?} / {:?}", report.forward, report.reverse);
    for table in TABLES {
        assert_eq!(dump(&a, table), dump(&b, table), "table {} diverged", table);
    }

    let registry = coordinator.registry();
    assert_eq!(registry.overlaps(), 0);
    assert_eq!(registry.acquisitions(), 2 * TABLES.len() as u64);
    for table in TABLES {
        assert_eq!(registry.holder(table), None);
    }

    // A second pass finds nothing to do in either direction.
    let again = coordinator.run_once().await;
    assert_eq!(again.forward.totals(), (0, 0, 0));
    assert_eq!(again.reverse.totals(), (0, 0, 0));
}

#[tokio::test]
async fn test_run_scope_locks_once_per_direction() {
    let dir = TempDir::new().unwrap();
    let a = create(&dir, "a", &[("alpha", 1, "x")]);
    let b = create(&dir, "b", &[("gamma", 2, "y")]);

    let bisync = BisyncOptions {
        lock_scope: LockScope::Run,
        ..Default::default()
    };
    let coordinator = BidirectionalCoordinator::new(open(&a), open(&b), options(), bisync);
    let report = coordinator.run_once().await;

    assert!(report.is_success());
    assert_eq!(coordinator.registry().acquisitions(), 2);
    assert_eq!(dump(&a, "alpha"), dump(&b, "alpha"));
    assert_eq!(dump(&a, "gamma"), dump(&b, "gamma"));
}

#[tokio::test]
async fn test_held_table_times_out_without_blocking_others() {
    let dir = TempDir::new().unwrap();
    let a = create(&dir, "a", &[("alpha", 1, "x"), ("beta", 1, "y")]);
    let b = create(&dir, "b", &[]);

    let bisync = BisyncOptions {
        lock_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let coordinator = BidirectionalCoordinator::new(open(&a), open(&b), options(), bisync);
    let held = coordinator
        .registry()
        .acquire("alpha", Direction::Reverse, Duration::from_secs(1))
        .await
        .unwrap();

    let report = coordinator.run_once().await;
    drop(held);

    assert_eq!(report.status(), RunStatus::Partial);
    assert!(matches!(
        report.forward.tables["alpha"].error,
        Some(SyncError::LockTimeout { .. })
    ));
    assert!(report.forward.tables["beta"].is_success());
    assert!(dump(&b, "alpha").is_empty());
    assert_eq!(dump(&b, "beta"), vec![(1, "y".to_string())]);
}

#[tokio::test]
async fn test_directions_keep_separate_signatures() {
    let dir = TempDir::new().unwrap();
    let a = create(&dir, "a", &[("alpha", 1, "x")]);
    let b = create(&dir, "b", &[("beta", 7, "z")]);
    let store = Arc::new(StateStore::new(dir.path().join("state.json")));

    let coordinator = BidirectionalCoordinator::new(
        open(&a),
        open(&b),
        SyncOptions {
            change_detector: true,
            signature_type: tablesync::SignatureType::ContentHash,
            ..options()
        },
        BisyncOptions::default(),
    )
    .with_state_store(store.clone());

    let first = coordinator.run_once().await;
    assert!(first.is_success());

    let state = std::fs::read_to_string(store.path()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&state).unwrap();
    assert_eq!(parsed["pairs"].as_object().unwrap().len(), 2);
}

fn execute(path: &Path, sql: &str) {
    Connection::open(path).unwrap().execute(sql, []).unwrap();
}

fn body(rows: &[(i64, &str)]) -> Vec<(i64, String)> {
    rows.iter().map(|(id, body)| (*id, body.to_string())).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_edits_survive_repeated_passes_with_detection() {
    let dir = TempDir::new().unwrap();
    let a = create(&dir, "a", &[("alpha", 1, "old")]);
    let b = create(&dir, "b", &[("alpha", 1, "old")]);
    let store = Arc::new(StateStore::new(dir.path().join("state.json")));

    let coordinator = BidirectionalCoordinator::new(
        open(&a),
        open(&b),
        SyncOptions {
            change_detector: true,
            signature_type: tablesync::SignatureType::ContentHash,
            ..options()
        },
        BisyncOptions::default(),
    )
    .with_state_store(store);

    assert!(coordinator.run_once().await.is_success());

    execute(&a, "INSERT INTO alpha VALUES (2, 'new')");
    assert!(coordinator.run_once().await.is_success());
    assert_eq!(dump(&b, "alpha"), body(&[(1, "old"), (2, "new")]));

    execute(&a, "UPDATE alpha SET body = 'user edit' WHERE id = 1");
    let third = coordinator.run_once().await;
    assert!(third.is_success());
    assert_eq!(third.reverse.totals(), (0, 0, 0));
    assert_eq!(dump(&a, "alpha"), body(&[(1, "user edit"), (2, "new")]));
    assert_eq!(dump(&b, "alpha"), dump(&a, "alpha"));

    execute(&b, "UPDATE alpha SET body = 'edited on b' WHERE id = 2");
    assert!(coordinator.run_once().await.is_success());
    assert_eq!(dump(&a, "alpha"), body(&[(1, "user edit"), (2, "edited on b")]));
    assert_eq!(dump(&b, "alpha"), dump(&a, "alpha"));

    let quiet = coordinator.run_once().await;
    assert!(quiet.forward.skipped_unchanged);
    assert!(quiet.reverse.skipped_unchanged);
}
