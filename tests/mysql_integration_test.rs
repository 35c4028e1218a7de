// ABOUTME: Integration tests against live MySQL servers
// ABOUTME: Run with TEST_MYSQL_SOURCE_URL and TEST_MYSQL_TARGET_URL set and `--ignored`

use mysql_async::prelude::Queryable;
use std::env;
use std::sync::Arc;
use tablesync::engine::DatabaseSignature;
use tablesync::{
    has_changes, open_database, sync, Database, RunStatus, SignatureType, StateStore, SyncOptions,
};
use tempfile::TempDir;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let source = env::var("TEST_MYSQL_SOURCE_URL").ok()?;
    let target = env::var("TEST_MYSQL_TARGET_URL").ok()?;
    Some((source, target))
}

async fn execute(url: &str, statements: &[String]) -> anyhow::Result<()> {
    let mut conn = mysql_async::Conn::from_url(url).await?;
    for statement in statements {
        conn.query_drop(statement).await?;
    }
    conn.disconnect().await?;
    Ok(())
}

async fn fetch(url: &str, query: &str) -> anyhow::Result<Vec<(i64, String, Option<String>)>> {
    let mut conn = mysql_async::Conn::from_url(url).await?;
    let rows = conn.query(query).await?;
    conn.disconnect().await?;
    Ok(rows)
}

fn create_table(table: &str) -> Vec<String> {
    vec![
        format!("DROP TABLE IF EXISTS `{}`", table),
        format!(
            "CREATE TABLE `{}` (
                id BIGINT PRIMARY KEY,
                sku VARCHAR(64) NOT NULL,
                note TEXT NULL,
                price DECIMAL(10, 2) NOT NULL DEFAULT 0,
                created_at DATETIME NULL
            )",
            table
        ),
    ]
}

fn options() -> SyncOptions {
    SyncOptions {
        change_detector: false,
        include: Some(vec!["tablesync_it_orders".to_string()]),
        ..Default::default()
    }
}

#[tokio::test]
#[ignore]
async fn test_mysql_orders_scenario() {
    let Some((source_url, target_url)) = get_test_urls() else {
        println!("Skipping: TEST_MYSQL_SOURCE_URL / TEST_MYSQL_TARGET_URL not set");
        return;
    };
    let table = "tablesync_it_orders";

    let mut source_sql = create_table(table);
    source_sql.push(format!(
        "INSERT INTO `{}` VALUES
            (1, 'A-1', NULL, 9.99, '2024-01-02 03:04:05'),
            (2, 'B-2', 'express', 19.50, NULL),
            (3, 'C-3', '', 0.00, NULL)",
        table
    ));
    let mut target_sql = create_table(table);
    target_sql.push(format!(
        "INSERT INTO `{}` VALUES
            (2, 'B-2', 'standard', 19.50, NULL),
            (3, 'C-3', '', 0.00, NULL),
            (4, 'D-4', NULL, 1.00, NULL)",
        table
    ));
    execute(&source_url, &source_sql).await.unwrap();
    execute(&target_url, &target_sql).await.unwrap();

    let source = open_database(&source_url).unwrap();
    let target = open_database(&target_url).unwrap();

    let report = sync(source.clone(), target.clone(), options(), None).await;
    assert_eq!(report.status, RunStatus::Success, "{:?}", report.failed_tables());
    let result = &report.tables[table];
    assert_eq!((result.inserted, result.updated, result.deleted), (1, 1, 1));

    let query = format!("SELECT id, sku, note FROM `{}` ORDER BY id", table);
    assert_eq!(
        fetch(&source_url, &query).await.unwrap(),
        fetch(&target_url, &query).await.unwrap()
    );

    let again = sync(source, target, options(), None).await;
    assert_eq!(again.totals(), (0, 0, 0));

    execute(&source_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
    execute(&target_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_mysql_detection() {
    let Some((source_url, target_url)) = get_test_urls() else {
        println!("Skipping: TEST_MYSQL_SOURCE_URL / TEST_MYSQL_TARGET_URL not set");
        return;
    };
    let table = "tablesync_it_orders";
    let mut statements = create_table(table);
    statements.push(format!("INSERT INTO `{}` (id, sku) VALUES (1, 'A-1')", table));
    execute(&source_url, &statements).await.unwrap();
    execute(&target_url, &create_table(table)).await.unwrap();

    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state.json"));
    let source: Arc<dyn Database> = open_database(&source_url).unwrap();
    let target: Arc<dyn Database> = open_database(&target_url).unwrap();
    let options = SyncOptions {
        signature_type: SignatureType::ContentHash,
        ..options()
    };

    let first = has_changes(source.as_ref(), target.as_ref(), &options, &store)
        .await
        .unwrap();
    first.commit(&store).await.unwrap();
    let second = has_changes(source.as_ref(), target.as_ref(), &options, &store)
        .await
        .unwrap();
    assert!(!second.changed);

    execute(
        &source_url,
        &[format!("UPDATE `{}` SET sku = 'A-2' WHERE id = 1", table)],
    )
    .await
    .unwrap();
    let third = has_changes(source.as_ref(), target.as_ref(), &options, &store)
        .await
        .unwrap();
    assert!(third.changed);

    // Auto prefers the binlog position when the server exposes one.
    let auto = has_changes(
        source.as_ref(),
        target.as_ref(),
        &SyncOptions {
            signature_type: SignatureType::Auto,
            ..options.clone()
        },
        &store,
    )
    .await
    .unwrap();
    match auto.signature {
        DatabaseSignature::LogPosition { file, .. } => assert!(!file.is_empty()),
        DatabaseSignature::ContentHash { .. } => {
            println!("Binary logging unavailable; auto fell back to content hash")
        }
    }

    execute(&source_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
    execute(&target_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_mysql_decimal_keys() {
    let Some((source_url, target_url)) = get_test_urls() else {
        println!("Skipping: TEST_MYSQL_SOURCE_URL / TEST_MYSQL_TARGET_URL not set");
        return;
    };
    let table = "tablesync_it_prices";
    let ddl = vec![
        format!("DROP TABLE IF EXISTS `{}`", table),
        format!(
            "CREATE TABLE `{}` (price DECIMAL(10, 2) PRIMARY KEY, label VARCHAR(32) NOT NULL)",
            table
        ),
    ];
    let mut source_sql = ddl.clone();
    source_sql.push(format!(
        "INSERT INTO `{}` VALUES (-1.00, 'refund'), (9.50, 'small'), (10.00, 'medium'), (100.25, 'large')",
        table
    ));
    let mut target_sql = ddl;
    target_sql.push(format!("INSERT INTO `{}` VALUES (10.00, 'stale')", table));
    execute(&source_url, &source_sql).await.unwrap();
    execute(&target_url, &target_sql).await.unwrap();

    let options = SyncOptions {
        change_detector: false,
        page_size: 2,
        include: Some(vec![table.to_string()]),
        ..Default::default()
    };
    let source = open_database(&source_url).unwrap();
    let target = open_database(&target_url).unwrap();
    let report = sync(source, target, options, None).await;
    assert_eq!(report.status, RunStatus::Success, "{:?}", report.failed_tables());
    assert_eq!(report.totals(), (3, 1, 0));

    let mut conn = mysql_async::Conn::from_url(target_url.as_str()).await.unwrap();
    let labels: Vec<String> = conn
        .query(format!("SELECT label FROM `{}` ORDER BY price", table))
        .await
        .unwrap();
    conn.disconnect().await.unwrap();
    assert_eq!(labels, vec!["refund", "small", "medium", "large"]);

    execute(&source_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
    execute(&target_url, &[format!("DROP TABLE `{}`", table)]).await.unwrap();
}
