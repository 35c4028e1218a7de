// ABOUTME: SQLite backend for the sync engine (rusqlite)
// ABOUTME: Introspection via pragma_table_xinfo, keyset reads, transactional batch writes

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, ToSql, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::sql::{self, Dialect};
use super::{
    key_params, signatures_of, Batch, ColumnSpec, Connection, Database, LogPosition, PrimaryKey,
    Row, TableSpec, Value,
};
use crate::config::SignatureType;
use crate::engine::signature::RowSignature;
use crate::error::{Result, SyncError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite database file.
///
/// rusqlite is synchronous; statements run directly on the calling task.
/// Each worker opens its own connection, so no connection is shared.
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn identity(&self) -> String {
        let path = std::fs::canonicalize(&self.path).unwrap_or_else(|_| self.path.clone());
        format!("sqlite://{}", path.display())
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        tracing::debug!("Opening SQLite database {}", self.path.display());
        let conn = rusqlite::Connection::open(&self.path)
            .map_err(|e| SyncError::connectivity(self.path.display().to_string(), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| SyncError::connectivity(self.path.display().to_string(), e))?;
        Ok(Box::new(SqliteConnection { conn }))
    }
}

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::UInt(u) => match i64::try_from(*u) {
                Ok(i) => ToSqlOutput::from(i),
                Err(_) => ToSqlOutput::Owned(SqlValue::Text(u.to_string())),
            },
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Bytes(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn query_err(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> SyncError {
    let context = context.into();
    move |e| SyncError::query(context, e)
}

impl SqliteConnection {
    fn select(&self, query: &str, params: &[Value], width: usize) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare(query)
            .map_err(query_err(format!("Failed to prepare '{}'", query)))?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(value_from_ref))
                    .collect::<rusqlite::Result<Row>>()
            })
            .map_err(query_err("Failed to run query"))?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .map_err(query_err("Failed to read rows"))?;
        Ok(rows)
    }

    fn table_spec(&self, table: &str) -> Result<TableSpec> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type, pk, hidden FROM pragma_table_xinfo(?1) ORDER BY cid")
            .map_err(query_err("Failed to prepare column introspection"))?;
        let columns = stmt
            .query_map([table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(query_err(format!("Failed to read columns of '{}'", table)))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(query_err(format!("Failed to read columns of '{}'", table)))?;

        let mut key: Vec<(i64, String)> = Vec::new();
        let mut specs = Vec::with_capacity(columns.len());
        for (name, data_type, pk, hidden) in columns {
            // hidden: 2 = generated virtual, 3 = generated stored
            let mut column = ColumnSpec::new(name.clone(), data_type);
            if hidden == 2 || hidden == 3 {
                column = column.generated();
            }
            if pk > 0 {
                key.push((pk, name));
            }
            specs.push(column);
        }
        key.sort();

        Ok(TableSpec::new(
            table,
            specs,
            key.into_iter().map(|(_, name)| name).collect(),
        ))
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn list_tables(&mut self) -> Result<Vec<TableSpec>> {
        let names: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type='table' \
                     AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .map_err(query_err("Failed to prepare statement to list tables"))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(query_err("Failed to query table list"))?
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(query_err("Failed to collect table names"))?;
            names
        };

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            tables.push(self.table_spec(&name)?);
        }
        tracing::debug!("Found {} tables in SQLite database", tables.len());
        Ok(tables)
    }

    async fn fetch_signatures(
        &mut self,
        table: &TableSpec,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<RowSignature>> {
        let query = sql::select_page(Dialect::Sqlite, table, after.is_some(), limit);
        let params: Vec<Value> = after.map(|k| k.values().to_vec()).unwrap_or_default();
        let rows = self.select(&query, &params, table.columns.len())?;
        Ok(signatures_of(table, &rows))
    }

    async fn fetch_rows(&mut self, table: &TableSpec, keys: &[PrimaryKey]) -> Result<Vec<Row>> {
        let per_statement = Dialect::Sqlite.rows_per_statement(table.primary_key.len());
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(per_statement) {
            let query = sql::select_by_keys(Dialect::Sqlite, table, chunk.len());
            rows.extend(self.select(&query, &key_params(chunk), table.columns.len())?);
        }
        Ok(rows)
    }

    async fn log_position(&mut self) -> Result<LogPosition> {
        Err(SyncError::DetectionUnavailable {
            strategy: SignatureType::LogPosition,
            reason: "SQLite has no replication log".to_string(),
        })
    }

    async fn foreign_key_checks(&mut self) -> Result<bool> {
        let enabled: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_err(query_err("Failed to read PRAGMA foreign_keys"))?;
        Ok(enabled != 0)
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        let pragma = format!("PRAGMA foreign_keys = {}", if enabled { "ON" } else { "OFF" });
        self.conn
            .execute_batch(&pragma)
            .map_err(query_err("Failed to set PRAGMA foreign_keys"))
    }

    async fn apply_batch(&mut self, table: &TableSpec, batch: Batch<'_>) -> Result<u64> {
        // IMMEDIATE takes the write lock up front, so concurrent writers wait
        // on the busy timeout instead of failing on lock upgrade.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err("Failed to begin transaction"))?;
        let mut affected = 0u64;

        match batch {
            Batch::Insert { rows, .. } | Batch::Upsert { rows } => {
                let per_statement = Dialect::Sqlite.rows_per_statement(table.columns.len());
                for chunk in rows.chunks(per_statement) {
                    let query = match batch {
                        Batch::Insert { ignore, .. } => {
                            sql::insert(Dialect::Sqlite, table, chunk.len(), ignore)
                        }
                        _ => sql::upsert(Dialect::Sqlite, table, chunk.len()),
                    };
                    let params = chunk.iter().flat_map(|row| row.iter());
                    affected += tx
                        .execute(&query, params_from_iter(params))
                        .map_err(query_err(format!("{} into '{}'", batch.phase(), table.name)))?
                        as u64;
                }
            }
            Batch::Delete { keys } => {
                let per_statement = Dialect::Sqlite.rows_per_statement(table.primary_key.len());
                for chunk in keys.chunks(per_statement) {
                    let query = sql::delete(Dialect::Sqlite, table, chunk.len());
                    affected += tx
                        .execute(&query, params_from_iter(key_params(chunk).iter()))
                        .map_err(query_err(format!("delete from '{}'", table.name)))?
                        as u64;
                }
            }
        }

        tx.commit()
            .map_err(query_err(format!("Failed to commit batch on '{}'", table.name)))?;
        Ok(affected)
    }
}
