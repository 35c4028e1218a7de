// ABOUTME: MySQL backend for the sync engine (mysql_async)
// ABOUTME: information_schema introspection, binlog position, byte-ordered keyset reads

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, Params, TxOpts};

use super::sql::{self, Dialect};
use super::{
    key_params, retain_requested, signatures_of, url_identity, Batch, ColumnSpec, Connection,
    Database, LogPosition, PrimaryKey, Row, TableSpec, Value, CONNECT_RETRIES, CONNECT_RETRY_DELAY,
};
use crate::config::SignatureType;
use crate::engine::signature::RowSignature;
use crate::error::{Result, SyncError};
use crate::utils::retry_with_backoff;

pub struct MySqlDatabase {
    opts: Opts,
    identity: String,
}

impl MySqlDatabase {
    pub fn new(url: &str) -> Result<Self> {
        let opts = Opts::from_url(url).map_err(|e| {
            SyncError::Config(format!(
                "Invalid MySQL URL {}: {}",
                crate::utils::sanitize_url(url),
                e
            ))
        })?;
        if opts.db_name().is_none() {
            return Err(SyncError::Config(format!(
                "MySQL URL {} must name a database",
                crate::utils::sanitize_url(url)
            )));
        }
        Ok(Self {
            opts,
            identity: url_identity(url),
        })
    }
}

#[async_trait]
impl Database for MySqlDatabase {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        tracing::debug!("Connecting to MySQL at {}", self.identity);
        // Server errors (bad credentials, unknown database) are not retried.
        let conn = retry_with_backoff(
            || {
                let opts = self.opts.clone();
                let endpoint = self.identity.clone();
                async move {
                    Conn::new(opts)
                        .await
                        .map_err(|e| classify(&endpoint, "connect", e))
                }
            },
            CONNECT_RETRIES,
            CONNECT_RETRY_DELAY,
            SyncError::is_connectivity,
        )
        .await
        .map_err(|e| match e {
            SyncError::Query { source, .. } => SyncError::Connectivity {
                endpoint: self.identity.clone(),
                source,
            },
            other => other,
        })?;
        Ok(Box::new(MySqlConnection {
            conn,
            endpoint: self.identity.clone(),
        }))
    }
}

pub struct MySqlConnection {
    conn: Conn,
    endpoint: String,
}

/// Server-side statement errors are per-query; anything else means the
/// connection itself is gone.
fn classify(endpoint: &str, context: impl Into<String>, err: mysql_async::Error) -> SyncError {
    match err {
        mysql_async::Error::Server(_) => SyncError::query(context, err),
        other => SyncError::connectivity(endpoint, other),
    }
}

fn is_binary_type(column: &ColumnSpec) -> bool {
    let t = column.data_type.to_ascii_lowercase();
    t.contains("binary") || t.contains("blob") || t.starts_with("bit")
}

fn to_mysql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Int(i) => mysql_async::Value::Int(*i),
        Value::UInt(u) => mysql_async::Value::UInt(*u),
        Value::Float(f) => mysql_async::Value::Double(*f),
        Value::Text(s) => mysql_async::Value::Bytes(s.as_bytes().to_vec()),
        Value::Bytes(b) => mysql_async::Value::Bytes(b.clone()),
    }
}

fn params_of<'a>(values: impl IntoIterator<Item = &'a Value>) -> Params {
    let values: Vec<mysql_async::Value> = values.into_iter().map(to_mysql).collect();
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values)
    }
}

/// Convert a binary-protocol value using the declared column type.
fn from_mysql(value: mysql_async::Value, column: &ColumnSpec) -> Value {
    use mysql_async::Value as My;
    match value {
        My::NULL => Value::Null,
        My::Int(i) => Value::Int(i),
        My::UInt(u) => Value::UInt(u),
        My::Float(f) => Value::Float(f as f64),
        My::Double(f) => Value::Float(f),
        My::Bytes(bytes) => {
            if is_binary_type(column) {
                Value::Bytes(bytes)
            } else {
                match String::from_utf8(bytes) {
                    Ok(text) => Value::Text(text),
                    Err(e) => Value::Bytes(e.into_bytes()),
                }
            }
        }
        My::Date(y, mo, d, h, mi, s, us) => {
            if column.data_type.eq_ignore_ascii_case("date") {
                Value::Text(format!("{:04}-{:02}-{:02}", y, mo, d))
            } else if us > 0 {
                Value::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    y, mo, d, h, mi, s, us
                ))
            } else {
                Value::Text(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    y, mo, d, h, mi, s
                ))
            }
        }
        My::Time(negative, days, h, mi, s, us) => {
            let sign = if negative { "-" } else { "" };
            let hours = days * 24 + h as u32;
            if us > 0 {
                Value::Text(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, mi, s, us
                ))
            } else {
                Value::Text(format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s))
            }
        }
    }
}

impl MySqlConnection {
    async fn select(&mut self, table: &TableSpec, query: String, params: Params) -> Result<Vec<Row>> {
        let rows: Vec<mysql_async::Row> = self
            .conn
            .exec(query, params)
            .await
            .map_err(|e| classify(&self.endpoint, format!("Failed to read '{}'", table.name), e))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                row.unwrap()
                    .into_iter()
                    .zip(&table.columns)
                    .map(|(value, column)| from_mysql(value, column))
                    .collect()
            })
            .collect())
    }

    async fn read_log_status(&mut self, statement: &str) -> Result<Option<LogPosition>, mysql_async::Error> {
        let row: Option<mysql_async::Row> = self.conn.query_first(statement).await?;
        Ok(row.and_then(|row| {
            let file: Option<String> = row.get(0);
            let offset: Option<u64> = row.get(1);
            match (file, offset) {
                (Some(file), Some(offset)) if !file.is_empty() => Some(LogPosition { file, offset }),
                _ => None,
            }
        }))
    }

    async fn execute_batch(
        tx: &mut mysql_async::Transaction<'_>,
        table: &TableSpec,
        batch: Batch<'_>,
    ) -> Result<u64, mysql_async::Error> {
        let mut affected = 0;
        match batch {
            Batch::Insert { rows, .. } | Batch::Upsert { rows } => {
                let per_statement = Dialect::MySql.rows_per_statement(table.columns.len());
                for chunk in rows.chunks(per_statement) {
                    let query = match batch {
                        Batch::Insert { ignore, .. } => {
                            sql::insert(Dialect::MySql, table, chunk.len(), ignore)
                        }
                        _ => sql::upsert(Dialect::MySql, table, chunk.len()),
                    };
                    tx.exec_drop(query, params_of(chunk.iter().flatten())).await?;
                    affected += tx.affected_rows();
                }
            }
            Batch::Delete { keys } => {
                let per_statement = Dialect::MySql.rows_per_statement(table.primary_key.len());
                for chunk in keys.chunks(per_statement) {
                    let query = sql::delete(Dialect::MySql, table, chunk.len());
                    tx.exec_drop(query, params_of(&key_params(chunk))).await?;
                    affected += tx.affected_rows();
                }
            }
        }
        Ok(affected)
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn list_tables(&mut self) -> Result<Vec<TableSpec>> {
        let endpoint = self.endpoint.clone();

        let names: Vec<String> = self
            .conn
            .query(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME",
            )
            .await
            .map_err(|e| classify(&endpoint, "Failed to list tables", e))?;

        let columns: Vec<(String, String, String, String)> = self
            .conn
            .query(
                "SELECT TABLE_NAME, COLUMN_NAME, COLUMN_TYPE, EXTRA \
                 FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() \
                 ORDER BY TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| classify(&endpoint, "Failed to list columns", e))?;

        let keys: Vec<(String, String)> = self
            .conn
            .query(
                "SELECT TABLE_NAME, COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = DATABASE() AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY TABLE_NAME, ORDINAL_POSITION",
            )
            .await
            .map_err(|e| classify(&endpoint, "Failed to list primary keys", e))?;

        let tables: Vec<TableSpec> = names
            .into_iter()
            .map(|name| {
                let cols = columns
                    .iter()
                    .filter(|(t, ..)| *t == name)
                    .map(|(_, column, data_type, extra)| {
                        let spec = ColumnSpec::new(column.clone(), data_type.clone());
                        if extra.to_ascii_uppercase().contains("GENERATED") {
                            spec.generated()
                        } else {
                            spec
                        }
                    })
                    .collect();
                let pk = keys
                    .iter()
                    .filter(|(t, _)| *t == name)
                    .map(|(_, column)| column.clone())
                    .collect();
                TableSpec::new(name, cols, pk)
            })
            .collect();

        tracing::debug!("Found {} tables in MySQL database", tables.len());
        Ok(tables)
    }

    async fn fetch_signatures(
        &mut self,
        table: &TableSpec,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<RowSignature>> {
        let query = sql::select_page(Dialect::MySql, table, after.is_some(), limit);
        let params = params_of(after.map(|k| k.values()).unwrap_or_default());
        let rows = self.select(table, query, params).await?;
        Ok(signatures_of(table, &rows))
    }

    async fn fetch_rows(&mut self, table: &TableSpec, keys: &[PrimaryKey]) -> Result<Vec<Row>> {
        let per_statement = Dialect::MySql.rows_per_statement(table.primary_key.len());
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(per_statement) {
            let query = sql::select_by_keys(Dialect::MySql, table, chunk.len());
            let params = params_of(&key_params(chunk));
            rows.extend(self.select(table, query, params).await?);
        }
        retain_requested(table, &mut rows, keys);
        Ok(rows)
    }

    async fn log_position(&mut self) -> Result<LogPosition> {
        let unavailable = |reason: String| SyncError::DetectionUnavailable {
            strategy: SignatureType::LogPosition,
            reason,
        };

        // MySQL 8.4 removed SHOW MASTER STATUS in favour of SHOW BINARY LOG STATUS.
        let mut last_error = None;
        for statement in ["SHOW MASTER STATUS", "SHOW BINARY LOG STATUS"] {
            match self.read_log_status(statement).await {
                Ok(Some(position)) => return Ok(position),
                Ok(None) => return Err(unavailable("binary logging is disabled".to_string())),
                Err(mysql_async::Error::Server(e)) => last_error = Some(e.to_string()),
                Err(e) => return Err(SyncError::connectivity(self.endpoint.clone(), e)),
            }
        }
        Err(unavailable(last_error.unwrap_or_else(|| "no binlog status".to_string())))
    }

    async fn foreign_key_checks(&mut self) -> Result<bool> {
        let endpoint = self.endpoint.clone();
        let enabled: Option<i64> = self
            .conn
            .query_first("SELECT @@SESSION.foreign_key_checks")
            .await
            .map_err(|e| classify(&endpoint, "Failed to read foreign_key_checks", e))?;
        Ok(enabled.unwrap_or(1) != 0)
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        let endpoint = self.endpoint.clone();
        let statement = format!("SET FOREIGN_KEY_CHECKS = {}", if enabled { 1 } else { 0 });
        self.conn
            .query_drop(statement)
            .await
            .map_err(|e| classify(&endpoint, "Failed to set FOREIGN_KEY_CHECKS", e))
    }

    async fn apply_batch(&mut self, table: &TableSpec, batch: Batch<'_>) -> Result<u64> {
        let endpoint = self.endpoint.clone();
        let context = format!("{} on '{}'", batch.phase(), table.name);

        let mut tx = self
            .conn
            .start_transaction(TxOpts::default())
            .await
            .map_err(|e| classify(&endpoint, "Failed to begin transaction", e))?;

        match Self::execute_batch(&mut tx, table, batch).await {
            Ok(affected) => {
                tx.commit()
                    .await
                    .map_err(|e| classify(&endpoint, format!("Failed to commit {}", context), e))?;
                Ok(affected)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!("Rollback of {} failed: {}", context, rollback);
                }
                Err(classify(&endpoint, context, e))
            }
        }
    }
}
