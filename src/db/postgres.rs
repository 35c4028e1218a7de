// ABOUTME: PostgreSQL backend for the sync engine (tokio-postgres + native TLS)
// ABOUTME: Catalog introspection, WAL LSN position, C-collation keyset reads

use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::OnceLock;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Client;

use super::sql::{self, Dialect, PgKind};
use super::{
    key_params, retain_requested, signatures_of, url_identity, Batch, ColumnSpec, Connection,
    Database, LogPosition, PrimaryKey, Row, TableSpec, Value, CONNECT_RETRIES, CONNECT_RETRY_DELAY,
};
use crate::config::SignatureType;
use crate::engine::signature::RowSignature;
use crate::error::{BoxError, Result, SyncError};
use crate::utils::retry_with_backoff;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the TLS certificate policy for every PostgreSQL connection.
///
/// Call once at startup; later calls are ignored.
pub fn init_tls_policy(allow_self_signed: bool) {
    let _ = ALLOW_SELF_SIGNED.set(allow_self_signed);
    if allow_self_signed {
        tracing::warn!("TLS certificate verification disabled for PostgreSQL connections");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

pub struct PostgresDatabase {
    config: tokio_postgres::Config,
    identity: String,
}

impl PostgresDatabase {
    pub fn new(url: &str) -> Result<Self> {
        let config = url.parse::<tokio_postgres::Config>().map_err(|e| {
            SyncError::Config(format!(
                "Invalid PostgreSQL URL {}: {}",
                crate::utils::sanitize_url(url),
                e
            ))
        })?;
        Ok(Self {
            config,
            identity: url_identity(url),
        })
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        tracing::debug!("Connecting to PostgreSQL at {}", self.identity);
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(allow_self_signed())
            .build()
            .map_err(|e| SyncError::connectivity(self.identity.clone(), e))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        let (client, connection) = retry_with_backoff(
            || {
                let config = self.config.clone();
                let tls = tls.clone();
                let endpoint = self.identity.clone();
                async move {
                    config
                        .connect(tls)
                        .await
                        .map_err(|e| SyncError::connectivity(endpoint, e))
                }
            },
            CONNECT_RETRIES,
            CONNECT_RETRY_DELAY,
            SyncError::is_connectivity,
        )
        .await?;

        let endpoint = self.identity.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection to {} closed: {}", endpoint, e);
            }
        });

        Ok(Box::new(PostgresConnection {
            client,
            endpoint: self.identity.clone(),
        }))
    }
}

pub struct PostgresConnection {
    client: Client,
    endpoint: String,
}

fn classify(endpoint: &str, context: impl Into<String>, err: tokio_postgres::Error) -> SyncError {
    if err.as_db_error().is_some() {
        SyncError::query(context, err)
    } else {
        SyncError::connectivity(endpoint, err)
    }
}

/// Values are bound to placeholders cast to `int8`, `float8`, `bytea` or
/// `text` (see `Dialect::placeholder`), so only those wire types occur.
impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }
        match *ty {
            Type::INT8 => {
                let v: i64 = match self {
                    Value::Int(i) => *i,
                    Value::UInt(u) => i64::try_from(*u)?,
                    Value::Float(f) => *f as i64,
                    Value::Text(s) => s.trim().parse()?,
                    _ => return Err(format!("cannot bind {} as int8", self).into()),
                };
                v.to_sql(ty, out)
            }
            Type::FLOAT8 => {
                let v: f64 = match self {
                    Value::Int(i) => *i as f64,
                    Value::UInt(u) => *u as f64,
                    Value::Float(f) => *f,
                    Value::Text(s) => s.trim().parse()?,
                    _ => return Err(format!("cannot bind {} as float8", self).into()),
                };
                v.to_sql(ty, out)
            }
            Type::BYTEA => match self {
                Value::Bytes(b) => b.as_slice().to_sql(ty, out),
                Value::Text(s) => s.as_bytes().to_sql(ty, out),
                _ => Err(format!("cannot bind {} as bytea", self).into()),
            },
            _ => {
                let text = match self {
                    Value::Int(i) => i.to_string(),
                    Value::UInt(u) => u.to_string(),
                    Value::Float(f) => f.to_string(),
                    Value::Text(s) => s.clone(),
                    Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                    Value::Null => return Ok(IsNull::Yes),
                };
                text.to_sql(ty, out)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn read_value(row: &tokio_postgres::Row, idx: usize, column: &ColumnSpec) -> Result<Value, tokio_postgres::Error> {
    Ok(match PgKind::of(column) {
        PgKind::Int => row.try_get::<_, Option<i64>>(idx)?.map_or(Value::Null, Value::Int),
        PgKind::Float => row.try_get::<_, Option<f64>>(idx)?.map_or(Value::Null, Value::Float),
        PgKind::Bytes => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(Value::Null, Value::Bytes),
        PgKind::Text => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(Value::Null, Value::Text),
    })
}

/// Parse a `pg_lsn` text value (`16/B374D848`) into a 64-bit offset.
fn parse_lsn(lsn: &str) -> Option<u64> {
    let (high, low) = lsn.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

impl PostgresConnection {
    async fn select(&mut self, table: &TableSpec, query: &str, params: &[Value]) -> Result<Vec<Row>> {
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(query, &refs)
            .await
            .map_err(|e| classify(&self.endpoint, format!("Failed to read '{}'", table.name), e))?;

        rows.iter()
            .map(|row| {
                table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(i, column)| read_value(row, i, column))
                    .collect::<Result<Row, _>>()
                    .map_err(|e| {
                        SyncError::query(format!("Failed to decode row of '{}'", table.name), e)
                    })
            })
            .collect()
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn list_tables(&mut self) -> Result<Vec<TableSpec>> {
        let names = self
            .client
            .query(
                "SELECT c.relname::text
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = current_schema() AND c.relkind IN ('r', 'p')
                 ORDER BY c.relname",
                &[],
            )
            .await
            .map_err(|e| classify(&self.endpoint, "Failed to list tables", e))?;

        let columns = self
            .client
            .query(
                "SELECT c.relname::text, a.attname::text,
                        format_type(a.atttypid, a.atttypmod),
                        a.attgenerated = 's'
                 FROM pg_attribute a
                 JOIN pg_class c ON c.oid = a.attrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE n.nspname = current_schema() AND c.relkind IN ('r', 'p')
                   AND a.attnum > 0 AND NOT a.attisdropped
                 ORDER BY c.relname, a.attnum",
                &[],
            )
            .await
            .map_err(|e| classify(&self.endpoint, "Failed to list columns", e))?;

        let keys = self
            .client
            .query(
                "SELECT c.relname::text, a.attname::text
                 FROM pg_index i
                 JOIN pg_class c ON c.oid = i.indrelid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 CROSS JOIN LATERAL unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord)
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum
                 WHERE i.indisprimary AND n.nspname = current_schema()
                 ORDER BY c.relname, k.ord",
                &[],
            )
            .await
            .map_err(|e| classify(&self.endpoint, "Failed to list primary keys", e))?;

        let tables = names
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let cols = columns
                    .iter()
                    .filter(|c| c.get::<_, String>(0) == name)
                    .map(|c| {
                        let spec = ColumnSpec::new(c.get::<_, String>(1), c.get::<_, String>(2));
                        if c.get::<_, bool>(3) {
                            spec.generated()
                        } else {
                            spec
                        }
                    })
                    .collect();
                let pk = keys
                    .iter()
                    .filter(|k| k.get::<_, String>(0) == name)
                    .map(|k| k.get::<_, String>(1))
                    .collect();
                TableSpec::new(name, cols, pk)
            })
            .collect::<Vec<_>>();

        tracing::debug!("Found {} tables in PostgreSQL schema", tables.len());
        Ok(tables)
    }

    async fn fetch_signatures(
        &mut self,
        table: &TableSpec,
        after: Option<&PrimaryKey>,
        limit: usize,
    ) -> Result<Vec<RowSignature>> {
        let query = sql::select_page(Dialect::Postgres, table, after.is_some(), limit);
        let params = after.map(|k| k.values()).unwrap_or_default();
        let rows = self.select(table, &query, params).await?;
        Ok(signatures_of(table, &rows))
    }

    async fn fetch_rows(&mut self, table: &TableSpec, keys: &[PrimaryKey]) -> Result<Vec<Row>> {
        let per_statement = Dialect::Postgres.rows_per_statement(table.primary_key.len());
        let mut rows = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(per_statement) {
            let query = sql::select_by_keys(Dialect::Postgres, table, chunk.len());
            rows.extend(self.select(table, &query, &key_params(chunk)).await?);
        }
        retain_requested(table, &mut rows, keys);
        Ok(rows)
    }

    async fn log_position(&mut self) -> Result<LogPosition> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .map_err(|e| match e.as_db_error() {
                Some(db) => SyncError::DetectionUnavailable {
                    strategy: SignatureType::LogPosition,
                    reason: db.message().to_string(),
                },
                None => SyncError::connectivity(self.endpoint.clone(), e),
            })?;
        let lsn: String = row.get(0);
        let offset = parse_lsn(&lsn).ok_or_else(|| SyncError::DetectionUnavailable {
            strategy: SignatureType::LogPosition,
            reason: format!("unparseable WAL LSN '{}'", lsn),
        })?;
        Ok(LogPosition {
            file: "wal".to_string(),
            offset,
        })
    }

    async fn foreign_key_checks(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one("SHOW session_replication_role", &[])
            .await
            .map_err(|e| classify(&self.endpoint, "Failed to read session_replication_role", e))?;
        let role: String = row.get(0);
        Ok(role != "replica")
    }

    async fn set_foreign_key_checks(&mut self, enabled: bool) -> Result<()> {
        let role = if enabled { "origin" } else { "replica" };
        self.client
            .batch_execute(&format!("SET session_replication_role = {}", role))
            .await
            .map_err(|e| classify(&self.endpoint, "Failed to set session_replication_role", e))
    }

    async fn apply_batch(&mut self, table: &TableSpec, batch: Batch<'_>) -> Result<u64> {
        let endpoint = self.endpoint.clone();
        let context = format!("{} on '{}'", batch.phase(), table.name);

        // Dropping an uncommitted transaction rolls it back.
        let tx = self
            .client
            .transaction()
            .await
            .map_err(|e| classify(&endpoint, "Failed to begin transaction", e))?;

        let mut affected = 0;
        match batch {
            Batch::Insert { rows, .. } | Batch::Upsert { rows } => {
                let per_statement = Dialect::Postgres.rows_per_statement(table.columns.len());
                for chunk in rows.chunks(per_statement) {
                    let query = match batch {
                        Batch::Insert { ignore, .. } => {
                            sql::insert(Dialect::Postgres, table, chunk.len(), ignore)
                        }
                        _ => sql::upsert(Dialect::Postgres, table, chunk.len()),
                    };
                    let refs: Vec<&(dyn ToSql + Sync)> = chunk
                        .iter()
                        .flatten()
                        .map(|v| v as &(dyn ToSql + Sync))
                        .collect();
                    affected += tx
                        .execute(&query, &refs)
                        .await
                        .map_err(|e| classify(&endpoint, context.clone(), e))?;
                }
            }
            Batch::Delete { keys } => {
                let per_statement = Dialect::Postgres.rows_per_statement(table.primary_key.len());
                for chunk in keys.chunks(per_statement) {
                    let query = sql::delete(Dialect::Postgres, table, chunk.len());
                    let values = key_params(chunk);
                    let refs: Vec<&(dyn ToSql + Sync)> =
                        values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
                    affected += tx
                        .execute(&query, &refs)
                        .await
                        .map_err(|e| classify(&endpoint, context.clone(), e))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| classify(&endpoint, format!("Failed to commit {}", context), e))?;
        Ok(affected)
    }
}
