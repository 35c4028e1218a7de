// ABOUTME: SQL statement builders shared by the MySQL, PostgreSQL and SQLite backends
// ABOUTME: Generates keyset page queries, key lookups, inserts, upserts and deletes

use crate::db::{ColumnSpec, TableSpec};
use crate::utils::{quote_ident, quote_mysql_ident};

/// SQL flavor of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
}

/// How PostgreSQL values are transported: integers, floats and bytea travel
/// natively, everything else as text cast back to the declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgKind {
    Int,
    Float,
    Bytes,
    Text,
}

impl PgKind {
    pub fn of(column: &ColumnSpec) -> Self {
        let t = column.data_type.to_ascii_lowercase();
        match t.as_str() {
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" => PgKind::Int,
            "real" | "double precision" | "float4" | "float8" => PgKind::Float,
            "bytea" => PgKind::Bytes,
            _ => PgKind::Text,
        }
    }
}

/// MySQL types read back as integers or floats, whose server order matches
/// `Value`'s. Every other type (decimals, temporals, strings) is read back as
/// text or bytes and has to be ordered by its bytes.
fn mysql_is_numeric(column: &ColumnSpec) -> bool {
    let t = column.data_type.to_ascii_lowercase();
    let base = t.split(['(', ' ']).next().unwrap_or_default();
    matches!(
        base,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "float" | "double"
            | "real" | "year"
    )
}

impl Dialect {
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => quote_mysql_ident(ident),
            Dialect::Postgres | Dialect::Sqlite => quote_ident(ident),
        }
    }

    /// Bind-parameter limit per statement.
    pub fn max_params(&self) -> usize {
        match self {
            Dialect::MySql => 65_000,
            Dialect::Postgres => 65_000,
            Dialect::Sqlite => 32_000,
        }
    }

    /// Rows that fit in one statement with `params_per_row` parameters each.
    pub fn rows_per_statement(&self, params_per_row: usize) -> usize {
        std::cmp::max(1, self.max_params() / params_per_row.max(1))
    }

    /// Placeholder for the `n`th (1-based) parameter, bound to `column`.
    pub fn placeholder(&self, n: usize, column: &ColumnSpec) -> String {
        match self {
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => match PgKind::of(column) {
                PgKind::Int => format!("${}::int8", n),
                PgKind::Float => format!("${}::float8", n),
                PgKind::Bytes => format!("${}::bytea", n),
                PgKind::Text => format!("CAST(${}::text AS {})", n, column.data_type),
            },
        }
    }

    /// Expression a column is read with.
    pub fn select_expr(&self, column: &ColumnSpec) -> String {
        let quoted = self.quote(&column.name);
        match self {
            Dialect::Postgres => match PgKind::of(column) {
                PgKind::Int => format!("{}::int8", quoted),
                PgKind::Float => format!("{}::float8", quoted),
                PgKind::Bytes => quoted,
                PgKind::Text => format!("{}::text", quoted),
            },
            _ => quoted,
        }
    }

    /// Expression a key column is ordered and compared by. Non-numeric keys
    /// compare byte-wise so the database order matches `PrimaryKey`'s ordering.
    pub fn order_expr(&self, column: &ColumnSpec) -> String {
        let quoted = self.quote(&column.name);
        match self {
            Dialect::MySql if !mysql_is_numeric(column) => format!("CAST({} AS BINARY)", quoted),
            Dialect::Postgres if PgKind::of(column) == PgKind::Text => {
                format!("{}::text COLLATE \"C\"", quoted)
            }
            _ => quoted,
        }
    }

    /// Placeholder compared against `order_expr` in keyset pagination.
    fn order_placeholder(&self, n: usize, column: &ColumnSpec) -> String {
        match self {
            Dialect::Postgres => match PgKind::of(column) {
                PgKind::Int => format!("${}::int8", n),
                PgKind::Float => format!("${}::float8", n),
                PgKind::Bytes => format!("${}::bytea", n),
                PgKind::Text => format!("${}::text COLLATE \"C\"", n),
            },
            _ => "?".to_string(),
        }
    }
}

fn tuple(items: Vec<String>) -> String {
    if items.len() == 1 {
        items.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", items.join(", "))
    }
}

/// Page of rows in key order, optionally strictly after a key.
///
/// ```sql
/// SELECT "id", "name" FROM "t" WHERE ("a", "b") > ($1, $2) ORDER BY "a", "b" LIMIT 500
/// ```
pub fn select_page(dialect: Dialect, table: &TableSpec, after_key: bool, limit: usize) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| dialect.select_expr(c)).collect();
    let keys = table.key_columns();
    let order: Vec<String> = keys.iter().map(|c| dialect.order_expr(c)).collect();

    let filter = if after_key {
        let params: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, c)| dialect.order_placeholder(i + 1, c))
            .collect();
        format!(" WHERE {} > {}", tuple(order.clone()), tuple(params))
    } else {
        String::new()
    };

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        columns.join(", "),
        dialect.quote(&table.name),
        filter,
        order.join(", "),
        limit
    )
}

/// `WHERE` clause matching `num_keys` primary keys, parameters starting at `first`.
fn key_match(dialect: Dialect, table: &TableSpec, num_keys: usize, first: usize) -> String {
    let keys = table.key_columns();
    let key_cols: Vec<String> = keys.iter().map(|c| dialect.quote(&c.name)).collect();
    let width = keys.len();

    let tuples: Vec<String> = (0..num_keys)
        .map(|row| {
            let placeholders: Vec<String> = keys
                .iter()
                .enumerate()
                .map(|(i, c)| dialect.placeholder(first + row * width + i, c))
                .collect();
            tuple(placeholders)
        })
        .collect();

    format!("{} IN ({})", tuple(key_cols), tuples.join(", "))
}

/// Rows for the given keys.
pub fn select_by_keys(dialect: Dialect, table: &TableSpec, num_keys: usize) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| dialect.select_expr(c)).collect();
    format!(
        "SELECT {} FROM {} WHERE {}",
        columns.join(", "),
        dialect.quote(&table.name),
        key_match(dialect, table, num_keys, 1)
    )
}

fn values_clause(dialect: Dialect, table: &TableSpec, num_rows: usize) -> String {
    let width = table.columns.len();
    (0..num_rows)
        .map(|row| {
            let placeholders: Vec<String> = table
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| dialect.placeholder(row * width + i + 1, c))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Plain multi-row insert; with `ignore`, duplicate keys are skipped.
pub fn insert(dialect: Dialect, table: &TableSpec, num_rows: usize, ignore: bool) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| dialect.quote(&c.name)).collect();
    let values = values_clause(dialect, table, num_rows);
    let name = dialect.quote(&table.name);

    match (dialect, ignore) {
        (Dialect::MySql, true) => format!(
            "INSERT IGNORE INTO {} ({}) VALUES {}",
            name,
            columns.join(", "),
            values
        ),
        (Dialect::Sqlite, true) => format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES {}",
            name,
            columns.join(", "),
            values
        ),
        (Dialect::Postgres, true) => format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT DO NOTHING",
            name,
            columns.join(", "),
            values
        ),
        (_, false) => format!(
            "INSERT INTO {} ({}) VALUES {}",
            name,
            columns.join(", "),
            values
        ),
    }
}

/// Insert-or-update keyed by primary key.
///
/// ```sql
/// INSERT INTO "t" ("id", "name") VALUES ($1, $2)
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
pub fn upsert(dialect: Dialect, table: &TableSpec, num_rows: usize) -> String {
    let columns: Vec<String> = table.columns.iter().map(|c| dialect.quote(&c.name)).collect();
    let values = values_clause(dialect, table, num_rows);
    let name = dialect.quote(&table.name);
    let updatable: Vec<&ColumnSpec> = table
        .columns
        .iter()
        .filter(|c| !table.is_key_column(&c.name))
        .collect();

    match dialect {
        Dialect::MySql => {
            if updatable.is_empty() {
                return insert(dialect, table, num_rows, true);
            }
            let assignments: Vec<String> = updatable
                .iter()
                .map(|c| {
                    let q = dialect.quote(&c.name);
                    format!("{} = VALUES({})", q, q)
                })
                .collect();
            format!(
                "INSERT INTO {} ({}) VALUES {} ON DUPLICATE KEY UPDATE {}",
                name,
                columns.join(", "),
                values,
                assignments.join(", ")
            )
        }
        Dialect::Postgres | Dialect::Sqlite => {
            let excluded = if dialect == Dialect::Postgres {
                "EXCLUDED"
            } else {
                "excluded"
            };
            let key_cols: Vec<String> = table.primary_key.iter().map(|c| dialect.quote(c)).collect();
            let action = if updatable.is_empty() {
                "DO NOTHING".to_string()
            } else {
                let assignments: Vec<String> = updatable
                    .iter()
                    .map(|c| {
                        let q = dialect.quote(&c.name);
                        format!("{} = {}.{}", q, excluded, q)
                    })
                    .collect();
                format!("DO UPDATE SET {}", assignments.join(", "))
            };
            format!(
                "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
                name,
                columns.join(", "),
                values,
                key_cols.join(", "),
                action
            )
        }
    }
}

/// Delete rows by primary key.
///
/// For single-column PK:
/// ```sql
/// DELETE FROM "t" WHERE "id" IN ($1, $2, $3)
/// ```
///
/// For composite PK:
/// ```sql
/// DELETE FROM "t" WHERE ("a", "b") IN (($1, $2), ($3, $4))
/// ```
pub fn delete(dialect: Dialect, table: &TableSpec, num_keys: usize) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        dialect.quote(&table.name),
        key_match(dialect, table, num_keys, 1)
    )
}
