// ABOUTME: Backend-neutral column values, primary keys, rows and table shapes
// ABOUTME: Defines the primary-key ordering every backend must stream rows in

use std::cmp::Ordering;

use crate::error::{Result, SyncError};

/// A single column value as read from any backend.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Sort class: NULL < numbers < text < bytes.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::UInt(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
        }
    }

    /// Append a self-delimiting encoding of the value. Distinct values never
    /// share an encoding; in particular NULL and the empty string differ.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Null => buf.push(0),
            Value::Int(i) => {
                buf.push(1);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::UInt(u) => {
                // Values that fit i64 encode like Int so 5u64 and 5i64 hash alike.
                if let Ok(i) = i64::try_from(*u) {
                    buf.push(1);
                    buf.extend_from_slice(&i.to_be_bytes());
                } else {
                    buf.push(2);
                    buf.extend_from_slice(&u.to_be_bytes());
                }
            }
            Value::Float(f) => {
                buf.push(3);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::Text(s) => {
                buf.push(4);
                buf.extend_from_slice(&(s.len() as u64).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(5);
                buf.extend_from_slice(&(b.len() as u64).to_be_bytes());
                buf.extend_from_slice(b);
            }
        }
    }
}

fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::UInt(x), Value::UInt(y)) => x.cmp(y),
        (Value::Int(x), Value::UInt(y)) => {
            if *x < 0 {
                Ordering::Less
            } else {
                (*x as u64).cmp(y)
            }
        }
        (Value::UInt(_), Value::Int(_)) => cmp_numeric(b, a).reverse(),
        _ => as_f64(a).total_cmp(&as_f64(b)),
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::UInt(u) => *u as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Text(a), Value::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ if self.rank() == 1 && other.rank() == 1 => cmp_numeric(self, other),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Primary-key tuple. Ordered lexicographically, column by column in
/// declared key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.0.len() as u32).to_be_bytes());
        for value in &self.0 {
            value.encode_into(buf);
        }
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", value)?;
        }
        f.write_str(")")
    }
}

/// Full row, values aligned with the tracked columns of a [`TableSpec`].
pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    /// Declared type as reported by the backend (e.g. `varchar(255)`, `bigint`).
    pub data_type: String,
    /// Generated/computed column; never written, never hashed.
    pub generated: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            generated: false,
        }
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }
}

/// Table name, ordered columns and primary key, as resolved by introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>, primary_key: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Positions of the primary-key columns within `columns`, in key order.
    pub fn key_indices(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|pk| self.columns.iter().position(|c| &c.name == pk))
            .collect()
    }

    /// Positions of the non-key, non-generated columns.
    pub fn data_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.generated && !self.primary_key.contains(&c.name))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn key_columns(&self) -> Vec<&ColumnSpec> {
        self.key_indices().into_iter().map(|i| &self.columns[i]).collect()
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == name)
    }

    /// Extract the primary key of a row laid out like `columns`.
    pub fn key_of(&self, row: &[Value]) -> PrimaryKey {
        PrimaryKey(
            self.key_indices()
                .into_iter()
                .map(|i| row.get(i).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Shape both sides are diffed and written with.
    ///
    /// The tracked columns are the source's non-generated columns, in source
    /// order. The target may carry extra columns (left untouched) but must
    /// have every tracked column and the same primary key.
    pub fn reconcile(source: &TableSpec, target: &TableSpec) -> Result<TableSpec> {
        if source.primary_key.is_empty() {
            return Err(SyncError::schema_mismatch(
                &source.name,
                "no primary key defined; cannot safely diff rows",
            ));
        }
        if source.primary_key != target.primary_key {
            return Err(SyncError::schema_mismatch(
                &source.name,
                format!(
                    "primary key differs: source ({}) vs target ({})",
                    source.primary_key.join(", "),
                    target.primary_key.join(", ")
                ),
            ));
        }

        let mut columns = Vec::with_capacity(source.columns.len());
        let mut missing = Vec::new();
        for column in source.columns.iter().filter(|c| !c.generated) {
            match target.column(&column.name) {
                Some(t) if t.generated => missing.push(format!("{} (generated on target)", column.name)),
                Some(_) => columns.push(column.clone()),
                None => missing.push(column.name.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(SyncError::schema_mismatch(
                &source.name,
                format!("columns missing on target: {}", missing.join(", ")),
            ));
        }
        if let Some(pk) = source.primary_key.iter().find(|pk| !columns.iter().any(|c| &c.name == *pk)) {
            return Err(SyncError::schema_mismatch(
                &source.name,
                format!("primary key column '{}' is generated", pk),
            ));
        }

        Ok(TableSpec {
            name: source.name.clone(),
            columns,
            primary_key: source.primary_key.clone(),
        })
    }
}
