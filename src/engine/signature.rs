// ABOUTME: Row signature computer - primary key plus content hash of one row
// ABOUTME: Used by both the table differ and content-hash change detection

use sha2::{Digest, Sha256};

use crate::db::{PrimaryKey, TableSpec, Value};

/// SHA-256 digest of a row's non-key tracked columns.
pub type RowHash = [u8; 32];

/// Primary key and content hash of one row. Equal iff key and hash both match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSignature {
    pub key: PrimaryKey,
    pub hash: RowHash,
}

impl RowSignature {
    /// Compute the signature of `row`, laid out like `table.columns`.
    ///
    /// The hash covers `(column name, value)` pairs of the non-key,
    /// non-generated columns sorted by column name, so it does not depend on
    /// ordinal column position.
    pub fn compute(table: &TableSpec, row: &[Value]) -> Self {
        let key = table.key_of(row);

        let mut data: Vec<(&str, &Value)> = table
            .data_indices()
            .into_iter()
            .map(|i| {
                (
                    table.columns[i].name.as_str(),
                    row.get(i).unwrap_or(&Value::Null),
                )
            })
            .collect();
        data.sort_by(|a, b| a.0.cmp(b.0));

        let mut buf = Vec::with_capacity(64);
        for (name, value) in data {
            buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
            buf.extend_from_slice(name.as_bytes());
            value.encode_into(&mut buf);
        }

        Self {
            key,
            hash: Sha256::digest(&buf).into(),
        }
    }

    /// Digest over key and content hash, used to fold rows into a table digest.
    pub fn keyed_digest(&self) -> RowHash {
        let mut buf = Vec::with_capacity(64);
        self.key.encode_into(&mut buf);
        buf.extend_from_slice(&self.hash);
        Sha256::digest(&buf).into()
    }
}
