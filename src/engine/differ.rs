// ABOUTME: Table differ - merge-joins key-ordered row signatures of both sides
// ABOUTME: Produces the inserts, updates and deletes that make the target match the source

use std::cmp::Ordering;
use std::collections::VecDeque;

use super::signature::RowSignature;
use crate::db::{Connection, PrimaryKey, Row, TableSpec};
use crate::error::{Result, SyncError};

/// Changes that bring one target table in line with its source.
///
/// A primary key appears in at most one of `inserts`, `updates` and
/// `deletes`. Rows are laid out like `table.columns`.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Tracked shape both sides were read with
    pub table: TableSpec,
    /// Full source rows missing on the target
    pub inserts: Vec<Row>,
    /// Full source rows whose content differs on the target
    pub updates: Vec<Row>,
    /// Keys present only on the target
    pub deletes: Vec<PrimaryKey>,
}

impl ChangeSet {
    pub fn empty(table: TableSpec) -> Self {
        Self {
            table,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Pages through one side's signatures in key order.
struct SignatureCursor<'a> {
    conn: &'a mut dyn Connection,
    table: &'a TableSpec,
    side: &'static str,
    page_size: usize,
    page: VecDeque<RowSignature>,
    after: Option<PrimaryKey>,
    last_returned: Option<PrimaryKey>,
    exhausted: bool,
}

impl<'a> SignatureCursor<'a> {
    fn new(
        conn: &'a mut dyn Connection,
        table: &'a TableSpec,
        side: &'static str,
        page_size: usize,
    ) -> Self {
        Self {
            conn,
            table,
            side,
            page_size,
            page: VecDeque::new(),
            after: None,
            last_returned: None,
            exhausted: false,
        }
    }

    async fn next(&mut self) -> Result<Option<RowSignature>> {
        if self.page.is_empty() && !self.exhausted {
            let page = self
                .conn
                .fetch_signatures(self.table, self.after.as_ref(), self.page_size)
                .await?;
            self.exhausted = page.len() < self.page_size;
            self.after = page.last().map(|s| s.key.clone());
            self.page = page.into();
        }

        let Some(next) = self.page.pop_front() else {
            return Ok(None);
        };
        // A backend whose ordering disagrees with PrimaryKey's would make the
        // merge silently wrong.
        if let Some(last) = &self.last_returned {
            if next.key <= *last {
                return Err(SyncError::KeyOrder {
                    table: self.table.name.clone(),
                    side: self.side,
                });
            }
        }
        self.last_returned = Some(next.key.clone());
        Ok(Some(next))
    }
}

/// Diff one table between source and target.
///
/// Both sides are streamed in primary-key order, `page_size` signatures at
/// a time, and merged:
///
/// - key only in source -> insert
/// - key only in target -> delete
/// - key in both, hashes differ -> update
///
/// Full rows are fetched from the source afterwards, only for inserts and
/// updates. Fails with `SchemaMismatch` when the two shapes are incompatible.
pub async fn diff(
    source_spec: &TableSpec,
    target_spec: &TableSpec,
    source: &mut dyn Connection,
    target: &mut dyn Connection,
    page_size: usize,
) -> Result<ChangeSet> {
    let table = TableSpec::reconcile(source_spec, target_spec)?;

    let mut insert_keys = Vec::new();
    let mut update_keys = Vec::new();
    let mut deletes = Vec::new();

    {
        let mut src = SignatureCursor::new(&mut *source, &table, "source", page_size);
        let mut dst = SignatureCursor::new(target, &table, "target", page_size);

        let mut s = src.next().await?;
        let mut t = dst.next().await?;

        loop {
            match (s.take(), t.take()) {
                (None, None) => break,
                (Some(a), None) => {
                    insert_keys.push(a.key);
                    s = src.next().await?;
                }
                (None, Some(b)) => {
                    deletes.push(b.key);
                    t = dst.next().await?;
                }
                (Some(a), Some(b)) => match a.key.cmp(&b.key) {
                    Ordering::Less => {
                        insert_keys.push(a.key);
                        s = src.next().await?;
                        t = Some(b);
                    }
                    Ordering::Greater => {
                        deletes.push(b.key);
                        s = Some(a);
                        t = dst.next().await?;
                    }
                    Ordering::Equal => {
                        if a.hash != b.hash {
                            update_keys.push(a.key);
                        }
                        s = src.next().await?;
                        t = dst.next().await?;
                    }
                },
            }
        }
    }

    let inserts = fetch_payload(source, &table, &insert_keys, page_size).await?;
    let updates = fetch_payload(source, &table, &update_keys, page_size).await?;

    Ok(ChangeSet {
        table,
        inserts,
        updates,
        deletes,
    })
}

/// Full rows for `keys`, in key order. Rows deleted from the source since
/// the merge are dropped.
async fn fetch_payload(
    source: &mut dyn Connection,
    table: &TableSpec,
    keys: &[PrimaryKey],
    chunk_size: usize,
) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(chunk_size.max(1)) {
        rows.extend(source.fetch_rows(table, chunk).await?);
    }
    rows.sort_by_key(|row| table.key_of(row));
    if rows.len() < keys.len() {
        tracing::debug!(
            "[{}] {} rows vanished from the source while diffing",
            table.name,
            keys.len() - rows.len()
        );
    }
    Ok(rows)
}
