use crate::error::{Error, Result};
use crate::types::{canonical, key_text, HardDelete, Row, WriteDisposition, ROW_ID};
use crate::write::storage::{Expect, Storage, StorageWrite, WriteMode};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Rows to persist into one table and how
#[derive(Debug, Clone)]
pub struct TableWrite {
    pub table: String,
    pub rows: Vec<Row>,
    pub disposition: WriteDisposition,
    /// Merge key; defaults to the row identity
    pub primary_key: Vec<String>,
    pub hard_delete: HardDelete,
    /// Existing rows sharing a value of this column with the batch, but
    /// absent from it, are removed by a merge
    pub scope: Option<String>,
    /// Scope values whose existing rows are all removed by a merge
    pub purge: Vec<Value>,
}

impl TableWrite {
    pub fn new(table: impl Into<String>, rows: Vec<Row>, disposition: WriteDisposition) -> Self {
        TableWrite {
            table: table.into(),
            rows,
            disposition,
            primary_key: vec![ROW_ID.to_string()],
            hard_delete: HardDelete::None,
            scope: None,
            purge: vec![],
        }
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if !columns.is_empty() {
            self.primary_key = columns;
        }
        self
    }

    pub fn with_hard_delete(mut self, hard_delete: HardDelete) -> Self {
        self.hard_delete = hard_delete;
        self
    }

    pub fn scoped_by(mut self, column: impl Into<String>) -> Self {
        self.scope = Some(column.into());
        self
    }

    pub fn purging(mut self, values: Vec<Value>) -> Self {
        self.purge = values;
        self
    }
}

/// What a write did to its table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub table: String,
    pub disposition: WriteDisposition,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Applies write dispositions on top of a [`Storage`] backend.
///
/// Writers to the same table are serialized; writes to different tables
/// proceed concurrently.
pub struct WriteCoordinator<S: Storage + ?Sized> {
    storage: Arc<S>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: Storage + ?Sized> WriteCoordinator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        WriteCoordinator {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Per-table locks, in name order so overlapping batches cannot deadlock
    fn table_locks<'a>(&self, tables: impl Iterator<Item = &'a str>) -> Vec<Arc<Mutex<()>>> {
        let mut names: Vec<&str> = tables.collect();
        names.sort_unstable();
        names.dedup();

        let mut locks = self.locks.lock();
        names
            .into_iter()
            .map(|name| locks.entry(name.to_string()).or_default().clone())
            .collect()
    }

    /// Swap staged rows into their targets in one commit.
    ///
    /// Each `(target, staging)` pair replaces the target with the staging
    /// table's rows. Each `cleared` table is replaced with no rows. All
    /// staging tables, including those of cleared targets, are dropped.
    pub fn promote(&self, staged: &[(String, String)], cleared: &[(String, String)]) -> Result<Vec<WriteSummary>> {
        let names = staged
            .iter()
            .chain(cleared)
            .flat_map(|(target, staging)| [target.as_str(), staging.as_str()]);
        let handles = self.table_locks(names);
        let _guards: Vec<_> = handles.iter().map(|lock| lock.lock()).collect();

        let mut commit = Vec::new();
        let mut summaries = Vec::new();
        let targets = staged
            .iter()
            .map(|(target, staging)| (target, Some(staging)))
            .chain(cleared.iter().map(|(target, _)| (target, None)));
        for (target, staging) in targets {
            let rows = match staging {
                Some(staging) => self.storage.read_table(staging)?,
                None => vec![],
            };
            let existing = self.storage.table_meta(target)?;
            summaries.push(WriteSummary {
                table: target.clone(),
                disposition: WriteDisposition::Replace,
                inserted: rows.len(),
                updated: 0,
                deleted: existing.map(|m| m.row_count).unwrap_or(0),
            });
            commit.push(StorageWrite {
                table: target.clone(),
                rows,
                mode: WriteMode::Replace,
                expect: Expect::Any,
            });
        }
        for (_, staging) in staged.iter().chain(cleared) {
            commit.push(StorageWrite {
                table: staging.clone(),
                rows: vec![],
                mode: WriteMode::Drop,
                expect: Expect::Any,
            });
        }

        self.storage.write_tables(commit)?;
        for summary in &summaries {
            tracing::info!(table = %summary.table, rows = summary.inserted, "promoted staged table");
        }
        Ok(summaries)
    }

    /// Drop tables outright
    pub fn discard(&self, tables: &[String]) -> Result<()> {
        let handles = self.table_locks(tables.iter().map(String::as_str));
        let _guards: Vec<_> = handles.iter().map(|lock| lock.lock()).collect();

        let commit = tables
            .iter()
            .map(|table| StorageWrite {
                table: table.clone(),
                rows: vec![],
                mode: WriteMode::Drop,
                expect: Expect::Any,
            })
            .collect();
        self.storage.write_tables(commit)
    }

    /// Persist rows into a table. Merges are keyed by row identity.
    pub fn apply(&self, table: &str, rows: Vec<Row>, disposition: WriteDisposition) -> Result<WriteSummary> {
        let mut summaries = self.apply_batch(vec![TableWrite::new(table, rows, disposition)])?;
        Ok(summaries.remove(0))
    }

    pub fn apply_write(&self, write: TableWrite) -> Result<WriteSummary> {
        let mut summaries = self.apply_batch(vec![write])?;
        Ok(summaries.remove(0))
    }

    /// Persist writes to several tables in one commit
    pub fn apply_batch(&self, writes: Vec<TableWrite>) -> Result<Vec<WriteSummary>> {
        let handles = self.table_locks(writes.iter().map(|w| w.table.as_str()));
        let _guards: Vec<_> = handles.iter().map(|lock| lock.lock()).collect();

        let mut commit = Vec::with_capacity(writes.len());
        let mut summaries = Vec::with_capacity(writes.len());

        for write in writes {
            let mut summary = WriteSummary {
                table: write.table.clone(),
                disposition: write.disposition,
                ..Default::default()
            };

            let storage_write = match write.disposition {
                WriteDisposition::Append => {
                    summary.inserted = write.rows.len();
                    StorageWrite {
                        table: write.table,
                        rows: write.rows,
                        mode: WriteMode::Append,
                        expect: Expect::Any,
                    }
                }
                WriteDisposition::Replace => {
                    let existing = self.storage.table_meta(&write.table)?;
                    summary.deleted = existing.map(|m| m.row_count).unwrap_or(0);
                    summary.inserted = write.rows.len();
                    StorageWrite {
                        table: write.table,
                        rows: write.rows,
                        mode: WriteMode::Replace,
                        expect: Expect::Any,
                    }
                }
                WriteDisposition::Merge => {
                    // The version is read before the rows so a concurrent
                    // commit in between fails the check
                    let meta = self.storage.table_meta(&write.table)?;
                    let expect = Expect::from_meta(meta.as_ref());
                    let existing = self.storage.read_table(&write.table)?;
                    let (rows, stats) = merge_rows(&write, existing)?;
                    summary.inserted = stats.inserted;
                    summary.updated = stats.updated;
                    summary.deleted = stats.deleted;
                    StorageWrite {
                        table: write.table,
                        rows,
                        mode: WriteMode::Replace,
                        expect,
                    }
                }
            };

            commit.push(storage_write);
            summaries.push(summary);
        }

        self.storage.write_tables(commit)?;

        for summary in &summaries {
            tracing::info!(
                table = %summary.table,
                disposition = %summary.disposition,
                inserted = summary.inserted,
                updated = summary.updated,
                deleted = summary.deleted,
                "committed table write"
            );
        }

        Ok(summaries)
    }
}

#[derive(Debug, Default)]
struct MergeStats {
    inserted: usize,
    updated: usize,
    deleted: usize,
}

fn key_of(row: &Row, table: &str, key: &[String]) -> Result<String> {
    let mut values = Vec::with_capacity(key.len());
    for column in key {
        match row.get(column) {
            Some(value) if !value.is_null() => values.push(key_text(value)),
            _ => {
                return Err(Error::MissingPrimaryKey {
                    table: table.to_string(),
                    column: column.clone(),
                })
            }
        }
    }
    Ok(values.join("\u{1f}"))
}

/// Upsert `write.rows` into `existing` by key, field by field
fn merge_rows(write: &TableWrite, existing: Vec<Row>) -> Result<(Vec<Row>, MergeStats)> {
    let mut stats = MergeStats::default();
    let existing_len = existing.len();
    let mut result: Vec<Option<Row>> = existing.into_iter().map(Some).collect();

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut existing_keys: Vec<Option<String>> = Vec::with_capacity(existing_len);
    for (i, row) in result.iter().enumerate() {
        // Rows stored without a key are never matched
        let key = row
            .as_ref()
            .and_then(|r| key_of(r, &write.table, &write.primary_key).ok());
        if let Some(key) = &key {
            index.insert(key.clone(), i);
        }
        existing_keys.push(key);
    }

    let flag = match &write.hard_delete {
        HardDelete::Flag(column) => Some(column.as_str()),
        _ => None,
    };

    let mut batch_keys = HashSet::new();
    let mut scopes: HashSet<String> = write.purge.iter().map(canonical).collect();

    for row in &write.rows {
        let key = key_of(row, &write.table, &write.primary_key)?;
        batch_keys.insert(key.clone());
        if let Some(scope) = &write.scope {
            if let Some(value) = row.get(scope) {
                scopes.insert(canonical(value));
            }
        }

        let delete = flag
            .map(|f| row.get(f) == Some(&Value::Bool(true)))
            .unwrap_or(false);

        match index.get(&key).copied() {
            Some(i) if delete => {
                if result[i].take().is_some() {
                    stats.deleted += 1;
                }
            }
            None if delete => {}
            Some(i) => match result[i].as_mut() {
                Some(target) => {
                    for (field, value) in row {
                        target.insert(field.clone(), value.clone());
                    }
                    stats.updated += 1;
                }
                None => {
                    result[i] = Some(row.clone());
                    stats.inserted += 1;
                }
            },
            None => {
                index.insert(key, result.len());
                result.push(Some(row.clone()));
                stats.inserted += 1;
            }
        }
    }

    for i in 0..existing_len {
        let Some(key) = &existing_keys[i] else {
            continue;
        };
        if batch_keys.contains(key) || result[i].is_none() {
            continue;
        }

        let in_scope = match (&write.scope, &result[i]) {
            (Some(scope), Some(row)) => row
                .get(scope)
                .map(|v| scopes.contains(&canonical(v)))
                .unwrap_or(false),
            _ => false,
        };

        if write.hard_delete == HardDelete::Absent || in_scope {
            result[i] = None;
            stats.deleted += 1;
        }
    }

    Ok((result.into_iter().flatten().collect(), stats))
}
