//! Run orchestration: records in, committed tables out
//!
//! A [`Pipeline`] pulls records lazily, normalizes them in batches, folds
//! each batch's schema changes into the model through one reducer, conforms
//! the rows and commits every table the batch touched in a single write.
//! A batch either lands completely or not at all, so parent and child rows
//! never get separated.

use crate::error::{Error, Result};
use crate::normalize::{NormalizedRecord, Normalizer};
use crate::schema::{SchemaConflict, SchemaModel};
use crate::types::{HardDelete, PipelineConfig, Record, Row, WriteDisposition, ROOT_ID, ROW_ID};
use crate::write::{Storage, TableWrite, WriteCoordinator};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Prefix of the tables a replace run writes into before swapping
pub const STAGING_PREFIX: &str = "_staging__";

pub fn staging_table(table: &str) -> String {
    format!("{}{}", STAGING_PREFIX, table)
}

/// A record that could not be normalized
#[derive(Debug)]
pub struct RecordError {
    /// Position of the record in the input
    pub index: usize,
    pub error: Error,
}

/// What a run did
#[derive(Debug, Default)]
pub struct RunReport {
    /// Records pulled from the input
    pub records: usize,
    /// Records whose rows were committed
    pub committed: usize,
    pub batches: usize,
    /// Rows written per target table
    pub rows: BTreeMap<String, usize>,
    pub errors: Vec<RecordError>,
    pub conflicts: Vec<SchemaConflict>,
    /// Values nulled because they did not fit their column
    pub dropped_values: usize,
    /// Batch commits retried after a conflict
    pub retries: usize,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.conflicts.is_empty() && self.dropped_values == 0
    }

    /// Serializable digest for logs and command output
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            records: self.records,
            committed: self.committed,
            batches: self.batches,
            rows: self.rows.clone(),
            errors: self
                .errors
                .iter()
                .map(|e| format!("record {}: {}", e.index, e.error))
                .collect(),
            conflicts: self.conflicts.len(),
            dropped_values: self.dropped_values,
            retries: self.retries,
            cancelled: self.cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub records: usize,
    pub committed: usize,
    pub batches: usize,
    pub rows: BTreeMap<String, usize>,
    pub errors: Vec<String>,
    pub conflicts: usize,
    pub dropped_values: usize,
    pub retries: usize,
    pub cancelled: bool,
}

pub struct Pipeline<S: Storage + ?Sized> {
    config: PipelineConfig,
    normalizer: Normalizer,
    /// Schema of everything committed so far
    schema: SchemaModel,
    coordinator: Arc<WriteCoordinator<S>>,
    cancel: Arc<AtomicBool>,
    report: RunReport,
    /// Targets with rows in staging from this run
    staged: BTreeSet<String>,
    /// Root rows upserted by this run, for deleting absent ones at the end
    seen_roots: HashSet<String>,
}

impl<S: Storage + ?Sized> Pipeline<S> {
    pub fn new(config: PipelineConfig, schema: SchemaModel, storage: Arc<S>) -> Self {
        Self::with_coordinator(config, schema, Arc::new(WriteCoordinator::new(storage)))
    }

    pub fn with_coordinator(
        config: PipelineConfig,
        schema: SchemaModel,
        coordinator: Arc<WriteCoordinator<S>>,
    ) -> Self {
        Pipeline {
            normalizer: Normalizer::new(config.clone()),
            config,
            schema,
            coordinator,
            cancel: Arc::new(AtomicBool::new(false)),
            report: RunReport::default(),
            staged: BTreeSet::new(),
            seen_roots: HashSet::new(),
        }
    }

    pub fn schema(&self) -> &SchemaModel {
        &self.schema
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn coordinator(&self) -> &Arc<WriteCoordinator<S>> {
        &self.coordinator
    }

    /// Set the returned flag to stop the run at the next batch boundary
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Normalize and commit a whole input, then finish the run
    pub fn run<I>(mut self, records: I) -> Result<(SchemaModel, RunReport)>
    where
        I: IntoIterator<Item = Record>,
    {
        self.ingest(records)?;
        self.finish()
    }

    /// Pull records and commit them batch by batch.
    ///
    /// A top-level array is read as a sequence of records. Records that fail
    /// to normalize are reported and skipped. A failed commit stops the
    /// run; batches committed before it stay committed.
    pub fn ingest<I>(&mut self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = Record>,
    {
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        let records = records.into_iter().flat_map(|record| match record {
            Value::Array(items) => items,
            other => vec![other],
        });

        for record in records {
            if batch.is_empty() && self.cancel.load(Ordering::SeqCst) {
                tracing::info!(records = self.report.records, "run cancelled");
                self.report.cancelled = true;
                return Ok(());
            }

            batch.push((self.report.records, record));
            self.report.records += 1;

            if batch.len() >= batch_size {
                self.commit_batch(std::mem::take(&mut batch))?;
            }
        }

        if !batch.is_empty() {
            self.commit_batch(batch)?;
        }
        Ok(())
    }

    /// Complete the run and hand back the schema and report.
    ///
    /// A replace run swaps its staged tables into place here. A merge run
    /// with `hard_delete: absent` deletes root rows it did not see, along
    /// with their children. A cancelled run does neither and leaves targets
    /// as they were.
    pub fn finish(mut self) -> Result<(SchemaModel, RunReport)> {
        let root = self.config.table_name.clone();
        let family: Vec<String> = self
            .schema
            .family(&root)
            .into_iter()
            .map(|t| t.name.clone())
            .collect();

        if self.report.cancelled {
            if self.config.write_disposition == WriteDisposition::Replace {
                let staging: Vec<String> = family.iter().map(|t| staging_table(t)).collect();
                self.coordinator.discard(&staging)?;
            }
            return Ok((self.schema, self.report));
        }

        match (&self.config.write_disposition, &self.config.hard_delete) {
            (WriteDisposition::Replace, _) => {
                let (staged, cleared): (Vec<String>, Vec<String>) =
                    family.into_iter().partition(|t| self.staged.contains(t));
                let pair = |t: String| {
                    let staging = staging_table(&t);
                    (t, staging)
                };
                let staged: Vec<(String, String)> = staged.into_iter().map(pair).collect();
                let cleared: Vec<(String, String)> = cleared.into_iter().map(pair).collect();
                self.coordinator.promote(&staged, &cleared)?;
            }
            (WriteDisposition::Merge, HardDelete::Absent) => self.delete_unseen(&root, &family)?,
            _ => {}
        }

        tracing::info!(
            records = self.report.records,
            committed = self.report.committed,
            errors = self.report.errors.len(),
            version = self.schema.version,
            "run finished"
        );
        Ok((self.schema, self.report))
    }

    fn delete_unseen(&mut self, root: &str, family: &[String]) -> Result<()> {
        let unseen: Vec<Value> = self
            .coordinator
            .storage()
            .read_table(root)?
            .into_iter()
            .filter_map(|row| row.get(ROW_ID).cloned())
            .filter(|id| id.as_str().map(|id| !self.seen_roots.contains(id)).unwrap_or(false))
            .collect();
        if unseen.is_empty() {
            return Ok(());
        }

        let writes = family
            .iter()
            .map(|table| {
                let scope = if table == root { ROW_ID } else { ROOT_ID };
                TableWrite::new(table.as_str(), vec![], WriteDisposition::Merge)
                    .scoped_by(scope)
                    .purging(unseen.clone())
            })
            .collect();
        let summaries = self.coordinator.apply_batch(writes)?;
        tracing::info!(
            roots = unseen.len(),
            deleted = summaries.iter().map(|s| s.deleted).sum::<usize>(),
            "deleted rows absent from the run"
        );
        Ok(())
    }

    /// Normalize a batch, in parallel when configured, keeping input order
    fn normalize_batch(&self, records: Vec<(usize, Record)>) -> Vec<(usize, Result<NormalizedRecord>)> {
        let normalizer = &self.normalizer;
        let schema = &self.schema;
        let workers = self.config.workers.max(1);

        if workers == 1 || records.len() < 2 {
            return records
                .into_iter()
                .map(|(index, record)| (index, normalizer.normalize(schema, record)))
                .collect();
        }

        let chunk = records.len().div_ceil(workers);
        let mut chunks = Vec::with_capacity(workers);
        let mut records = records.into_iter();
        loop {
            let next: Vec<(usize, Record)> = records.by_ref().take(chunk).collect();
            if next.is_empty() {
                break;
            }
            chunks.push(next);
        }

        std::thread::scope(|scope| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .into_iter()
                            .map(|(index, record)| (index, normalizer.normalize(schema, record)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }

    fn commit_batch(&mut self, records: Vec<(usize, Record)>) -> Result<()> {
        let normalized = self.normalize_batch(records);

        // Schema evolution goes through this single reducer
        let mut working = self.schema.clone();
        let mut conflicts = Vec::new();
        let mut tables: IndexMap<String, Vec<Row>> = IndexMap::new();
        let mut errors = Vec::new();
        let mut committed = 0;

        let mut accepted = Vec::new();
        for (index, result) in normalized {
            match result {
                Ok(record) => accepted.push(record),
                Err(error) => {
                    tracing::warn!(index, error = %error, "skipping record");
                    errors.push(RecordError { index, error });
                }
            }
        }

        for record in &mut accepted {
            let delta = std::mem::take(&mut record.delta);
            conflicts.append(&mut record.conflicts);
            conflicts.extend(working.apply_delta(delta, self.config.null_policy));
        }

        committed += accepted.len();
        if self.config.write_disposition == WriteDisposition::Merge {
            accepted = last_per_root(accepted);
        }

        let mut dropped = 0;
        let mut roots = Vec::new();
        for record in accepted {
            roots.push(record.root_id.to_string());
            for fragment in record.fragments {
                let (row, nulled) = working.conform_row(&fragment.table, fragment.row);
                dropped += nulled;
                tables.entry(fragment.table).or_default().push(row);
            }
        }

        for conflict in &conflicts {
            tracing::warn!(table = %conflict.table, error = %Error::from(conflict), "schema conflict");
        }

        let counts: Vec<(String, usize)> = tables.iter().map(|(t, rows)| (t.clone(), rows.len())).collect();
        if !tables.is_empty() {
            let writes = self.plan_writes(tables);
            self.commit_with_retries(writes)?;
        }

        // Only a committed batch moves the schema forward
        self.schema = working;
        if self.config.write_disposition == WriteDisposition::Replace {
            self.staged.extend(counts.iter().map(|(t, _)| t.clone()));
        }
        if self.config.write_disposition == WriteDisposition::Merge {
            self.seen_roots.extend(roots);
        }
        for (table, count) in counts {
            *self.report.rows.entry(table).or_default() += count;
        }
        self.report.batches += 1;
        self.report.committed += committed;
        self.report.dropped_values += dropped;
        self.report.errors.append(&mut errors);
        self.report.conflicts.append(&mut conflicts);

        tracing::debug!(
            batch = self.report.batches,
            records = committed,
            version = self.schema.version,
            "committed batch"
        );
        Ok(())
    }

    /// Turn a batch's rows into table writes under the configured disposition
    fn plan_writes(&self, tables: IndexMap<String, Vec<Row>>) -> Vec<TableWrite> {
        let root = self.config.table_name.as_str();

        match self.config.write_disposition {
            WriteDisposition::Append => tables
                .into_iter()
                .map(|(table, rows)| TableWrite::new(table, rows, WriteDisposition::Append))
                .collect(),
            WriteDisposition::Replace => tables
                .into_iter()
                .map(|(table, rows)| {
                    // The first batch of a run resets whatever a failed run left behind
                    let mode = if self.staged.contains(&table) {
                        WriteDisposition::Append
                    } else {
                        WriteDisposition::Replace
                    };
                    TableWrite::new(staging_table(&table), rows, mode)
                })
                .collect(),
            WriteDisposition::Merge => {
                let root_rows = tables.get(root).map(Vec::as_slice).unwrap_or_default();
                let batch_roots: Vec<Value> = root_rows
                    .iter()
                    .filter_map(|row| row.get(ROW_ID).cloned())
                    .collect();
                let flagged: Vec<Value> = match &self.config.hard_delete {
                    HardDelete::Flag(column) => root_rows
                        .iter()
                        .filter(|row| row.get(column) == Some(&Value::Bool(true)))
                        .filter_map(|row| row.get(ROW_ID).cloned())
                        .collect(),
                    _ => vec![],
                };

                // Child tables without rows in this batch may still hold
                // children of the batch's roots
                let mut tables = tables;
                for table in self.schema.family(root) {
                    if table.name != root {
                        tables.entry(table.name.clone()).or_default();
                    }
                }

                tables
                    .into_iter()
                    .map(|(table, rows)| {
                        if table == root {
                            let hard_delete = match &self.config.hard_delete {
                                HardDelete::Flag(column) => HardDelete::Flag(column.clone()),
                                _ => HardDelete::None,
                            };
                            return TableWrite::new(table, rows, WriteDisposition::Merge)
                                .with_primary_key(self.config.primary_key.iter().cloned())
                                .with_hard_delete(hard_delete);
                        }

                        // Children of re-merged roots are replaced as a whole
                        let rows = rows
                            .into_iter()
                            .filter(|row| row.get(ROOT_ID).map(|id| !flagged.contains(id)).unwrap_or(true))
                            .collect();
                        TableWrite::new(table, rows, WriteDisposition::Merge)
                            .scoped_by(ROOT_ID)
                            .purging(batch_roots.clone())
                    })
                    .collect()
            }
        }
    }

    fn commit_with_retries(&mut self, writes: Vec<TableWrite>) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.coordinator.apply_batch(writes.clone()) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.config.write_retries => {
                    attempt += 1;
                    self.report.retries += 1;
                    tracing::warn!(attempt, error = %e, "retrying batch commit");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keep the last record of each root identity, in input order.
///
/// A merge batch holding the same key twice must land like two batches
/// would, with the later record's children replacing the earlier ones.
fn last_per_root(records: Vec<NormalizedRecord>) -> Vec<NormalizedRecord> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        last.insert(record.root_id.to_string(), i);
    }

    let superseded = records.len() - last.len();
    if superseded > 0 {
        tracing::debug!(superseded, "records replaced by a later record with the same key");
    }

    records
        .into_iter()
        .enumerate()
        .filter(|(i, record)| last.get(record.root_id.as_str()) == Some(i))
        .map(|(_, record)| record)
        .collect()
}
