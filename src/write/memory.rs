use crate::error::{Error, Result};
use crate::types::Row;
use crate::write::storage::{columns_of, Storage, StorageWrite, TableMeta, WriteMode};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct StoredTable {
    version: u64,
    rows: Vec<Row>,
}

/// In-process storage with versioned tables and atomic multi-table commits
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<BTreeMap<String, StoredTable>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        Ok(self
            .tables
            .read()
            .get(name)
            .map(|t| t.rows.clone())
            .unwrap_or_default())
    }

    fn list_tables(&self) -> Result<Vec<TableMeta>> {
        Ok(self
            .tables
            .read()
            .iter()
            .map(|(name, table)| TableMeta {
                name: name.clone(),
                columns: columns_of(&table.rows),
                row_count: table.rows.len(),
                version: table.version,
            })
            .collect())
    }

    fn write_tables(&self, writes: Vec<StorageWrite>) -> Result<()> {
        let mut tables = self.tables.write();

        // Check every expectation before touching anything
        for write in &writes {
            let current = tables.get(&write.table).map(|t| t.version);
            if !write.expect.matches(current) {
                return Err(Error::WriteConflict {
                    table: write.table.clone(),
                    expected: write.expect.expected(),
                    found: current,
                });
            }
        }

        for write in writes {
            if write.mode == WriteMode::Drop {
                tables.remove(&write.table);
                continue;
            }
            let table = tables.entry(write.table).or_default();
            match write.mode {
                WriteMode::Append => table.rows.extend(write.rows),
                _ => table.rows = write.rows,
            }
            table.version += 1;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::storage::Expect;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_append_and_replace() {
        let storage = MemoryStorage::new();
        assert!(storage.read_table("t").unwrap().is_empty());

        storage.write_table("t", vec![row(json!({"a": 1}))], WriteMode::Append).unwrap();
        storage.write_table("t", vec![row(json!({"b": 2}))], WriteMode::Append).unwrap();
        assert_eq!(storage.read_table("t").unwrap().len(), 2);

        let meta = storage.table_meta("t").unwrap().unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.columns, vec!["a", "b"]);

        storage.write_table("t", vec![], WriteMode::Replace).unwrap();
        assert!(storage.read_table("t").unwrap().is_empty());
        assert_eq!(storage.list_tables().unwrap().len(), 1);

        storage.write_table("t", vec![], WriteMode::Drop).unwrap();
        assert!(storage.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_conflicting_commit_applies_nothing() {
        let storage = MemoryStorage::new();
        storage.write_table("b", vec![row(json!({"x": 1}))], WriteMode::Append).unwrap();

        let err = storage
            .write_tables(vec![
                StorageWrite {
                    table: "a".to_string(),
                    rows: vec![row(json!({"y": 1}))],
                    mode: WriteMode::Append,
                    expect: Expect::Absent,
                },
                StorageWrite {
                    table: "b".to_string(),
                    rows: vec![],
                    mode: WriteMode::Replace,
                    expect: Expect::Version(7),
                },
            ])
            .unwrap_err();

        assert!(matches!(err, Error::WriteConflict { found: Some(1), .. }));
        assert!(storage.table_meta("a").unwrap().is_none());
        assert_eq!(storage.read_table("b").unwrap().len(), 1);
    }
}
