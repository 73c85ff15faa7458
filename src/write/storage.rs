use crate::error::Result;
use crate::types::Row;
use serde::Serialize;

/// Metadata about a stored table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<String>,
    pub row_count: usize,
    /// Bumped on every committed write
    pub version: u64,
}

/// Physical write applied by a storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Add rows after the existing ones
    Append,
    /// Swap the whole table content for the given rows
    Replace,
    /// Remove the table; its rows are ignored
    Drop,
}

/// Version a table must be at for a write to be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Any,
    Absent,
    Version(u64),
}

impl Expect {
    pub fn from_meta(meta: Option<&TableMeta>) -> Self {
        match meta {
            Some(meta) => Expect::Version(meta.version),
            None => Expect::Absent,
        }
    }

    pub fn matches(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Version(v), Some(c)) => *v == c,
            _ => false,
        }
    }

    pub fn expected(&self) -> Option<u64> {
        match self {
            Expect::Version(v) => Some(*v),
            _ => None,
        }
    }
}

/// One table's share of a storage commit
#[derive(Debug, Clone)]
pub struct StorageWrite {
    pub table: String,
    pub rows: Vec<Row>,
    pub mode: WriteMode,
    pub expect: Expect,
}

/// The destination that owns physical tables.
///
/// Backends create tables on first write and never need schema DDL from the
/// caller. A missing table reads as empty.
pub trait Storage: Send + Sync {
    fn read_table(&self, name: &str) -> Result<Vec<Row>>;

    fn list_tables(&self) -> Result<Vec<TableMeta>>;

    /// Commit writes to several tables. Backends that can make this atomic
    /// must apply all of them or none.
    fn write_tables(&self, writes: Vec<StorageWrite>) -> Result<()>;

    fn table_meta(&self, name: &str) -> Result<Option<TableMeta>> {
        Ok(self.list_tables()?.into_iter().find(|t| t.name == name))
    }

    fn write_table(&self, name: &str, rows: Vec<Row>, mode: WriteMode) -> Result<()> {
        self.write_tables(vec![StorageWrite {
            table: name.to_string(),
            rows,
            mode,
            expect: Expect::Any,
        }])
    }
}

/// Column names in first-seen order across rows
pub(crate) fn columns_of<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Vec<String> {
    let mut columns = indexmap::IndexSet::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(key) {
                columns.insert(key.clone());
            }
        }
    }
    columns.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_matches() {
        assert!(Expect::Any.matches(None));
        assert!(Expect::Any.matches(Some(3)));
        assert!(Expect::Absent.matches(None));
        assert!(!Expect::Absent.matches(Some(0)));
        assert!(Expect::Version(2).matches(Some(2)));
        assert!(!Expect::Version(2).matches(Some(3)));
        assert!(!Expect::Version(2).matches(None));
    }
}
