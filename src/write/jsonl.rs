use crate::error::{Error, Result};
use crate::types::Row;
use crate::write::storage::{columns_of, Storage, StorageWrite, TableMeta, WriteMode};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Stores each table as a JSON Lines file in a directory.
///
/// Every write goes to a temporary file that is renamed over the old one, so
/// readers see either the old or the new content. A commit stages all of its
/// tables before renaming any; a failure while staging leaves every table
/// untouched. A failure while renaming is reported as `PartialCommit`.
pub struct JsonlStorage {
    dir: PathBuf,
    commit: Mutex<()>,
}

impl JsonlStorage {
    /// Open storage rooted at a directory, creating it if needed
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(JsonlStorage {
            dir: dir.as_ref().to_path_buf(),
            commit: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", table))
    }

    fn version_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.version", table))
    }

    fn version(&self, table: &str) -> Result<Option<u64>> {
        match fs::read_to_string(self.version_path(table)) {
            Ok(text) => Ok(text.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_rows(writer: &mut impl Write, rows: &[Row]) -> Result<()> {
        for row in rows {
            serde_json::to_writer(&mut *writer, row)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn discard_partial(&self, table: &str) {
        let _ = fs::remove_file(self.data_path(table).with_extension("jsonl.tmp"));
        let _ = fs::remove_file(self.version_path(table).with_extension("version.tmp"));
    }

    /// Write a table's next content and version beside the live files.
    ///
    /// Nothing readers see changes here.
    fn prepare(&self, write: &StorageWrite, current: Option<u64>) -> Result<Prepared> {
        let path = self.data_path(&write.table);
        let version_path = self.version_path(&write.table);
        if write.mode == WriteMode::Drop {
            return Ok(Prepared::Drop { path, version_path });
        }

        let data_tmp = path.with_extension("jsonl.tmp");
        let version_tmp = version_path.with_extension("version.tmp");
        let prepared = Prepared::Swap {
            data: (data_tmp.clone(), path.clone()),
            version: (version_tmp.clone(), version_path),
        };

        if write.mode == WriteMode::Append {
            match fs::copy(&path, &data_tmp) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    File::create(&data_tmp)?;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            File::create(&data_tmp)?;
        }

        let file = OpenOptions::new().append(true).open(&data_tmp)?;
        let mut writer = BufWriter::new(file);
        Self::write_rows(&mut writer, &write.rows)?;
        writer.flush()?;

        let next = current.map(|v| v + 1).unwrap_or(1);
        fs::write(&version_tmp, next.to_string())?;
        Ok(prepared)
    }
}

/// A table write staged on disk, waiting to be published
enum Prepared {
    Swap {
        data: (PathBuf, PathBuf),
        version: (PathBuf, PathBuf),
    },
    Drop {
        path: PathBuf,
        version_path: PathBuf,
    },
}

impl Prepared {
    fn publish(&self) -> std::io::Result<()> {
        match self {
            Prepared::Swap { data, version } => {
                fs::rename(&data.0, &data.1)?;
                fs::rename(&version.0, &version.1)
            }
            Prepared::Drop { path, version_path } => {
                remove_file_if_exists(path)?;
                remove_file_if_exists(version_path)
            }
        }
    }

    fn discard(&self) {
        if let Prepared::Swap { data, version } = self {
            let _ = fs::remove_file(&data.0);
            let _ = fs::remove_file(&version.0);
        }
    }
}

fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Storage for JsonlStorage {
    fn read_table(&self, name: &str) -> Result<Vec<Row>> {
        let file = match File::open(self.data_path(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            rows.push(serde_json::from_str(&line)?);
        }
        Ok(rows)
    }

    fn list_tables(&self) -> Result<Vec<TableMeta>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let rows = self.read_table(name)?;
            tables.push(TableMeta {
                name: name.to_string(),
                columns: columns_of(&rows),
                row_count: rows.len(),
                version: self.version(name)?.unwrap_or(0),
            });
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    fn table_meta(&self, name: &str) -> Result<Option<TableMeta>> {
        let Some(version) = self.version(name)? else {
            return Ok(None);
        };
        let rows = self.read_table(name)?;
        Ok(Some(TableMeta {
            name: name.to_string(),
            columns: columns_of(&rows),
            row_count: rows.len(),
            version,
        }))
    }

    fn write_tables(&self, writes: Vec<StorageWrite>) -> Result<()> {
        let _commit = self.commit.lock();

        let mut current = Vec::with_capacity(writes.len());
        for write in &writes {
            let version = self.version(&write.table)?;
            if !write.expect.matches(version) {
                return Err(Error::WriteConflict {
                    table: write.table.clone(),
                    expected: write.expect.expected(),
                    found: version,
                });
            }
            current.push(version);
        }

        // Stage every table first so a failure here leaves all tables as
        // they were
        let mut prepared = Vec::with_capacity(writes.len());
        for (write, version) in writes.iter().zip(current) {
            match self.prepare(write, version) {
                Ok(staged) => prepared.push(staged),
                Err(e) => {
                    for staged in &prepared {
                        staged.discard();
                    }
                    self.discard_partial(&write.table);
                    return Err(e);
                }
            }
        }

        for (i, (write, staged)) in writes.iter().zip(&prepared).enumerate() {
            if let Err(source) = staged.publish() {
                for rest in &prepared[i..] {
                    rest.discard();
                }
                return Err(Error::PartialCommit {
                    table: write.table.clone(),
                    source,
                });
            }
            tracing::debug!(table = %write.table, rows = write.rows.len(), dir = %self.dir.display(), "wrote jsonl table");
        }

        Ok(())
    }
}
