//! The versioned relational schema inferred from normalized records
//!
//! A [`SchemaModel`] only changes through [`SchemaModel::apply_delta`]. Tables
//! and columns are never removed and column types only widen, so applying the
//! same deltas in any order converges on the same model.

use crate::error::{Error, Result};
use crate::schema::types::{coerce, widen, DataType};
use crate::types::{is_synthetic, NullPolicy, Row, LIST_IDX, PARENT_ID, ROOT_ID, ROW_ID};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;

/// A column of a normalized table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Set once incompatible values were observed for this column
    pub conflict: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Column {
            name: name.into(),
            data_type,
            nullable: true,
            conflict: false,
        }
    }
}

/// Link from a child table to the parent table its rows were nested in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub parent_table: String,
    /// Column on the child holding the parent's row identity
    pub child_column: String,
    /// Column on the parent holding its row identity
    pub parent_column: String,
    /// Field path from the parent row to the array
    pub path: Vec<String>,
    /// Top-level table, reachable from the child through `_root_id`
    pub root_table: String,
}

impl Link {
    pub fn new(parent_table: &str, root_table: &str, path: Vec<String>) -> Self {
        Link {
            parent_table: parent_table.to_string(),
            child_column: PARENT_ID.to_string(),
            parent_column: ROW_ID.to_string(),
            path,
            root_table: root_table.to_string(),
        }
    }
}

/// A normalized table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: IndexMap<String, Column>,
    pub parent: Option<Link>,
    pub primary_key: Vec<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            columns: IndexMap::new(),
            parent: None,
            primary_key: vec![],
        }
    }

    /// Name of the top-level table this table's rows descend from
    pub fn root_table(&self) -> &str {
        self.parent
            .as_ref()
            .map(|link| link.root_table.as_str())
            .unwrap_or(&self.name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// Observations for one column gathered while normalizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnObservation {
    /// Join of every type observed
    pub data_type: DataType,
    /// First non-null type observed
    pub first: DataType,
    /// The observations were mutually incompatible
    pub conflict: bool,
}

/// Schema additions produced by normalizing records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDelta {
    pub parent: Option<Link>,
    pub primary_key: Vec<String>,
    pub columns: IndexMap<String, ColumnObservation>,
}

/// A set of schema changes; applied to a [`SchemaModel`] atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDelta {
    pub tables: IndexMap<String, TableDelta>,
}

impl SchemaDelta {
    /// Register a table the delta produces rows for
    pub fn table(&mut self, name: &str, parent: Option<Link>, primary_key: &[String]) -> &mut TableDelta {
        self.tables.entry(name.to_string()).or_insert_with(|| TableDelta {
            parent,
            primary_key: primary_key.to_vec(),
            columns: IndexMap::new(),
        })
    }

    /// Whether a column exists in the model or was already observed here
    pub fn knows(&self, schema: &SchemaModel, table: &str, column: &str) -> bool {
        schema
            .table(table)
            .map(|t| t.columns.contains_key(column))
            .unwrap_or(false)
            || self
                .tables
                .get(table)
                .map(|t| t.columns.contains_key(column))
                .unwrap_or(false)
    }

    /// Record an observed type for a column
    pub fn observe(&mut self, table: &str, column: &str, observed: DataType) {
        let Some(delta) = self.tables.get_mut(table) else {
            return;
        };

        match delta.columns.get_mut(column) {
            Some(obs) => {
                let resolution = widen(obs.data_type, observed);
                obs.data_type = resolution.data_type;
                obs.conflict |= resolution.conflict;
                if obs.first == DataType::Null {
                    obs.first = observed;
                }
            }
            None => {
                delta.columns.insert(
                    column.to_string(),
                    ColumnObservation {
                        data_type: observed,
                        first: observed,
                        conflict: false,
                    },
                );
            }
        }
    }
}

/// A column whose observed values did not agree with its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaConflict {
    pub table: String,
    pub column: String,
    pub existing: DataType,
    pub observed: DataType,
    pub resolved: DataType,
}

impl From<&SchemaConflict> for Error {
    fn from(conflict: &SchemaConflict) -> Self {
        Error::SchemaConflict {
            table: conflict.table.clone(),
            column: conflict.column.clone(),
            reason: format!(
                "observed {} against {}, resolved to {}",
                conflict.observed, conflict.existing, conflict.resolved
            ),
        }
    }
}

/// In-memory representation of every inferred table, column and link
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModel {
    pub version: u64,
    pub tables: IndexMap<String, Table>,
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Tables directly nested in `parent`
    pub fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Table> + 'a {
        self.tables.values().filter(move |t| {
            t.parent
                .as_ref()
                .map(|link| link.parent_table == parent)
                .unwrap_or(false)
        })
    }

    /// The root table and every table nested below it
    pub fn family(&self, root: &str) -> Vec<&Table> {
        self.tables
            .values()
            .filter(|t| t.root_table() == root)
            .collect()
    }

    /// Merge a delta, returning the conflicts it surfaced.
    ///
    /// The version is bumped only if the model changed.
    pub fn apply_delta(&mut self, delta: SchemaDelta, policy: NullPolicy) -> Vec<SchemaConflict> {
        let mut conflicts = Vec::new();
        let mut changed = false;

        for (name, table_delta) in delta.tables {
            let table = self.tables.entry(name.clone()).or_insert_with(|| {
                changed = true;
                let mut table = Table::new(name.clone());
                table.parent = table_delta.parent.clone();
                table.primary_key = table_delta.primary_key.clone();
                table
            });

            for (column_name, obs) in table_delta.columns {
                let required = is_required(&column_name, &table.primary_key);
                match table.columns.get_mut(&column_name) {
                    None => {
                        let data_type = match policy {
                            NullPolicy::Keep if obs.conflict => obs.first,
                            _ => obs.data_type,
                        };
                        let mut column = Column::new(column_name.clone(), data_type);
                        column.nullable = !required;
                        column.conflict = obs.conflict;
                        if obs.conflict {
                            conflicts.push(SchemaConflict {
                                table: name.clone(),
                                column: column_name.clone(),
                                existing: obs.first,
                                observed: obs.data_type,
                                resolved: data_type,
                            });
                        }
                        table.columns.insert(column_name, column);
                        changed = true;
                    }
                    Some(column) => {
                        let resolution = widen(column.data_type, obs.data_type);
                        let conflict = resolution.conflict
                            || (obs.conflict && column.data_type != DataType::Variant);
                        let resolved = match policy {
                            NullPolicy::Keep if conflict => column.data_type,
                            _ => resolution.data_type,
                        };

                        if conflict {
                            conflicts.push(SchemaConflict {
                                table: name.clone(),
                                column: column_name.clone(),
                                existing: column.data_type,
                                observed: obs.data_type,
                                resolved,
                            });
                        }

                        if resolved != column.data_type || (conflict && !column.conflict) {
                            column.data_type = resolved;
                            column.conflict |= conflict;
                            changed = true;
                        }
                    }
                }
            }
        }

        if changed {
            self.version += 1;
        }

        conflicts
    }

    /// Shape a row to its table: every column present in schema order, each
    /// value converted to the column type.
    ///
    /// Returns the row and how many values could not be represented and were
    /// nulled.
    pub fn conform_row(&self, table: &str, mut row: Row) -> (Row, usize) {
        let Some(table) = self.table(table) else {
            return (row, 0);
        };

        let mut out = Map::new();
        let mut dropped = 0;
        for column in table.columns.values() {
            let value = row.remove(&column.name).unwrap_or(Value::Null);
            let value = match coerce(column.data_type, value) {
                Some(v) => v,
                None => {
                    dropped += 1;
                    Value::Null
                }
            };
            out.insert(column.name.clone(), value);
        }

        (out, dropped)
    }

    /// Structured description of the model for documentation tooling
    pub fn export(&self) -> Value {
        let mut tables = Map::new();

        for table in self.tables.values() {
            let mut columns = Map::new();
            for column in table.columns.values() {
                columns.insert(
                    column.name.clone(),
                    json!({
                        "data_type": column.data_type.as_str(),
                        "nullable": column.nullable,
                        "conflict": column.conflict,
                        "synthetic": is_synthetic(&column.name),
                    }),
                );
            }

            let link = table.parent.as_ref().map(|link| {
                json!({
                    "parent_table": link.parent_table,
                    "child_column": link.child_column,
                    "parent_column": link.parent_column,
                    "path": link.path,
                    "root_table": link.root_table,
                })
            });

            tables.insert(
                table.name.clone(),
                json!({
                    "columns": columns,
                    "primary_key": table.primary_key,
                    "link": link,
                }),
            );
        }

        json!({
            "version": self.version,
            "tables": tables,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a saved model, or start empty when none exists yet
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_required(column: &str, primary_key: &[String]) -> bool {
    matches!(column, ROW_ID | PARENT_ID | ROOT_ID | LIST_IDX) || primary_key.iter().any(|k| k == column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn delta_with(table: &str, columns: &[(&str, DataType)]) -> SchemaDelta {
        let mut delta = SchemaDelta::default();
        delta.table(table, None, &[]);
        for (name, ty) in columns {
            delta.observe(table, name, *ty);
        }
        delta
    }

    #[test]
    fn test_apply_creates_tables_and_bumps_version() {
        let mut schema = SchemaModel::new();
        let conflicts = schema.apply_delta(
            delta_with("users", &[("id", DataType::Int), ("name", DataType::Text)]),
            NullPolicy::Coalesce,
        );

        assert!(conflicts.is_empty());
        assert_eq!(schema.version, 1);
        let users = schema.table("users").unwrap();
        assert_eq!(users.column_names().collect::<Vec<_>>(), vec!["id", "name"]);

        // same delta again changes nothing
        schema.apply_delta(delta_with("users", &[("id", DataType::Int)]), NullPolicy::Coalesce);
        assert_eq!(schema.version, 1);
    }

    #[test]
    fn test_conflict_widens_under_coalesce() {
        let mut schema = SchemaModel::new();
        schema.apply_delta(delta_with("t", &[("x", DataType::Int)]), NullPolicy::Coalesce);
        let conflicts =
            schema.apply_delta(delta_with("t", &[("x", DataType::Text)]), NullPolicy::Coalesce);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(
            Error::from(&conflicts[0]).to_string(),
            "schema conflict on t.x: observed text against int, resolved to variant"
        );
        let column = schema.table("t").unwrap().column("x").unwrap();
        assert_eq!(column.data_type, DataType::Variant);
        assert!(column.conflict);

        // never narrows back
        schema.apply_delta(delta_with("t", &[("x", DataType::Int)]), NullPolicy::Coalesce);
        assert_eq!(schema.table("t").unwrap().column("x").unwrap().data_type, DataType::Variant);
    }

    #[test]
    fn test_conflict_keeps_type_under_keep() {
        let mut schema = SchemaModel::new();
        schema.apply_delta(delta_with("t", &[("x", DataType::Int)]), NullPolicy::Keep);
        let conflicts = schema.apply_delta(delta_with("t", &[("x", DataType::Text)]), NullPolicy::Keep);

        assert_eq!(conflicts[0].resolved, DataType::Int);
        let column = schema.table("t").unwrap().column("x").unwrap();
        assert_eq!(column.data_type, DataType::Int);
        assert!(column.conflict);

        let (row, dropped) = schema.conform_row("t", json!({"x": "a"}).as_object().unwrap().clone());
        assert_eq!(dropped, 1);
        assert_eq!(row.get("x"), Some(&Value::Null));
    }

    #[test]
    fn test_conform_row_fills_and_coerces() {
        let mut schema = SchemaModel::new();
        schema.apply_delta(
            delta_with("t", &[("a", DataType::Float), ("b", DataType::Text)]),
            NullPolicy::Coalesce,
        );

        let (row, dropped) = schema.conform_row("t", json!({"a": 1}).as_object().unwrap().clone());
        assert_eq!(dropped, 0);
        assert_eq!(Value::Object(row), json!({"a": 1.0, "b": null}));
    }

    #[test]
    fn test_export_lists_links() {
        let mut schema = SchemaModel::new();
        let mut delta = delta_with("issues", &[(ROW_ID, DataType::Text)]);
        delta.table(
            "issues__comments",
            Some(Link::new("issues", "issues", vec!["comments".to_string()])),
            &[],
        );
        delta.observe("issues__comments", PARENT_ID, DataType::Text);
        schema.apply_delta(delta, NullPolicy::Coalesce);

        let exported = schema.export();
        assert_eq!(exported["tables"]["issues__comments"]["link"]["parent_table"], "issues");
        assert_eq!(exported["tables"]["issues"]["link"], Value::Null);
        assert_eq!(
            exported["tables"]["issues__comments"]["columns"][PARENT_ID]["nullable"],
            json!(false)
        );
        assert_eq!(schema.children("issues").count(), 1);
        assert_eq!(schema.family("issues").len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schema.json");

        assert_eq!(SchemaModel::load(&path).unwrap(), SchemaModel::new());

        let mut schema = SchemaModel::new();
        schema.apply_delta(delta_with("t", &[("x", DataType::Int)]), NullPolicy::Coalesce);
        schema.save(&path).unwrap();

        assert_eq!(SchemaModel::load(&path).unwrap(), schema);
    }
}
