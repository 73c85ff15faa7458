use crate::error::{Error, Result};
use crate::normalize::identity::{child_id, content_id, key_id, random_id, IdentityMode};
use crate::schema::model::{Link, SchemaConflict, SchemaDelta, SchemaModel};
use crate::schema::types::{observe, DataType};
use crate::types::{
    canonical, is_synthetic, PipelineConfig, Record, Row, RowId, LIST_IDX, PARENT_ID,
    ROOT_ID, ROW_ID, VALUE_COLUMN,
};
use serde_json::{Map, Value};

/// One normalized row destined for a table
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub table: String,
    pub row: Row,
}

/// All rows produced by one record, plus the schema changes they imply
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub root_id: RowId,
    /// Parent rows always precede their children
    pub fragments: Vec<Fragment>,
    pub delta: SchemaDelta,
    /// Input fields that could not be stored
    pub conflicts: Vec<SchemaConflict>,
}

impl NormalizedRecord {
    pub fn rows_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a Row> + 'a {
        self.fragments
            .iter()
            .filter(move |f| f.table == table)
            .map(|f| &f.row)
    }
}

/// An array waiting to become a child table
struct PendingArray {
    path: Vec<String>,
    items: Vec<Value>,
    /// Nesting depth the array was found at
    depth: usize,
}

/// Per-record traversal state
struct Walk<'a> {
    schema: &'a SchemaModel,
    root_table: &'a str,
    root_id: Option<RowId>,
    fragments: Vec<Fragment>,
    delta: SchemaDelta,
    conflicts: Vec<SchemaConflict>,
}

/// Flattens nested records into relational rows across linked tables
pub struct Normalizer {
    config: PipelineConfig,
    mode: IdentityMode,
}

impl Normalizer {
    pub fn new(config: PipelineConfig) -> Self {
        let mode = if config.deterministic() {
            IdentityMode::Deterministic
        } else {
            IdentityMode::Random
        };
        Normalizer { config, mode }
    }

    /// Normalize one record against the current schema.
    ///
    /// The schema is not modified; the returned delta carries every new
    /// table, column and observed type.
    pub fn normalize(&self, schema: &SchemaModel, record: Record) -> Result<NormalizedRecord> {
        let obj = match record {
            Value::Object(obj) => obj,
            Value::Array(_) => return Err(Error::UnsupportedRoot("array")),
            scalar => {
                let mut obj = Map::new();
                obj.insert(VALUE_COLUMN.to_string(), scalar);
                obj
            }
        };

        let table = self.config.table_name.as_str();
        let content = (self.mode == IdentityMode::Deterministic && self.config.primary_key.is_empty())
            .then(|| content_id(table, &Value::Object(obj.clone())));

        let mut walk = Walk {
            schema,
            root_table: table,
            root_id: None,
            fragments: Vec::new(),
            delta: SchemaDelta::default(),
            conflicts: Vec::new(),
        };
        walk.delta.table(table, None, &self.config.primary_key);

        let mut row = Row::new();
        let mut arrays = Vec::new();
        self.flatten_object(&mut walk, table, obj, &mut Vec::new(), 0, &mut row, &mut arrays);

        let id = match (self.mode, content) {
            (IdentityMode::Random, _) => random_id(),
            (IdentityMode::Deterministic, Some(id)) => id,
            (IdentityMode::Deterministic, None) => {
                let mut key = Vec::with_capacity(self.config.primary_key.len());
                for column in &self.config.primary_key {
                    match row.get(column) {
                        Some(value) if !value.is_null() => key.push(value),
                        _ => {
                            return Err(Error::MissingPrimaryKey {
                                table: table.to_string(),
                                column: column.clone(),
                            })
                        }
                    }
                }
                key_id(table, &key)
            }
        };

        walk.root_id = Some(id.clone());
        self.emit(&mut walk, table, row, &id);
        self.descend(&mut walk, table, &id, arrays);

        Ok(NormalizedRecord {
            root_id: id,
            fragments: walk.fragments,
            delta: walk.delta,
            conflicts: walk.conflicts,
        })
    }

    /// Normalize a stream lazily, one record per item
    pub fn fragments<'a, I>(
        &'a self,
        schema: &'a SchemaModel,
        records: I,
    ) -> impl Iterator<Item = Result<NormalizedRecord>> + 'a
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: 'a,
    {
        records
            .into_iter()
            .map(move |record| self.normalize(schema, record))
    }

    /// Flatten the scalar fields of an object into `row`, collecting arrays
    /// that need their own tables.
    #[allow(clippy::too_many_arguments)]
    fn flatten_object(
        &self,
        walk: &mut Walk<'_>,
        table: &str,
        obj: Map<String, Value>,
        path: &mut Vec<String>,
        depth: usize,
        row: &mut Row,
        arrays: &mut Vec<PendingArray>,
    ) {
        for (key, value) in obj.into_iter() {
            path.push(key);
            let column = path.join(&self.config.separator);

            match value {
                Value::Null => {
                    // Null never creates a column nor descends
                    if walk.delta.knows(walk.schema, table, &column) && !row.contains_key(&column) {
                        row.insert(column, Value::Null);
                    }
                }
                Value::Object(nested) if depth < self.config.max_depth => {
                    self.flatten_object(walk, table, nested, path, depth + 1, row, arrays);
                }
                Value::Array(items) if items.is_empty() => {}
                Value::Array(items) if depth < self.config.max_depth && self.needs_table(&items) => {
                    arrays.push(PendingArray {
                        path: path.clone(),
                        items,
                        depth,
                    });
                }
                value => self.store(walk, table, column, value, row),
            }

            path.pop();
        }
    }

    /// Store one scalar (or serialized sub-tree) as a column value
    fn store(&self, walk: &mut Walk<'_>, table: &str, column: String, value: Value, row: &mut Row) {
        if is_synthetic(&column) {
            walk.conflicts.push(SchemaConflict {
                table: table.to_string(),
                column: column.clone(),
                existing: DataType::Text,
                observed: observe(&value),
                resolved: DataType::Text,
            });
            tracing::warn!(table, column = %column, "dropping input field shadowing a synthetic column");
            return;
        }

        let value = match value {
            nested @ (Value::Array(_) | Value::Object(_)) => Value::String(canonical(&nested)),
            scalar => scalar,
        };
        // A flattened path and a literal field can name the same column
        if let Some(existing) = row.get(&column) {
            let existing = observe(existing);
            walk.conflicts.push(SchemaConflict {
                table: table.to_string(),
                column: column.clone(),
                existing,
                observed: observe(&value),
                resolved: existing,
            });
            tracing::warn!(table, column = %column, "dropping input field whose column name is already taken");
            return;
        }
        walk.delta.observe(table, &column, observe(&value));
        row.insert(column, value);
    }

    fn needs_table(&self, items: &[Value]) -> bool {
        self.config.explode_scalar_arrays || items.iter().any(|v| v.is_object() || v.is_array())
    }

    fn emit(&self, walk: &mut Walk<'_>, table: &str, mut row: Row, id: &RowId) {
        row.insert(ROW_ID.to_string(), id.clone().into());
        walk.delta.observe(table, ROW_ID, DataType::Text);
        walk.fragments.push(Fragment {
            table: table.to_string(),
            row,
        });
    }

    /// Turn every pending array of a parent row into child rows
    fn descend(
        &self,
        walk: &mut Walk<'_>,
        parent_table: &str,
        parent_id: &RowId,
        arrays: Vec<PendingArray>,
    ) {
        for pending in arrays {
            let child_table = format!(
                "{}{}{}",
                parent_table,
                self.config.separator,
                pending.path.join(&self.config.separator)
            );
            let link = Link::new(parent_table, walk.root_table, pending.path);
            walk.delta.table(&child_table, Some(link), &[]);

            for (idx, item) in pending.items.into_iter().enumerate() {
                let obj = match item {
                    Value::Object(obj) => obj,
                    other => {
                        let mut obj = Map::new();
                        obj.insert(VALUE_COLUMN.to_string(), other);
                        obj
                    }
                };

                let mut row = Row::new();
                let mut nested = Vec::new();
                self.flatten_object(
                    walk,
                    &child_table,
                    obj,
                    &mut Vec::new(),
                    pending.depth + 1,
                    &mut row,
                    &mut nested,
                );

                let id = match self.mode {
                    IdentityMode::Random => random_id(),
                    IdentityMode::Deterministic => child_id(parent_id, &child_table, idx),
                };
                let root_id = walk.root_id.clone().unwrap_or_else(|| parent_id.clone());

                row.insert(PARENT_ID.to_string(), parent_id.clone().into());
                row.insert(ROOT_ID.to_string(), root_id.into());
                row.insert(LIST_IDX.to_string(), Value::from(idx));
                walk.delta.observe(&child_table, PARENT_ID, DataType::Text);
                walk.delta.observe(&child_table, ROOT_ID, DataType::Text);
                walk.delta.observe(&child_table, LIST_IDX, DataType::Int);

                self.emit(walk, &child_table, row, &id);
                self.descend(walk, &child_table, &id, nested);
            }
        }
    }
}
