//! Entity deduplication across sources
//!
//! Rows describing the same real-world object can arrive from several
//! tables. The [`Deduplicator`] folds them into one entity per natural key,
//! field by field: a non-null value from a higher priority source overrides
//! a lower priority one, and within one priority the last value seen wins.

use crate::error::{Error, Result};
use crate::types::{canonical, is_synthetic, Row};
use crate::write::storage::Storage;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A deduplicated canonical row
pub type Entity = Row;

/// Rows from one table together with how they rank against other sources
#[derive(Debug, Clone)]
pub struct DedupSource {
    pub table: String,
    pub key_column: String,
    /// Larger wins
    pub priority: i32,
    /// Source column name to entity field name
    pub rename: BTreeMap<String, String>,
    pub rows: Vec<Row>,
}

impl DedupSource {
    pub fn new(table: impl Into<String>, key_column: impl Into<String>, priority: i32, rows: Vec<Row>) -> Self {
        DedupSource {
            table: table.into(),
            key_column: key_column.into(),
            priority,
            rename: BTreeMap::new(),
            rows,
        }
    }

    /// Read a source's rows from storage
    pub fn load<S: Storage + ?Sized>(
        storage: &S,
        table: &str,
        key_column: &str,
        priority: i32,
    ) -> Result<Self> {
        let rows = storage.read_table(table)?;
        Ok(Self::new(table, key_column, priority, rows))
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rename.insert(from.into(), to.into());
        self
    }

    fn field_name<'a>(&'a self, column: &'a str) -> &'a str {
        self.rename.get(column).map(String::as_str).unwrap_or(column)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Fail on incompatible values at equal priority instead of keeping the last
    pub strict: bool,
    /// Name of the key column in the output; the first source's key column
    /// when unset
    pub key_name: Option<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            strict: false,
            key_name: None,
        }
    }
}

/// Two sources of equal priority disagreeing on a field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupConflict {
    pub key: Value,
    pub field: String,
    pub existing: Value,
    pub incoming: Value,
    pub priority: i32,
    pub table: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupOutput {
    /// One entity per distinct key, in first-seen order
    pub entities: Vec<Entity>,
    pub conflicts: Vec<DedupConflict>,
    /// Rows dropped for having no key
    pub skipped: usize,
}

struct Candidate {
    value: Value,
    /// None while only nulls were seen
    priority: Option<i32>,
}

struct EntityState {
    key: Value,
    fields: IndexMap<String, Candidate>,
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Deduplicator { config }
    }

    /// Merge all sources into entities keyed by natural key
    pub fn dedupe(&self, sources: &[DedupSource]) -> Result<DedupOutput> {
        let key_name = self
            .config
            .key_name
            .clone()
            .or_else(|| sources.first().map(|s| s.key_column.clone()))
            .unwrap_or_else(|| "key".to_string());

        let mut states: IndexMap<String, EntityState> = IndexMap::new();
        let mut columns: IndexSet<String> = IndexSet::new();
        let mut output = DedupOutput::default();

        for source in sources {
            for row in &source.rows {
                let key = match row.get(&source.key_column) {
                    Some(key) if !key.is_null() => key,
                    _ => {
                        output.skipped += 1;
                        continue;
                    }
                };

                let state = states.entry(canonical(key)).or_insert_with(|| EntityState {
                    key: key.clone(),
                    fields: IndexMap::new(),
                });

                for (column, value) in row {
                    if column == &source.key_column || is_synthetic(column) {
                        continue;
                    }
                    let field = source.field_name(column);
                    if field == key_name {
                        continue;
                    }
                    if !columns.contains(field) {
                        columns.insert(field.to_string());
                    }

                    let Some(candidate) = state.fields.get_mut(field) else {
                        state.fields.insert(
                            field.to_string(),
                            Candidate {
                                value: value.clone(),
                                priority: (!value.is_null()).then_some(source.priority),
                            },
                        );
                        continue;
                    };

                    if value.is_null() {
                        continue;
                    }

                    match candidate.priority {
                        Some(p) if p > source.priority => {}
                        Some(p) if p == source.priority && candidate.value != *value => {
                            let conflict = DedupConflict {
                                key: state.key.clone(),
                                field: field.to_string(),
                                existing: candidate.value.clone(),
                                incoming: value.clone(),
                                priority: p,
                                table: source.table.clone(),
                            };
                            if self.config.strict {
                                return Err(Error::DedupConflict {
                                    key: canonical(&conflict.key),
                                    field: conflict.field,
                                    existing: canonical(&conflict.existing),
                                    incoming: canonical(&conflict.incoming),
                                    priority: p,
                                });
                            }
                            tracing::warn!(
                                table = %source.table,
                                field = %conflict.field,
                                priority = p,
                                "conflicting values at equal priority, keeping the last"
                            );
                            output.conflicts.push(conflict);
                            candidate.value = value.clone();
                        }
                        _ => {
                            candidate.value = value.clone();
                            candidate.priority = Some(source.priority);
                        }
                    }
                }
            }
        }

        output.entities = states
            .into_values()
            .map(|mut state| {
                let mut entity = Row::new();
                entity.insert(key_name.clone(), state.key);
                for column in &columns {
                    let value = state
                        .fields
                        .swap_remove(column)
                        .map(|c| c.value)
                        .unwrap_or(Value::Null);
                    entity.insert(column.clone(), value);
                }
                entity
            })
            .collect();

        tracing::debug!(
            entities = output.entities.len(),
            conflicts = output.conflicts.len(),
            skipped = output.skipped,
            "deduplicated sources"
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    fn dedupe(sources: &[DedupSource]) -> DedupOutput {
        Deduplicator::new(DedupConfig::default()).dedupe(sources).unwrap()
    }

    #[test]
    fn test_higher_priority_overrides_field_by_field() {
        let detailed = DedupSource::new(
            "users",
            "login",
            2,
            rows(vec![json!({"login": "ana", "name": "Ana", "email": null})]),
        );
        let summary = DedupSource::new(
            "authors",
            "login",
            1,
            rows(vec![json!({"login": "ana", "name": "ana-bot", "email": "ana@example.com"})]),
        );

        let output = dedupe(&[summary.clone(), detailed.clone()]);
        assert_eq!(
            output.entities,
            rows(vec![json!({"login": "ana", "name": "Ana", "email": "ana@example.com"})])
        );
        assert!(output.conflicts.is_empty());

        // Source order does not change the outcome across priorities
        assert_eq!(dedupe(&[detailed, summary]).entities, output.entities);
    }

    #[test]
    fn test_union_of_fields_with_nulls() {
        let a = DedupSource::new("a", "id", 1, rows(vec![json!({"id": 1, "x": 10})]));
        let b = DedupSource::new("b", "id", 1, rows(vec![json!({"id": 2, "y": null})]));

        let output = dedupe(&[a, b]);
        assert_eq!(
            output.entities,
            rows(vec![
                json!({"id": 1, "x": 10, "y": null}),
                json!({"id": 2, "x": null, "y": null}),
            ])
        );
    }

    #[test]
    fn test_equal_priority_last_seen_wins() {
        let a = DedupSource::new("a", "id", 1, rows(vec![json!({"id": 1, "name": "first"})]));
        let b = DedupSource::new("b", "id", 1, rows(vec![json!({"id": 1, "name": "second"})]));

        let output = dedupe(&[a, b]);
        assert_eq!(output.entities[0]["name"], "second");
        assert_eq!(output.conflicts.len(), 1);
        assert_eq!(output.conflicts[0].existing, json!("first"));
        assert_eq!(output.conflicts[0].incoming, json!("second"));
    }

    #[test]
    fn test_strict_mode_fails_on_conflict() {
        let a = DedupSource::new("a", "id", 1, rows(vec![json!({"id": 1, "name": "first"})]));
        let b = DedupSource::new("b", "id", 1, rows(vec![json!({"id": 1, "name": "second"})]));

        let dedup = Deduplicator::new(DedupConfig {
            strict: true,
            ..Default::default()
        });
        let err = dedup.dedupe(&[a, b]).unwrap_err();
        assert!(matches!(err, Error::DedupConflict { ref field, .. } if field == "name"));
    }

    #[test]
    fn test_null_keys_and_synthetic_columns() {
        let source = DedupSource::new(
            "t",
            "id",
            0,
            rows(vec![
                json!({"_row_id": "r1", "id": 1, "v": "a"}),
                json!({"_row_id": "r2", "id": null, "v": "b"}),
                json!({"_row_id": "r3", "v": "c"}),
            ]),
        );

        let output = dedupe(&[source]);
        assert_eq!(output.skipped, 2);
        assert_eq!(output.entities, rows(vec![json!({"id": 1, "v": "a"})]));
    }

    #[test]
    fn test_rename_and_key_name() {
        let users = DedupSource::new("users", "login", 1, rows(vec![json!({"login": "ana", "name": "Ana"})]));
        let authors = DedupSource::new(
            "authors",
            "author_login",
            0,
            rows(vec![json!({"author_login": "ana", "author_name": "A.", "site": "x.dev"})]),
        )
        .rename("author_name", "name");

        let dedup = Deduplicator::new(DedupConfig {
            strict: false,
            key_name: Some("user".to_string()),
        });
        let output = dedup.dedupe(&[users, authors]).unwrap();
        assert_eq!(
            output.entities,
            rows(vec![json!({"user": "ana", "name": "Ana", "site": "x.dev"})])
        );
    }

    #[test]
    fn test_load_from_storage() {
        use crate::write::{MemoryStorage, WriteMode};

        let storage = MemoryStorage::new();
        storage
            .write_table("users", rows(vec![json!({"id": 1}), json!({"id": 1})]), WriteMode::Append)
            .unwrap();

        let source = DedupSource::load(&storage, "users", "id", 0).unwrap();
        assert_eq!(dedupe(&[source]).entities.len(), 1);
    }

    fn source_strategy() -> impl Strategy<Value = DedupSource> {
        let row = (prop::option::of(0i64..6), prop::option::of(0i64..4), prop::option::of("[a-c]"));
        (prop::collection::vec(row, 0..12), 0i32..3).prop_map(|(items, priority)| {
            let rows = items
                .into_iter()
                .map(|(id, n, s)| {
                    json!({"id": id, "n": n, "s": s}).as_object().unwrap().clone()
                })
                .collect();
            DedupSource::new("t", "id", priority, rows)
        })
    }

    proptest! {
        #[test]
        fn dedupe_is_idempotent(sources in prop::collection::vec(source_strategy(), 1..4)) {
            let first = dedupe(&sources);
            let second = dedupe(&sources);
            prop_assert_eq!(
                serde_json::to_string(&first.entities).unwrap(),
                serde_json::to_string(&second.entities).unwrap()
            );

            // Deduplicating the entities again changes nothing
            let again = dedupe(&[DedupSource::new("e", "id", 0, first.entities.clone())]);
            prop_assert_eq!(&again.entities, &first.entities);

            let distinct: std::collections::HashSet<String> = sources
                .iter()
                .flat_map(|s| s.rows.iter())
                .filter_map(|r| r.get("id").filter(|v| !v.is_null()).map(canonical))
                .collect();
            prop_assert_eq!(first.entities.len(), distinct.len());
        }
    }
}
