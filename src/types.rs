use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One raw nested input document. Objects, arrays and scalars nest freely.
pub type Record = Value;

/// A flat relational row: column name to scalar value
pub type Row = Map<String, Value>;

/// Synthetic identity of the row itself
pub const ROW_ID: &str = "_row_id";
/// Synthetic link from a child row to its parent's `_row_id`
pub const PARENT_ID: &str = "_parent_id";
/// Synthetic link from any child row straight to the top-level row
pub const ROOT_ID: &str = "_root_id";
/// Position of the element inside the array it came from
pub const LIST_IDX: &str = "_idx";
/// Column holding wrapped scalar array elements
pub const VALUE_COLUMN: &str = "value";

pub const SYNTHETIC_COLUMNS: [&str; 4] = [ROW_ID, PARENT_ID, ROOT_ID, LIST_IDX];

pub fn is_synthetic(column: &str) -> bool {
    SYNTHETIC_COLUMNS.contains(&column)
}

/// Represents the synthetic identifier of a row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        RowId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<RowId> for Value {
    fn from(id: RowId) -> Self {
        Value::String(id.0)
    }
}

/// How rows are persisted into an existing table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteDisposition {
    #[default]
    Append,
    Replace,
    Merge,
}

impl fmt::Display for WriteDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteDisposition::Append => f.write_str("append"),
            WriteDisposition::Replace => f.write_str("replace"),
            WriteDisposition::Merge => f.write_str("merge"),
        }
    }
}

/// What happens to a value whose type conflicts with its column
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// The column keeps its type and the conflicting value is written as null
    Keep,
    /// The column widens to variant and the value is coerced into it
    #[default]
    Coalesce,
}

/// Which existing rows a merge may delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardDelete {
    /// Rows absent from the batch are left untouched
    #[default]
    None,
    /// Rows absent from the batch are deleted
    Absent,
    /// Rows whose flag column is `true` are deleted instead of upserted
    Flag(String),
}

/// Configuration for a normalization run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name of the table top-level records land in
    pub table_name: String,

    pub write_disposition: WriteDisposition,

    /// Primary key columns of the root table, either a name or a list
    #[serde(deserialize_with = "one_or_many")]
    pub primary_key: Vec<String>,

    /// Whether arrays of scalars become child tables instead of one text column
    pub explode_scalar_arrays: bool,

    pub null_policy: NullPolicy,

    /// Separator joining path segments into column and table names
    pub separator: String,

    /// Maximum nesting depth to descend; deeper sub-trees are stored as JSON text
    pub max_depth: usize,

    /// Records per commit
    pub batch_size: usize,

    /// Normalization workers per batch
    pub workers: usize,

    pub hard_delete: HardDelete,

    /// How often a conflicting batch commit is retried
    pub write_retries: usize,

    /// Use content-hash row identities even outside merge
    pub deterministic_ids: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            table_name: String::from("root"),
            write_disposition: WriteDisposition::Append,
            primary_key: vec![],
            explode_scalar_arrays: false,
            null_policy: NullPolicy::Coalesce,
            separator: String::from("__"),
            max_depth: 10,
            batch_size: 1000,
            workers: 1,
            hard_delete: HardDelete::None,
            write_retries: 2,
            deterministic_ids: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        PipelineConfig {
            table_name: table_name.into(),
            ..Default::default()
        }
    }

    pub fn with_disposition(mut self, disposition: WriteDisposition) -> Self {
        self.write_disposition = disposition;
        self
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exploded_scalar_arrays(mut self) -> Self {
        self.explode_scalar_arrays = true;
        self
    }

    /// Row identities must be reproducible when rows are upserted by key
    pub fn deterministic(&self) -> bool {
        self.deterministic_ids || self.write_disposition == WriteDisposition::Merge
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(column) => vec![column],
        OneOrMany::Many(columns) => columns,
    })
}

/// Canonical text of a value, used as a hashing and grouping key
pub fn canonical(value: &Value) -> String {
    serde_json::to_string(&sorted(value)).unwrap_or_default()
}

/// Canonical text of a key value. Integral floats read as integers, so a
/// key keeps matching after its column widens from int to float.
pub fn key_text(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT => (f as i64).to_string(),
            _ => n.to_string(),
        },
        other => canonical(other),
    }
}

/// Largest magnitude below which every integer is exact as an f64
const MAX_EXACT_FLOAT: f64 = 9_007_199_254_740_992.0;

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&obj[key]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_text_folds_integral_floats() {
        assert_eq!(key_text(&json!(5.0)), key_text(&json!(5)));
        assert_eq!(key_text(&json!(-3.0)), "-3");
        assert_ne!(key_text(&json!(7.5)), key_text(&json!(7)));
        assert_ne!(key_text(&json!("5")), key_text(&json!(5)));
        assert_eq!(key_text(&json!({"b": 1, "a": 2})), canonical(&json!({"a": 2, "b": 1})));
    }

    #[test]
    fn test_config_primary_key_forms() {
        let single: PipelineConfig =
            serde_json::from_value(json!({"primary_key": "id"})).unwrap();
        assert_eq!(single.primary_key, vec!["id"]);

        let many: PipelineConfig =
            serde_json::from_value(json!({"primary_key": ["org", "login"]})).unwrap();
        assert_eq!(many.primary_key, vec!["org", "login"]);
        assert_eq!(many.separator, "__");
    }

    #[test]
    fn test_config_enums() {
        let config: PipelineConfig = serde_json::from_value(json!({
            "write_disposition": "merge",
            "null_policy": "keep",
            "hard_delete": {"flag": "deleted"}
        }))
        .unwrap();

        assert_eq!(config.write_disposition, WriteDisposition::Merge);
        assert_eq!(config.null_policy, NullPolicy::Keep);
        assert_eq!(config.hard_delete, HardDelete::Flag("deleted".to_string()));
        assert!(config.deterministic());
    }

    #[test]
    fn test_canonical_is_key_ordered() {
        assert_eq!(canonical(&json!({"b": 1, "a": 2})), r#"{"a":2,"b":1}"#);
    }
}
