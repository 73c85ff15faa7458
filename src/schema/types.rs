//! Column types and the widening lattice used to reconcile them
//!
//! ```text
//!            Variant
//!           /   |   \
//!       Float  Text  Bool
//!         |     |
//!        Int  Timestamp
//!           \   |   /
//!             Null
//! ```
//!
//! Widening only ever moves up. Two types without a common ancestor below
//! `Variant` are a conflict.

use crate::schema::format::is_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    /// Text-serialized values of mixed types
    Variant,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Null => "null",
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Variant => "variant",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of reconciling a column type with one more observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub data_type: DataType,
    /// The widening was forced by incompatible types
    pub conflict: bool,
}

/// Type of a single scalar observation
pub fn observe(value: &Value) -> DataType {
    match value {
        Value::Null => DataType::Null,
        Value::Bool(_) => DataType::Bool,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                DataType::Int
            } else {
                DataType::Float
            }
        }
        Value::String(s) => {
            if is_timestamp(s) {
                DataType::Timestamp
            } else {
                DataType::Text
            }
        }
        // Nested values reaching a column are stored serialized
        Value::Array(_) | Value::Object(_) => DataType::Text,
    }
}

/// Least upper bound of two types in the widening lattice
pub fn widen(existing: DataType, observed: DataType) -> Resolution {
    use DataType::*;

    let data_type = match (existing, observed) {
        (a, b) if a == b => a,
        (Null, b) => b,
        (a, Null) => a,
        (Variant, _) | (_, Variant) => Variant,
        (Int, Float) | (Float, Int) => Float,
        (Timestamp, Text) | (Text, Timestamp) => Text,
        _ => {
            return Resolution {
                data_type: Variant,
                conflict: true,
            }
        }
    };

    Resolution {
        data_type,
        conflict: false,
    }
}

/// Reconcile a column's type with one observed value
pub fn reconcile(existing: DataType, observed: &Value) -> Resolution {
    widen(existing, observe(observed))
}

/// Convert a value into the representation of its column type.
///
/// Returns `None` when the value cannot be represented, which callers
/// treat as null.
pub fn coerce(data_type: DataType, value: Value) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }

    match data_type {
        DataType::Null => None,
        DataType::Bool => value.is_boolean().then_some(value),
        DataType::Int => (observe(&value) == DataType::Int).then_some(value),
        DataType::Float => value
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number),
        DataType::Timestamp => (observe(&value) == DataType::Timestamp).then_some(value),
        DataType::Text => match value {
            Value::String(_) => Some(value),
            Value::Array(_) | Value::Object(_) => Some(Value::String(value.to_string())),
            _ => None,
        },
        DataType::Variant => Some(serialize_variant(value)),
    }
}

fn serialize_variant(value: Value) -> Value {
    match value {
        Value::String(_) => value,
        other => Value::String(other.to_string()),
    }
}
