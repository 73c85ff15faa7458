//! Data-quality metrics over stored tables

use crate::error::Result;
use crate::transform::expr::compare_values;
use crate::types::{canonical, Row};
use crate::write::storage::{columns_of, Storage};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetrics {
    pub name: String,
    /// Missing values count as null
    pub null_count: usize,
    pub null_rate: f64,
    pub unique_count: usize,
    /// Over numeric values only
    pub mean: Option<f64>,
    pub minimum: Option<Value>,
    pub maximum: Option<Value>,
    /// Character lengths of string values
    pub minimum_length: Option<usize>,
    pub maximum_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableMetrics {
    pub table: String,
    pub row_count: usize,
    pub columns: Vec<ColumnMetrics>,
}

impl TableMetrics {
    pub fn compute(table: &str, rows: &[Row]) -> Self {
        let columns = columns_of(rows)
            .into_iter()
            .map(|name| column_metrics(name, rows))
            .collect();

        TableMetrics {
            table: table.to_string(),
            row_count: rows.len(),
            columns,
        }
    }

    /// Read a table from storage and measure it
    pub fn load<S: Storage + ?Sized>(storage: &S, table: &str) -> Result<Self> {
        let rows = storage.read_table(table)?;
        Ok(Self::compute(table, &rows))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetrics> {
        self.columns.iter().find(|c| c.name == name)
    }
}

fn extreme(current: &mut Option<Value>, candidate: &Value, keep: Ordering) {
    let replace = match current {
        None => true,
        Some(existing) => compare_values(candidate, existing) == Some(keep),
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

fn column_metrics(name: String, rows: &[Row]) -> ColumnMetrics {
    let mut null_count = 0;
    let mut unique = HashSet::new();
    let mut total = 0.0;
    let mut numbers = 0usize;
    let mut minimum = None;
    let mut maximum = None;
    let mut minimum_length: Option<usize> = None;
    let mut maximum_length: Option<usize> = None;

    for row in rows {
        let value = match row.get(&name) {
            None | Some(Value::Null) => {
                null_count += 1;
                continue;
            }
            Some(value) => value,
        };

        unique.insert(canonical(value));
        extreme(&mut minimum, value, Ordering::Less);
        extreme(&mut maximum, value, Ordering::Greater);

        match value {
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    total += x;
                    numbers += 1;
                }
            }
            Value::String(s) => {
                let len = s.chars().count();
                minimum_length = Some(minimum_length.map_or(len, |m| m.min(len)));
                maximum_length = Some(maximum_length.map_or(len, |m| m.max(len)));
            }
            _ => {}
        }
    }

    ColumnMetrics {
        null_rate: if rows.is_empty() {
            0.0
        } else {
            null_count as f64 / rows.len() as f64
        },
        name,
        null_count,
        unique_count: unique.len(),
        mean: (numbers > 0).then(|| total / numbers as f64),
        minimum,
        maximum,
        minimum_length,
        maximum_length,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Vec<serde_json::Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn test_column_metrics() {
        let metrics = TableMetrics::compute(
            "people",
            &rows(vec![
                json!({"name": "Ana", "age": 30, "city": "Lisbon"}),
                json!({"name": "Bartholomew", "age": 40, "city": null}),
                json!({"name": "Cy", "age": 20}),
                json!({"name": "Ana", "age": null, "city": "Lisbon"}),
            ]),
        );

        assert_eq!(metrics.row_count, 4);

        let name = metrics.column("name").unwrap();
        assert_eq!(name.unique_count, 3);
        assert_eq!(name.minimum_length, Some(2));
        assert_eq!(name.maximum_length, Some(11));
        assert_eq!(name.minimum, Some(json!("Ana")));

        let age = metrics.column("age").unwrap();
        assert_eq!(age.mean, Some(30.0));
        assert_eq!(age.minimum, Some(json!(20)));
        assert_eq!(age.maximum, Some(json!(40)));
        assert_eq!(age.null_count, 1);

        let city = metrics.column("city").unwrap();
        assert_eq!(city.null_count, 2);
        assert_eq!(city.null_rate, 0.5);
        assert_eq!(city.unique_count, 1);
        assert_eq!(city.mean, None);
    }

    #[test]
    fn test_empty_table() {
        let metrics = TableMetrics::compute("empty", &[]);
        assert_eq!(metrics.row_count, 0);
        assert!(metrics.columns.is_empty());
    }
}
