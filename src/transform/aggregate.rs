use crate::transform::expr::compare_values;
use crate::types::canonical;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

/// Aggregation semantics of a measure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    CountDistinct,
    /// Summed like `Sum`, but never across the listed dimensions
    SemiAdditive { non_summable: Vec<String> },
}

impl AggregateKind {
    pub fn semi_additive<I, S>(non_summable: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AggregateKind::SemiAdditive {
            non_summable: non_summable.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the aggregate adds input values together
    pub fn sums(&self) -> bool {
        matches!(self, AggregateKind::Sum | AggregateKind::SemiAdditive { .. })
    }

    pub fn accumulator(&self) -> Accumulator {
        match self {
            AggregateKind::Sum | AggregateKind::SemiAdditive { .. } => Accumulator::Sum {
                int: 0,
                float: 0.0,
                is_float: false,
                seen: false,
            },
            AggregateKind::Count => Accumulator::Count(0),
            AggregateKind::Avg => Accumulator::Avg { total: 0.0, count: 0 },
            AggregateKind::Min => Accumulator::Extreme {
                keep: Ordering::Less,
                value: None,
            },
            AggregateKind::Max => Accumulator::Extreme {
                keep: Ordering::Greater,
                value: None,
            },
            AggregateKind::CountDistinct => Accumulator::Distinct(HashSet::new()),
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateKind::Sum => f.write_str("sum"),
            AggregateKind::Count => f.write_str("count"),
            AggregateKind::Avg => f.write_str("avg"),
            AggregateKind::Min => f.write_str("min"),
            AggregateKind::Max => f.write_str("max"),
            AggregateKind::CountDistinct => f.write_str("count_distinct"),
            AggregateKind::SemiAdditive { non_summable } => {
                write!(f, "semi_additive({})", non_summable.join(", "))
            }
        }
    }
}

/// Running state of one measure within one group
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum {
        int: i64,
        float: f64,
        is_float: bool,
        seen: bool,
    },
    Count(u64),
    Avg {
        total: f64,
        count: u64,
    },
    Extreme {
        keep: Ordering,
        value: Option<Value>,
    },
    Distinct(HashSet<String>),
}

/// Numeric reading of a value; booleans count as 0 and 1
fn numeric(value: &Value) -> Option<Number> {
    match value {
        Value::Number(n) => Some(n.clone()),
        Value::Bool(b) => Some(Number::from(*b as i64)),
        _ => None,
    }
}

impl Accumulator {
    /// Fold one input. `None` counts a row rather than a value.
    pub fn update(&mut self, input: Option<&Value>) {
        match self {
            Accumulator::Count(n) => {
                if input.map(|v| !v.is_null()).unwrap_or(true) {
                    *n += 1;
                }
            }
            Accumulator::Sum {
                int,
                float,
                is_float,
                seen,
            } => {
                let Some(number) = input.and_then(numeric) else {
                    return;
                };
                *seen = true;
                match number.as_i64() {
                    Some(i) if !*is_float => match int.checked_add(i) {
                        Some(total) => *int = total,
                        None => {
                            *is_float = true;
                            *float = *int as f64 + i as f64;
                        }
                    },
                    _ => {
                        if !*is_float {
                            *is_float = true;
                            *float = *int as f64;
                        }
                        *float += number.as_f64().unwrap_or(0.0);
                    }
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(x) = input.and_then(numeric).and_then(|n| n.as_f64()) {
                    *total += x;
                    *count += 1;
                }
            }
            Accumulator::Extreme { keep, value } => {
                let Some(candidate) = input.filter(|v| !v.is_null()) else {
                    return;
                };
                let replace = match value {
                    None => true,
                    Some(current) => compare_values(candidate, current) == Some(*keep),
                };
                if replace {
                    *value = Some(candidate.clone());
                }
            }
            Accumulator::Distinct(seen) => {
                if let Some(v) = input.filter(|v| !v.is_null()) {
                    seen.insert(canonical(v));
                }
            }
        }
    }

    /// Final value. Empty sums, averages and extremes are null; counts are zero.
    pub fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::from(n),
            Accumulator::Sum { seen: false, .. } => Value::Null,
            Accumulator::Sum {
                int,
                is_float: false,
                ..
            } => Value::from(int),
            Accumulator::Sum { float, .. } => Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null),
            Accumulator::Avg { count: 0, .. } => Value::Null,
            Accumulator::Avg { total, count } => Number::from_f64(total / count as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Accumulator::Extreme { value, .. } => value.unwrap_or(Value::Null),
            Accumulator::Distinct(seen) => Value::from(seen.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(kind: AggregateKind, inputs: &[Value]) -> Value {
        let mut acc = kind.accumulator();
        for input in inputs {
            acc.update(Some(input));
        }
        acc.finish()
    }

    #[test]
    fn test_sum_keeps_integers_exact() {
        assert_eq!(run(AggregateKind::Sum, &[json!(1), json!(2), json!(null)]), json!(3));
        assert_eq!(run(AggregateKind::Sum, &[json!(1), json!(0.5)]), json!(1.5));
        assert_eq!(run(AggregateKind::Sum, &[json!(true), json!(false), json!(true)]), json!(2));
        assert_eq!(run(AggregateKind::Sum, &[]), Value::Null);
    }

    #[test]
    fn test_counts() {
        assert_eq!(run(AggregateKind::Count, &[json!(1), json!(null)]), json!(1));
        assert_eq!(run(AggregateKind::Count, &[]), json!(0));
        assert_eq!(
            run(AggregateKind::CountDistinct, &[json!("a"), json!("b"), json!("a"), json!(null)]),
            json!(2)
        );

        let mut rows = AggregateKind::Count.accumulator();
        rows.update(None);
        rows.update(None);
        assert_eq!(rows.finish(), json!(2));
    }

    #[test]
    fn test_avg_min_max() {
        assert_eq!(run(AggregateKind::Avg, &[json!(1), json!(2)]), json!(1.5));
        assert_eq!(run(AggregateKind::Avg, &[json!(null)]), Value::Null);
        assert_eq!(run(AggregateKind::Min, &[json!(3), json!(1), json!(2)]), json!(1));
        assert_eq!(
            run(AggregateKind::Max, &[json!("2024-01-02"), json!("2024-03-01")]),
            json!("2024-03-01")
        );
    }

    #[test]
    fn test_kind_serde() {
        let kind: AggregateKind =
            serde_json::from_value(json!({"semi_additive": {"non_summable": ["day"]}})).unwrap();
        assert_eq!(kind, AggregateKind::semi_additive(["day"]));
        assert!(kind.sums());
        assert_eq!(kind.to_string(), "semi_additive(day)");
    }
}
