//! Expressions evaluated over joined rows
//!
//! Null propagates the way SQL does: comparisons against null are null, and
//! only `true` passes a filter.

use crate::schema::format::to_date;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// `alias.column`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnRef {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

impl From<&str> for ColumnRef {
    fn from(text: &str) -> Self {
        match text.split_once('.') {
            Some((alias, column)) => ColumnRef::new(alias, column),
            None => ColumnRef::new("", text),
        }
    }
}

impl From<String> for ColumnRef {
    fn from(text: String) -> Self {
        ColumnRef::from(text.as_str())
    }
}

impl From<ColumnRef> for String {
    fn from(column: ColumnRef) -> Self {
        column.to_string()
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(ColumnRef),
    Literal(Value),
    /// First non-null argument
    Coalesce(Vec<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    /// Character count of a string or element count of an array
    Length(Box<Expr>),
    /// Calendar date of a timestamp
    Date(Box<Expr>),
}

impl Expr {
    pub fn col(reference: &str) -> Self {
        Expr::Column(ColumnRef::from(reference))
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::compare(CompareOp::Eq, left, right)
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Self::compare(CompareOp::Gt, left, right)
    }

    pub fn is_null(expr: Expr) -> Self {
        Expr::IsNull(Box::new(expr))
    }

    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    pub fn length(expr: Expr) -> Self {
        Expr::Length(Box::new(expr))
    }

    pub fn date(expr: Expr) -> Self {
        Expr::Date(Box::new(expr))
    }

    /// Every column this expression reads
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Expr::Column(column) => out.push(column),
            Expr::Literal(_) => {}
            Expr::Coalesce(args) | Expr::And(args) | Expr::Or(args) => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
            Expr::Compare { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Expr::Not(inner) | Expr::IsNull(inner) | Expr::Length(inner) | Expr::Date(inner) => {
                inner.collect_columns(out)
            }
        }
    }

    /// Evaluate against a row, resolving columns through `lookup`
    pub fn eval<F>(&self, lookup: &F) -> Value
    where
        F: Fn(&ColumnRef) -> Value,
    {
        match self {
            Expr::Column(column) => lookup(column),
            Expr::Literal(value) => value.clone(),
            Expr::Coalesce(args) => args
                .iter()
                .map(|arg| arg.eval(lookup))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null),
            Expr::Compare { op, left, right } => {
                let left = left.eval(lookup);
                let right = right.eval(lookup);
                if left.is_null() || right.is_null() {
                    return Value::Null;
                }
                match (op, compare_values(&left, &right)) {
                    (CompareOp::Eq, _) => Value::Bool(loose_eq(&left, &right)),
                    (CompareOp::Ne, _) => Value::Bool(!loose_eq(&left, &right)),
                    (_, None) => Value::Null,
                    (CompareOp::Lt, Some(o)) => Value::Bool(o == Ordering::Less),
                    (CompareOp::Le, Some(o)) => Value::Bool(o != Ordering::Greater),
                    (CompareOp::Gt, Some(o)) => Value::Bool(o == Ordering::Greater),
                    (CompareOp::Ge, Some(o)) => Value::Bool(o != Ordering::Less),
                }
            }
            Expr::And(args) => {
                let mut unknown = false;
                for arg in args {
                    match arg.eval(lookup) {
                        Value::Bool(false) => return Value::Bool(false),
                        Value::Bool(true) => {}
                        _ => unknown = true,
                    }
                }
                if unknown {
                    Value::Null
                } else {
                    Value::Bool(true)
                }
            }
            Expr::Or(args) => {
                let mut unknown = false;
                for arg in args {
                    match arg.eval(lookup) {
                        Value::Bool(true) => return Value::Bool(true),
                        Value::Bool(false) => {}
                        _ => unknown = true,
                    }
                }
                if unknown {
                    Value::Null
                } else {
                    Value::Bool(false)
                }
            }
            Expr::Not(inner) => match inner.eval(lookup) {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            },
            Expr::IsNull(inner) => Value::Bool(inner.eval(lookup).is_null()),
            Expr::Length(inner) => match inner.eval(lookup) {
                Value::String(s) => Value::from(s.chars().count()),
                Value::Array(a) => Value::from(a.len()),
                _ => Value::Null,
            },
            Expr::Date(inner) => match inner.eval(lookup) {
                Value::String(s) => to_date(&s).map(Value::String).unwrap_or(Value::Null),
                _ => Value::Null,
            },
        }
    }
}

/// Whether a predicate result lets a row through
pub fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order two non-null values of the same kind
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &Expr, row: Value) -> Value {
        expr.eval(&|c: &ColumnRef| row.get(&c.column).cloned().unwrap_or(Value::Null))
    }

    #[test]
    fn test_column_ref_parsing() {
        let column = ColumnRef::from("p.author__login");
        assert_eq!(column.alias, "p");
        assert_eq!(column.column, "author__login");
        assert_eq!(column.to_string(), "p.author__login");

        let bare = ColumnRef::from("id");
        assert_eq!(bare.alias, "");
    }

    #[test]
    fn test_compare_null_propagation() {
        let gt = Expr::gt(Expr::col("t.n"), Expr::lit(2));
        assert_eq!(eval(&gt, json!({"n": 3})), json!(true));
        assert_eq!(eval(&gt, json!({"n": 1.5})), json!(false));
        assert_eq!(eval(&gt, json!({"n": null})), Value::Null);
        assert!(!is_true(&eval(&gt, json!({}))));

        let eq = Expr::eq(Expr::col("t.n"), Expr::lit(2));
        assert_eq!(eval(&eq, json!({"n": 2.0})), json!(true));
    }

    #[test]
    fn test_boolean_logic() {
        let both = Expr::And(vec![Expr::col("t.a"), Expr::col("t.b")]);
        assert_eq!(eval(&both, json!({"a": true, "b": false})), json!(false));
        assert_eq!(eval(&both, json!({"a": true, "b": null})), Value::Null);
        assert_eq!(eval(&both, json!({"a": false, "b": null})), json!(false));

        let either = Expr::Or(vec![Expr::col("t.a"), Expr::col("t.b")]);
        assert_eq!(eval(&either, json!({"a": null, "b": true})), json!(true));
        assert_eq!(eval(&Expr::not(Expr::col("t.a")), json!({"a": true})), json!(false));
    }

    #[test]
    fn test_functions() {
        assert_eq!(
            eval(&Expr::Coalesce(vec![Expr::col("t.a"), Expr::lit(0)]), json!({"a": null})),
            json!(0)
        );
        assert_eq!(eval(&Expr::length(Expr::col("t.s")), json!({"s": "héllo"})), json!(5));
        assert_eq!(eval(&Expr::is_null(Expr::col("t.s")), json!({})), json!(true));
        assert_eq!(
            eval(&Expr::date(Expr::col("t.at")), json!({"at": "2024-03-01T12:30:00Z"})),
            json!("2024-03-01")
        );
        assert_eq!(eval(&Expr::date(Expr::col("t.at")), json!({"at": "soon"})), Value::Null);
    }

    #[test]
    fn test_columns_collects_references() {
        let expr = Expr::And(vec![
            Expr::eq(Expr::col("a.x"), Expr::lit(1)),
            Expr::is_null(Expr::col("b.y")),
        ]);
        let columns: Vec<String> = expr.columns().iter().map(|c| c.to_string()).collect();
        assert_eq!(columns, vec!["a.x", "b.y"]);
    }
}
