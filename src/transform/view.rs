use crate::transform::aggregate::AggregateKind;
use crate::transform::expr::{ColumnRef, Expr};
use crate::types::{WriteDisposition, PARENT_ID, ROW_ID};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    /// Left rows without a match are kept with nulls on the right
    #[default]
    Left,
}

/// How many right rows a left row may match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one; more is a link arity violation
    #[default]
    ManyToOne,
    OneToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinSource {
    /// A stored table or the output of another view
    Table(String),
    /// A view evaluated inline
    View(Box<ViewDefinition>),
}

impl JoinSource {
    pub fn table(name: impl Into<String>) -> Self {
        JoinSource::Table(name.into())
    }

    pub fn view(view: ViewDefinition) -> Self {
        JoinSource::View(Box::new(view))
    }
}

/// Equality join of one source onto the rows built so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    #[serde(default)]
    pub kind: JoinKind,
    pub source: JoinSource,
    pub alias: String,
    /// Column of an earlier source, column of this source
    pub on: (ColumnRef, ColumnRef),
    #[serde(default)]
    pub cardinality: Cardinality,
}

impl JoinSpec {
    pub fn new(kind: JoinKind, source: JoinSource, alias: impl Into<String>, left: &str, right: &str) -> Self {
        JoinSpec {
            kind,
            source,
            alias: alias.into(),
            on: (ColumnRef::from(left), ColumnRef::from(right)),
            cardinality: Cardinality::ManyToOne,
        }
    }

    pub fn left(source: JoinSource, alias: impl Into<String>, left: &str, right: &str) -> Self {
        Self::new(JoinKind::Left, source, alias, left, right)
    }

    pub fn inner(source: JoinSource, alias: impl Into<String>, left: &str, right: &str) -> Self {
        Self::new(JoinKind::Inner, source, alias, left, right)
    }

    pub fn one_to_many(mut self) -> Self {
        self.cardinality = Cardinality::OneToMany;
        self
    }
}

/// An output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    Expr { name: String, expr: Expr },
    /// Every column of a source
    All(String),
}

impl Projection {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Projection::Expr {
            name: name.into(),
            expr,
        }
    }
}

/// An aggregate output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub name: String,
    pub kind: AggregateKind,
    /// Input of the aggregate; a plain count counts rows when unset
    #[serde(default)]
    pub expr: Option<Expr>,
    /// Only rows matching this predicate are aggregated
    #[serde(default)]
    pub filter: Option<Expr>,
    /// Dimensions this measure is declared to aggregate across
    #[serde(default)]
    pub across: Vec<String>,
}

impl Measure {
    pub fn new(name: impl Into<String>, kind: AggregateKind, expr: Option<Expr>) -> Self {
        Measure {
            name: name.into(),
            kind,
            expr,
            filter: None,
            across: vec![],
        }
    }

    pub fn count(name: impl Into<String>) -> Self {
        Self::new(name, AggregateKind::Count, None)
    }

    pub fn sum(name: impl Into<String>, expr: Expr) -> Self {
        Self::new(name, AggregateKind::Sum, Some(expr))
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn across<I, S>(mut self, dimensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.across = dimensions.into_iter().map(Into::into).collect();
        self
    }
}

/// Declarative join, filter and aggregate over stored tables.
///
/// A view without group-by columns or measures projects one row per joined
/// row through `select`. Otherwise it produces one row per group, made of the
/// group-by columns followed by the measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDefinition {
    pub name: String,
    pub base: String,
    pub alias: String,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub group_by: Vec<Projection>,
    #[serde(default)]
    pub select: Vec<Projection>,
    #[serde(default)]
    pub measures: Vec<Measure>,
    #[serde(default = "default_disposition")]
    pub write_disposition: WriteDisposition,
    /// Merge key of the derived table; the group-by columns when unset
    #[serde(default)]
    pub primary_key: Vec<String>,
}

fn default_disposition() -> WriteDisposition {
    WriteDisposition::Replace
}

impl ViewDefinition {
    pub fn new(name: impl Into<String>, base: impl Into<String>) -> Self {
        let base = base.into();
        ViewDefinition {
            name: name.into(),
            alias: base.clone(),
            base,
            joins: vec![],
            filter: None,
            group_by: vec![],
            select: vec![],
            measures: vec![],
            write_disposition: WriteDisposition::Replace,
            primary_key: vec![],
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn group_by(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.group_by.push(Projection::new(name, expr));
        self
    }

    pub fn select(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.select.push(Projection::new(name, expr));
        self
    }

    pub fn select_all(mut self, alias: impl Into<String>) -> Self {
        self.select.push(Projection::All(alias.into()));
        self
    }

    pub fn measure(mut self, measure: Measure) -> Self {
        self.measures.push(measure);
        self
    }

    pub fn disposition(mut self, disposition: WriteDisposition) -> Self {
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

    /// Per-parent aggregate over a child table.
    ///
    /// Groups the child by its parent link, then left joins the groups back
    /// to the parent so parents without children keep a row. Counts over
    /// missing children read as zero.
    pub fn rollup(name: impl Into<String>, parent: &str, child: &str, keep: &[&str], measure: Measure) -> Self {
        let name = name.into();
        let measure_name = measure.name.clone();
        let zero_default = matches!(measure.kind, AggregateKind::Count | AggregateKind::CountDistinct);

        let groups = ViewDefinition::new(format!("{}__groups", name), child)
            .alias("c")
            .group_by(PARENT_ID, Expr::col(&format!("c.{}", PARENT_ID)))
            .measure(measure);

        let mut view = ViewDefinition::new(name, parent).alias("p").join(JoinSpec::left(
            JoinSource::view(groups),
            "c",
            &format!("p.{}", ROW_ID),
            &format!("c.{}", PARENT_ID),
        ));

        for column in keep {
            view = view.select(*column, Expr::col(&format!("p.{}", column)));
        }

        let value = Expr::col(&format!("c.{}", measure_name));
        let value = if zero_default {
            Expr::Coalesce(vec![value, Expr::lit(0)])
        } else {
            value
        };
        view.select(measure_name, value)
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || !self.measures.is_empty()
    }

    /// Names of the stored tables or views this view reads
    pub fn dependencies(&self) -> Vec<&str> {
        let mut names = vec![self.base.as_str()];
        for join in &self.joins {
            match &join.source {
                JoinSource::Table(name) => names.push(name),
                JoinSource::View(view) => names.extend(view.dependencies()),
            }
        }
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Merge key used when writing the derived table
    pub fn merge_key(&self) -> Vec<String> {
        if !self.primary_key.is_empty() {
            return self.primary_key.clone();
        }
        self.group_by
            .iter()
            .filter_map(|p| match p {
                Projection::Expr { name, .. } => Some(name.clone()),
                Projection::All(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rollup_shape() {
        let view = ViewDefinition::rollup("repo_tags", "repos", "repos__tags", &["id"], Measure::count("tag_count"));

        assert_eq!(view.base, "repos");
        assert_eq!(view.dependencies(), vec!["repos", "repos__tags"]);
        assert_eq!(view.joins.len(), 1);
        assert_eq!(view.select.len(), 2);
        assert!(!view.is_aggregate());
    }

    #[test]
    fn test_view_from_json() {
        let view: ViewDefinition = serde_json::from_value(json!({
            "name": "open_issues",
            "base": "issues",
            "alias": "i",
            "filter": {"compare": {"op": "eq", "left": {"column": "i.state"}, "right": {"literal": "open"}}},
            "group_by": [{"expr": {"name": "repo", "expr": {"column": "i.repo"}}}],
            "measures": [{"name": "open", "kind": "count"}]
        }))
        .unwrap();

        assert_eq!(view.write_disposition, WriteDisposition::Replace);
        assert_eq!(view.merge_key(), vec!["repo"]);
        assert_eq!(view.measures[0].kind, AggregateKind::Count);
    }
}
