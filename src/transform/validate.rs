//! Static checks run on a view before any data is read

use crate::error::{Error, Result};
use crate::transform::engine::{ColumnRole, DerivedColumn, SemiAdditivePolicy};
use crate::transform::expr::{ColumnRef, Expr};
use crate::transform::view::{JoinSource, Projection, ViewDefinition};
use crate::types::is_synthetic;
use crate::transform::aggregate::AggregateKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// A column that must not be summed across some dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemiAdditiveColumn {
    pub non_summable: Vec<String>,
    /// Grain of the table the column lives in
    pub dimensions: Vec<String>,
}

/// Known tables, their columns, and their semi-additive columns
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: HashMap<String, Vec<String>>,
    semi_additive: HashMap<String, HashMap<String, SemiAdditiveColumn>>,
}

impl Catalog {
    /// Add a table, or extend a known one with new columns
    pub fn add_table<I>(&mut self, name: &str, columns: I)
    where
        I: IntoIterator<Item = String>,
    {
        let known = self.tables.entry(name.to_string()).or_default();
        for column in columns {
            if !known.contains(&column) {
                known.push(column);
            }
        }
    }

    pub fn declare_semi_additive(&mut self, table: &str, column: &str, info: SemiAdditiveColumn) {
        self.semi_additive
            .entry(table.to_string())
            .or_default()
            .insert(column.to_string(), info);
    }

    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }

    fn semi_additive_of(&self, table: &str) -> HashMap<String, SemiAdditiveColumn> {
        self.semi_additive.get(table).cloned().unwrap_or_default()
    }

    /// Fold another catalog into this one
    pub fn extend(&mut self, other: &Catalog) {
        for (name, columns) in &other.tables {
            self.add_table(name, columns.iter().cloned());
        }
        for (table, columns) in &other.semi_additive {
            for (column, info) in columns {
                self.declare_semi_additive(table, column, info.clone());
            }
        }
    }
}

/// One aliased input of a view
#[derive(Debug, Clone)]
pub struct Source {
    pub alias: String,
    pub columns: Vec<String>,
    pub semi_additive: HashMap<String, SemiAdditiveColumn>,
    /// Set when the source is a view evaluated inline
    pub inline: Option<Box<ValidatedView>>,
}

impl Source {
    fn has(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// A view that passed validation, with everything evaluation needs
#[derive(Debug, Clone)]
pub struct ValidatedView {
    pub sources: Vec<Source>,
    pub columns: Vec<DerivedColumn>,
    pub semi_additive: HashMap<String, SemiAdditiveColumn>,
    pub warnings: Vec<String>,
}

impl ValidatedView {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

struct Checker<'a> {
    view: &'a ViewDefinition,
    policy: SemiAdditivePolicy,
    sources: Vec<Source>,
    warnings: Vec<String>,
}

impl<'a> Checker<'a> {
    fn unknown(&self, kind: &'static str, name: impl Into<String>) -> Error {
        Error::UnknownReference {
            view: self.view.name.clone(),
            kind,
            name: name.into(),
        }
    }

    fn source(&self, alias: &str) -> Result<&Source> {
        self.sources
            .iter()
            .find(|s| s.alias == alias)
            .ok_or_else(|| self.unknown("alias", alias))
    }

    fn check_column(&self, column: &ColumnRef) -> Result<()> {
        if self.source(&column.alias)?.has(&column.column) {
            Ok(())
        } else {
            Err(self.unknown("column", column.to_string()))
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<()> {
        for column in expr.columns() {
            self.check_column(column)?;
        }
        Ok(())
    }

    fn check_projection(&self, projection: &Projection) -> Result<()> {
        match projection {
            Projection::Expr { expr, .. } => self.check_expr(expr),
            Projection::All(alias) => self.source(alias).map(|_| ()),
        }
    }

    fn violation(&mut self, measure: &str, column: &str, dimensions: BTreeSet<String>) -> Result<()> {
        let err = Error::SemiAdditiveViolation {
            view: self.view.name.clone(),
            measure: measure.to_string(),
            column: column.to_string(),
            dimensions: dimensions.into_iter().collect(),
        };
        match self.policy {
            SemiAdditivePolicy::Reject => Err(err),
            SemiAdditivePolicy::Warn => {
                tracing::warn!(view = %self.view.name, measure, "{}", err);
                self.warnings.push(err.to_string());
                Ok(())
            }
        }
    }
}

/// Check a view against the catalog: every table, alias and column it
/// names must exist, and no semi-additive column may be summed across a
/// dimension it is not summable over.
pub fn validate(view: &ViewDefinition, catalog: &Catalog, policy: SemiAdditivePolicy) -> Result<ValidatedView> {
    let mut checker = Checker {
        view,
        policy,
        sources: Vec::new(),
        warnings: Vec::new(),
    };

    let base = catalog
        .columns(&view.base)
        .ok_or_else(|| checker.unknown("table", view.base.clone()))?;
    checker.sources.push(Source {
        alias: view.alias.clone(),
        columns: base.to_vec(),
        semi_additive: catalog.semi_additive_of(&view.base),
        inline: None,
    });

    let mut key_refs = HashSet::new();
    for join in &view.joins {
        let (left, right) = &join.on;
        checker.check_column(left)?;
        if right.alias != join.alias {
            return Err(checker.unknown("join column", right.to_string()));
        }

        let source = match &join.source {
            JoinSource::Table(name) => Source {
                alias: join.alias.clone(),
                columns: catalog
                    .columns(name)
                    .ok_or_else(|| checker.unknown("table", name.clone()))?
                    .to_vec(),
                semi_additive: catalog.semi_additive_of(name),
                inline: None,
            },
            JoinSource::View(inner) => {
                let validated = validate(inner, catalog, policy)?;
                checker.warnings.extend(validated.warnings.iter().cloned());
                Source {
                    alias: join.alias.clone(),
                    columns: validated.column_names(),
                    semi_additive: validated.semi_additive.clone(),
                    inline: Some(Box::new(validated)),
                }
            }
        };
        checker.sources.push(source);
        checker.check_column(right)?;

        key_refs.insert(left.clone());
        key_refs.insert(right.clone());
    }

    if let Some(filter) = &view.filter {
        checker.check_expr(filter)?;
    }
    for projection in view.group_by.iter().chain(&view.select) {
        checker.check_projection(projection)?;
    }
    for measure in &view.measures {
        if let Some(expr) = &measure.expr {
            checker.check_expr(expr)?;
        } else if measure.kind != AggregateKind::Count {
            return Err(checker.unknown("measure input", measure.name.clone()));
        }
        if let Some(filter) = &measure.filter {
            checker.check_expr(filter)?;
        }
    }

    let role = |expr: &Expr| match expr {
        Expr::Column(c) if key_refs.contains(c) || is_synthetic(&c.column) => ColumnRole::ForeignKey,
        _ => ColumnRole::Passthrough,
    };

    let mut columns = Vec::new();
    let mut semi_additive = HashMap::new();

    // Expand projections into output columns, carrying semi-additive columns
    // that pass through unchanged
    let mut project = |checker: &Checker, projection: &Projection, columns: &mut Vec<DerivedColumn>| {
        match projection {
            Projection::Expr { name, expr } => {
                columns.push(DerivedColumn {
                    name: name.clone(),
                    role: role(expr),
                });
                if let Expr::Column(c) = expr {
                    if let Some(info) = checker
                        .source(&c.alias)
                        .ok()
                        .and_then(|s| s.semi_additive.get(&c.column))
                    {
                        semi_additive.insert(name.clone(), info.clone());
                    }
                }
            }
            Projection::All(alias) => {
                if let Ok(source) = checker.source(alias) {
                    for column in &source.columns {
                        columns.push(DerivedColumn {
                            name: column.clone(),
                            role: role(&Expr::Column(ColumnRef::new(alias.clone(), column.clone()))),
                        });
                        if let Some(info) = source.semi_additive.get(column) {
                            semi_additive.insert(column.clone(), info.clone());
                        }
                    }
                }
            }
        }
    };

    if !view.is_aggregate() {
        let all = [Projection::All(view.alias.clone())];
        let select = if view.select.is_empty() { &all[..] } else { &view.select[..] };
        for projection in select {
            project(&checker, projection, &mut columns);
        }
        return Ok(ValidatedView {
            sources: checker.sources,
            columns,
            semi_additive,
            warnings: checker.warnings,
        });
    }

    if let Some(Projection::Expr { name, .. } | Projection::All(name)) = view.select.first() {
        return Err(Error::UngroupedProjection {
            view: view.name.clone(),
            column: name.clone(),
        });
    }

    for projection in &view.group_by {
        project(&checker, projection, &mut columns);
    }
    // Group-by columns describe the grain, not measures
    semi_additive.clear();
    let grouped: BTreeSet<String> = columns.iter().map(|c| c.name.clone()).collect();

    for measure in &view.measures {
        columns.push(DerivedColumn {
            name: measure.name.clone(),
            role: ColumnRole::Measure(measure.kind.clone()),
        });

        let mut non_summable = BTreeSet::new();

        if let AggregateKind::SemiAdditive { non_summable: own } = &measure.kind {
            let missing: BTreeSet<String> = own.iter().filter(|d| !grouped.contains(*d)).cloned().collect();
            if !missing.is_empty() {
                checker.violation(&measure.name, &measure.name, missing)?;
            }
            non_summable.extend(own.iter().cloned());
        }

        if measure.kind.sums() {
            for column in measure.expr.iter().flat_map(Expr::columns) {
                let Some(info) = checker
                    .source(&column.alias)?
                    .semi_additive
                    .get(&column.column)
                    .cloned()
                else {
                    continue;
                };

                let mut kept = grouped.clone();
                for projection in &view.group_by {
                    if let Projection::Expr { expr: Expr::Column(g), .. } = projection {
                        if g.alias == column.alias {
                            kept.insert(g.column.clone());
                        }
                    }
                }

                let across: BTreeSet<String> = info
                    .dimensions
                    .iter()
                    .filter(|d| !kept.contains(*d))
                    .chain(&measure.across)
                    .cloned()
                    .collect();
                let hit: BTreeSet<String> = across
                    .into_iter()
                    .filter(|d| info.non_summable.contains(d))
                    .collect();
                if !hit.is_empty() {
                    checker.violation(&measure.name, &column.to_string(), hit)?;
                }
                non_summable.extend(info.non_summable.iter().cloned());
            }
        }

        if !non_summable.is_empty() {
            semi_additive.insert(
                measure.name.clone(),
                SemiAdditiveColumn {
                    non_summable: non_summable.into_iter().collect(),
                    dimensions: grouped.iter().cloned().collect(),
                },
            );
        }
    }

    Ok(ValidatedView {
        sources: checker.sources,
        columns,
        semi_additive,
        warnings: checker.warnings,
    })
}
