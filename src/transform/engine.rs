use crate::error::{Error, Result};
use crate::schema::SchemaModel;
use crate::transform::aggregate::{Accumulator, AggregateKind};
use crate::transform::expr::{is_true, ColumnRef};
use crate::transform::validate::{validate, Catalog, SemiAdditiveColumn, ValidatedView};
use crate::transform::view::{Cardinality, JoinKind, JoinSource, Projection, ViewDefinition};
use crate::types::{canonical, Row};
use crate::write::{Storage, TableWrite, WriteCoordinator, WriteSummary};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What to do when a semi-additive column is summed across a dimension it
/// must not be summed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemiAdditivePolicy {
    #[default]
    Reject,
    /// Evaluate anyway and report the problem as a warning
    Warn,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub semi_additive: SemiAdditivePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    Passthrough,
    /// A join key or synthetic link column
    ForeignKey,
    Measure(AggregateKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedColumn {
    pub name: String,
    pub role: ColumnRole,
}

/// Rows produced by evaluating a view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedTable {
    pub name: String,
    pub columns: Vec<DerivedColumn>,
    pub rows: Vec<Row>,
    pub warnings: Vec<String>,
}

/// A derived table and the write that persisted it
#[derive(Debug, Clone)]
pub struct Materialized {
    pub table: DerivedTable,
    pub write: WriteSummary,
}

/// Rows joined so far, as one row index per source
struct Frame {
    aliases: Vec<String>,
    rows: Vec<Vec<Row>>,
    tuples: Vec<Vec<Option<usize>>>,
}

impl Frame {
    fn value(&self, tuple: &[Option<usize>], column: &ColumnRef) -> Value {
        self.aliases
            .iter()
            .position(|alias| *alias == column.alias)
            .and_then(|pos| {
                let index = tuple.get(pos).copied().flatten()?;
                self.rows[pos][index].get(&column.column).cloned()
            })
            .unwrap_or(Value::Null)
    }
}

/// Evaluates views over stored tables and writes the results back.
///
/// Evaluation only reads storage, so independent views run in parallel.
pub struct TransformationEngine<S: Storage + ?Sized> {
    coordinator: Arc<WriteCoordinator<S>>,
    config: EngineConfig,
    schema: Option<SchemaModel>,
    /// Derived tables and declared semi-additive columns
    registry: RwLock<Catalog>,
}

impl<S: Storage + ?Sized> TransformationEngine<S> {
    pub fn new(coordinator: Arc<WriteCoordinator<S>>, config: EngineConfig) -> Self {
        TransformationEngine {
            coordinator,
            config,
            schema: None,
            registry: RwLock::new(Catalog::default()),
        }
    }

    /// Resolve columns of tables that are known to the schema but hold no
    /// rows yet
    pub fn with_schema(mut self, schema: SchemaModel) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Mark a stored column as not summable across the given dimensions.
    /// The table's grain is taken to be those same dimensions.
    pub fn declare_semi_additive<I, D>(&self, table: &str, column: &str, non_summable: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        let non_summable: Vec<String> = non_summable.into_iter().map(Into::into).collect();
        self.registry.write().declare_semi_additive(
            table,
            column,
            SemiAdditiveColumn {
                dimensions: non_summable.clone(),
                non_summable,
            },
        );
    }

    /// Everything views may reference right now
    pub fn catalog(&self) -> Result<Catalog> {
        let mut catalog = Catalog::default();
        for meta in self.coordinator.storage().list_tables()? {
            catalog.add_table(&meta.name, meta.columns);
        }
        if let Some(schema) = &self.schema {
            for table in schema.tables.values() {
                catalog.add_table(&table.name, table.columns.keys().cloned());
            }
        }
        catalog.extend(&self.registry.read());
        Ok(catalog)
    }

    pub fn validate(&self, view: &ViewDefinition) -> Result<ValidatedView> {
        validate(view, &self.catalog()?, self.config.semi_additive)
    }

    /// Evaluate a view without writing it
    pub fn run(&self, view: &ViewDefinition) -> Result<DerivedTable> {
        let validated = self.validate(view)?;
        let table = self.evaluate(view, &validated)?;
        tracing::info!(view = %view.name, rows = table.rows.len(), "evaluated view");
        Ok(table)
    }

    /// Evaluate a view and write it with its disposition
    pub fn materialize(&self, view: &ViewDefinition) -> Result<Materialized> {
        let validated = self.validate(view)?;
        let table = self.evaluate(view, &validated)?;

        let write = TableWrite::new(view.name.as_str(), table.rows.clone(), view.write_disposition)
            .with_primary_key(view.merge_key());
        let write = self.coordinator.apply_write(write)?;

        let mut registry = self.registry.write();
        registry.add_table(&view.name, validated.column_names());
        for (column, info) in validated.semi_additive {
            registry.declare_semi_additive(&view.name, &column, info);
        }

        Ok(Materialized { table, write })
    }

    /// Materialize a set of views.
    ///
    /// A view reading another view of the set runs after it; views with no
    /// pending dependencies run in parallel. One view failing fails only that
    /// view and the views reading it.
    pub fn run_all(&self, views: &[ViewDefinition]) -> Result<IndexMap<String, Result<Materialized>>> {
        let names: HashSet<&str> = views.iter().map(|v| v.name.as_str()).collect();
        let mut results: HashMap<String, Result<Materialized>> = HashMap::new();
        let mut remaining: Vec<&ViewDefinition> = views.iter().collect();

        while !remaining.is_empty() {
            let (ready, blocked): (Vec<&ViewDefinition>, Vec<&ViewDefinition>) =
                remaining.into_iter().partition(|view| {
                    view.dependencies()
                        .into_iter()
                        .filter(|dep| names.contains(dep))
                        .all(|dep| results.contains_key(dep))
                });

            if ready.is_empty() {
                let mut cycle: Vec<String> = blocked.iter().map(|v| v.name.clone()).collect();
                cycle.sort();
                return Err(Error::DependencyCycle(cycle));
            }

            let mut runnable = Vec::new();
            for view in ready {
                let failed = view
                    .dependencies()
                    .into_iter()
                    .find(|dep| matches!(results.get(*dep), Some(Err(_))));
                match failed {
                    Some(upstream) => {
                        tracing::warn!(view = %view.name, upstream, "skipping view");
                        results.insert(
                            view.name.clone(),
                            Err(Error::UpstreamFailed {
                                view: view.name.clone(),
                                upstream: upstream.to_string(),
                            }),
                        );
                    }
                    None => runnable.push(view),
                }
            }

            let wave: Vec<(String, Result<Materialized>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = runnable
                    .iter()
                    .map(|view| (view.name.clone(), scope.spawn(move || self.materialize(view))))
                    .collect();
                handles
                    .into_iter()
                    .map(|(name, handle)| {
                        let result = handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                        (name, result)
                    })
                    .collect()
            });

            for (name, result) in wave {
                if let Err(e) = &result {
                    tracing::warn!(view = %name, error = %e, "view failed");
                }
                results.insert(name, result);
            }

            remaining = blocked;
        }

        Ok(views
            .iter()
            .filter_map(|view| {
                results
                    .remove(&view.name)
                    .map(|result| (view.name.clone(), result))
            })
            .collect())
    }

    fn load(&self, source: &JoinSource, inline: Option<&ValidatedView>) -> Result<Vec<Row>> {
        match (source, inline) {
            (JoinSource::View(view), Some(validated)) => Ok(self.evaluate(view, validated)?.rows),
            (JoinSource::View(view), None) => Ok(self.run(view)?.rows),
            (JoinSource::Table(name), _) => self.coordinator.storage().read_table(name),
        }
    }

    fn evaluate(&self, view: &ViewDefinition, validated: &ValidatedView) -> Result<DerivedTable> {
        let base = self.coordinator.storage().read_table(&view.base)?;
        let mut frame = Frame {
            aliases: vec![view.alias.clone()],
            tuples: (0..base.len()).map(|i| vec![Some(i)]).collect(),
            rows: vec![base],
        };

        for (join, source) in view.joins.iter().zip(validated.sources.iter().skip(1)) {
            let right = self.load(&join.source, source.inline.as_deref())?;
            let (left_key, right_key) = &join.on;

            let mut index: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, row) in right.iter().enumerate() {
                if let Some(key) = row.get(&right_key.column).filter(|v| !v.is_null()) {
                    index.entry(canonical(key)).or_default().push(i);
                }
            }

            let tuples = std::mem::take(&mut frame.tuples);
            let mut joined = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                let key = frame.value(&tuple, left_key);
                let key_text = canonical(&key);
                let matches = if key.is_null() {
                    &[][..]
                } else {
                    index.get(&key_text).map(Vec::as_slice).unwrap_or(&[])
                };

                if join.cardinality == Cardinality::ManyToOne && matches.len() > 1 {
                    return Err(Error::LinkArityViolation {
                        view: view.name.clone(),
                        join: join.alias.clone(),
                        key: key_text,
                        matches: matches.len(),
                    });
                }

                if matches.is_empty() {
                    if join.kind == JoinKind::Left {
                        let mut next = tuple;
                        next.push(None);
                        joined.push(next);
                    }
                    continue;
                }
                for &i in matches {
                    let mut next = tuple.clone();
                    next.push(Some(i));
                    joined.push(next);
                }
            }

            frame.aliases.push(join.alias.clone());
            frame.rows.push(right);
            frame.tuples = joined;
        }

        if let Some(filter) = &view.filter {
            let tuples = std::mem::take(&mut frame.tuples);
            frame.tuples = tuples
                .into_iter()
                .filter(|t| is_true(&filter.eval(&|c: &ColumnRef| frame.value(t, c))))
                .collect();
        }

        let rows = if view.is_aggregate() {
            aggregate(view, validated, &frame)
        } else {
            project(view, validated, &frame)
        };

        Ok(DerivedTable {
            name: view.name.clone(),
            columns: validated.columns.clone(),
            rows,
            warnings: validated.warnings.clone(),
        })
    }
}

/// Output values of one projection for one joined row
fn projected(
    projection: &Projection,
    validated: &ValidatedView,
    frame: &Frame,
    tuple: &[Option<usize>],
    out: &mut Vec<(String, Value)>,
) {
    match projection {
        Projection::Expr { name, expr } => {
            out.push((name.clone(), expr.eval(&|c: &ColumnRef| frame.value(tuple, c))));
        }
        Projection::All(alias) => {
            if let Some(source) = validated.sources.iter().find(|s| &s.alias == alias) {
                for column in &source.columns {
                    let value = frame.value(tuple, &ColumnRef::new(alias.clone(), column.clone()));
                    out.push((column.clone(), value));
                }
            }
        }
    }
}

fn project(view: &ViewDefinition, validated: &ValidatedView, frame: &Frame) -> Vec<Row> {
    let all = [Projection::All(view.alias.clone())];
    let select = if view.select.is_empty() { &all[..] } else { &view.select[..] };

    frame
        .tuples
        .iter()
        .map(|tuple| {
            let mut values = Vec::new();
            for projection in select {
                projected(projection, validated, frame, tuple, &mut values);
            }
            values.into_iter().collect()
        })
        .collect()
}

fn aggregate(view: &ViewDefinition, validated: &ValidatedView, frame: &Frame) -> Vec<Row> {
    let mut groups: IndexMap<String, (Vec<(String, Value)>, Vec<Accumulator>)> = IndexMap::new();

    for tuple in &frame.tuples {
        let lookup = |c: &ColumnRef| frame.value(tuple, c);

        let mut keys = Vec::new();
        for projection in &view.group_by {
            projected(projection, validated, frame, tuple, &mut keys);
        }
        let group_key = canonical(&Value::Array(keys.iter().map(|(_, v)| v.clone()).collect()));

        let (_, accumulators) = groups.entry(group_key).or_insert_with(|| {
            let accumulators = view.measures.iter().map(|m| m.kind.accumulator()).collect();
            (keys, accumulators)
        });

        for (measure, accumulator) in view.measures.iter().zip(accumulators.iter_mut()) {
            if let Some(filter) = &measure.filter {
                if !is_true(&filter.eval(&lookup)) {
                    continue;
                }
            }
            match &measure.expr {
                Some(expr) => accumulator.update(Some(&expr.eval(&lookup))),
                None => accumulator.update(None),
            }
        }
    }

    // A global aggregate over no rows still yields its one row
    if groups.is_empty() && view.group_by.is_empty() {
        let accumulators = view.measures.iter().map(|m| m.kind.accumulator()).collect();
        groups.insert(String::new(), (vec![], accumulators));
    }

    groups
        .into_values()
        .map(|(keys, accumulators)| {
            let mut row: Row = keys.into_iter().collect();
            for (measure, accumulator) in view.measures.iter().zip(accumulators) {
                row.insert(measure.name.clone(), accumulator.finish());
            }
            row
        })
        .collect()
}
