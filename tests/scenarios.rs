//! End-to-end runs: records through the pipeline into storage, then views,
//! dedup and metrics over what landed.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use smelter::dedup::{DedupConfig, DedupSource, Deduplicator};
use smelter::transform::{EngineConfig, Expr, JoinSource, JoinSpec, Measure, SemiAdditivePolicy};
use smelter::types::{PARENT_ID, ROW_ID};
use smelter::{
    DataType, Error, JsonlStorage, MemoryStorage, Pipeline, PipelineConfig, Row, SchemaModel,
    Storage, TableMetrics, TransformationEngine, ViewDefinition, WriteCoordinator,
    WriteDisposition,
};
use std::sync::Arc;

fn rows(values: Vec<Value>) -> Vec<Row> {
    values
        .into_iter()
        .map(|v| v.as_object().unwrap().clone())
        .collect()
}

fn load(config: PipelineConfig, storage: &Arc<MemoryStorage>, records: Vec<Value>) -> SchemaModel {
    let (schema, report) = Pipeline::new(config, SchemaModel::new(), storage.clone())
        .run(records)
        .unwrap();
    assert!(report.errors.is_empty());
    schema
}

fn engine(storage: &Arc<MemoryStorage>) -> TransformationEngine<MemoryStorage> {
    TransformationEngine::new(Arc::new(WriteCoordinator::new(storage.clone())), EngineConfig::default())
}

#[test]
fn test_flat_record_makes_one_row_in_one_table() {
    let storage = Arc::new(MemoryStorage::new());
    let schema = load(
        PipelineConfig::new("events"),
        &storage,
        vec![json!({"id": 1, "user": {"name": "ana", "plan": {"tier": "pro"}}})],
    );

    assert_eq!(schema.tables.len(), 1);
    let events = storage.read_table("events").unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["user__name"], "ana");
    assert_eq!(events[0]["user__plan__tier"], "pro");
}

#[test]
fn test_repo_tags_rollup() {
    let storage = Arc::new(MemoryStorage::new());
    let schema = load(
        PipelineConfig::new("repos").with_exploded_scalar_arrays(),
        &storage,
        vec![json!({"id": 1, "tags": ["a", "b"]}), json!({"id": 2, "tags": []})],
    );
    assert!(schema.table("repos").unwrap().column("tags").is_none());
    assert_eq!(storage.read_table("repos__tags").unwrap().len(), 2);

    let engine = engine(&storage).with_schema(schema);
    let view = ViewDefinition::rollup("repo_tags", "repos", "repos__tags", &["id"], Measure::count("tag_count"));
    engine.materialize(&view).unwrap();

    assert_eq!(
        storage.read_table("repo_tags").unwrap(),
        rows(vec![json!({"id": 1, "tag_count": 2}), json!({"id": 2, "tag_count": 0})])
    );
}

#[test]
fn test_child_rows_match_array_lengths() {
    let storage = Arc::new(MemoryStorage::new());
    let lengths = [0usize, 1, 3, 5];
    let records = lengths
        .iter()
        .enumerate()
        .map(|(id, n)| json!({"id": id, "items": (0..*n).map(|i| json!({"n": i})).collect::<Vec<_>>()}))
        .collect();
    load(PipelineConfig::new("orders"), &storage, records);

    let engine = engine(&storage);
    let view = ViewDefinition::new("order_items", "orders")
        .alias("o")
        .join(JoinSpec::left(JoinSource::table("orders__items"), "i", "o._row_id", "i._parent_id").one_to_many())
        .group_by("id", Expr::col("o.id"))
        .measure(Measure::new("items", smelter::transform::AggregateKind::Count, Some(Expr::col("i._row_id"))));

    let counts: Vec<Value> = engine
        .run(&view)
        .unwrap()
        .rows
        .into_iter()
        .map(|row| row["items"].clone())
        .collect();
    assert_eq!(counts, vec![json!(0), json!(1), json!(3), json!(5)]);

    // Every child row points at an existing parent
    let parents: Vec<Value> = storage
        .read_table("orders")
        .unwrap()
        .into_iter()
        .map(|r| r[ROW_ID].clone())
        .collect();
    for item in storage.read_table("orders__items").unwrap() {
        assert!(parents.contains(&item[PARENT_ID]));
    }
}

#[test]
fn test_merge_overwrites_by_key() {
    let storage = Arc::new(MemoryStorage::new());
    let config = PipelineConfig::new("people")
        .with_disposition(WriteDisposition::Merge)
        .with_primary_key(["id"]);

    let schema = load(config.clone(), &storage, vec![json!({"id": 5, "name": "A"})]);
    Pipeline::new(config, schema, storage.clone())
        .run(vec![json!({"id": 5, "name": "B"})])
        .unwrap();

    let people = storage.read_table("people").unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(people[0]["id"], 5);
    assert_eq!(people[0]["name"], "B");
}

#[test]
fn test_merge_twice_leaves_identical_tables() {
    let storage = Arc::new(MemoryStorage::new());
    let config = PipelineConfig::new("repos")
        .with_disposition(WriteDisposition::Merge)
        .with_primary_key(["id"]);
    let records = vec![
        json!({"id": 1, "owner": {"login": "x"}, "issues": [{"n": 1}, {"n": 2}]}),
        json!({"id": 2, "owner": {"login": "y"}, "issues": []}),
    ];

    let schema = load(config.clone(), &storage, records.clone());
    let repos = storage.read_table("repos").unwrap();
    let issues = storage.read_table("repos__issues").unwrap();

    Pipeline::new(config, schema, storage.clone()).run(records).unwrap();
    assert_eq!(storage.read_table("repos").unwrap(), repos);
    assert_eq!(storage.read_table("repos__issues").unwrap(), issues);
}

#[test]
fn test_types_only_widen_across_runs() {
    let storage = Arc::new(MemoryStorage::new());
    let config = PipelineConfig::new("t");
    let mut schema = SchemaModel::new();
    let mut seen = vec![];

    for value in [json!(1), json!("a"), json!(1)] {
        let (next, _) = Pipeline::new(config.clone(), schema, storage.clone())
            .run(vec![json!({ "x": value })])
            .unwrap();
        seen.push((next.version, next.table("t").unwrap().column("x").unwrap().data_type));
        schema = next;
    }

    assert_eq!(seen[0].1, DataType::Int);
    assert_eq!(seen[1].1, DataType::Variant);
    assert_eq!(seen[2].1, DataType::Variant);
    assert!(seen[1].0 > seen[0].0);
    assert_eq!(seen[2].0, seen[1].0);
}

#[test]
fn test_dedup_of_loaded_sources_is_stable() {
    let storage = Arc::new(MemoryStorage::new());
    load(
        PipelineConfig::new("crm"),
        &storage,
        vec![json!({"email": "a@x.io", "name": "Ana", "phone": null}), json!({"email": "b@x.io", "name": "Bo"})],
    );
    load(
        PipelineConfig::new("billing"),
        &storage,
        vec![json!({"mail": "a@x.io", "name": "Ana Maria", "phone": "555"})],
    );

    let sources = vec![
        DedupSource::load(storage.as_ref(), "crm", "email", 1).unwrap(),
        DedupSource::load(storage.as_ref(), "billing", "mail", 2)
            .unwrap()
            .rename("mail", "email"),
    ];
    let dedup = Deduplicator::new(DedupConfig::default());
    let first = dedup.dedupe(&sources).unwrap();

    assert_eq!(first.entities.len(), 2);
    assert_eq!(first.entities[0]["name"], "Ana Maria");
    assert_eq!(first.entities[0]["phone"], "555");
    assert_eq!(first.entities[1]["phone"], Value::Null);

    let again = dedup
        .dedupe(&[DedupSource::new("entities", "email", 0, first.entities.clone())])
        .unwrap();
    assert_eq!(again.entities, first.entities);
}

#[test]
fn test_semi_additive_balances() {
    let storage = Arc::new(MemoryStorage::new());
    load(
        PipelineConfig::new("balances"),
        &storage,
        vec![
            json!({"day": "2024-03-01", "account": "a", "balance": 100}),
            json!({"day": "2024-03-02", "account": "a", "balance": 120}),
            json!({"day": "2024-03-01", "account": "b", "balance": 50}),
        ],
    );

    let engine = engine(&storage);
    engine.declare_semi_additive("balances", "balance", ["day"]);

    let across_days = ViewDefinition::new("per_account", "balances")
        .alias("b")
        .group_by("account", Expr::col("b.account"))
        .measure(Measure::sum("balance", Expr::col("b.balance")));
    assert!(matches!(
        engine.materialize(&across_days).unwrap_err(),
        Error::SemiAdditiveViolation { .. }
    ));
    assert!(storage.read_table("per_account").unwrap().is_empty());

    let per_day = ViewDefinition::new("per_day", "balances")
        .alias("b")
        .group_by("day", Expr::col("b.day"))
        .measure(Measure::sum("balance", Expr::col("b.balance")));
    let table = engine.materialize(&per_day).unwrap().table;
    assert_eq!(
        table.rows,
        rows(vec![json!({"day": "2024-03-01", "balance": 150}), json!({"day": "2024-03-02", "balance": 120})])
    );

    let lenient = TransformationEngine::new(
        Arc::new(WriteCoordinator::new(storage.clone())),
        EngineConfig { semi_additive: SemiAdditivePolicy::Warn },
    );
    lenient.declare_semi_additive("balances", "balance", ["day"]);
    assert_eq!(lenient.run(&across_days).unwrap().warnings.len(), 1);
}

#[test]
fn test_independent_runs_share_a_coordinator() {
    let storage = Arc::new(MemoryStorage::new());
    let coordinator = Arc::new(WriteCoordinator::new(storage.clone()));

    std::thread::scope(|scope| {
        for name in ["left", "right"] {
            let coordinator = coordinator.clone();
            scope.spawn(move || {
                let mut config = PipelineConfig::new(name);
                config.batch_size = 3;
                let records = (0..30).map(|i| json!({"i": i, "xs": [i, i + 1]}));
                Pipeline::with_coordinator(config, SchemaModel::new(), coordinator)
                    .run(records)
                    .unwrap();
            });
        }
    });

    assert_eq!(storage.read_table("left").unwrap().len(), 30);
    assert_eq!(storage.read_table("right").unwrap().len(), 30);
}

#[test]
fn test_jsonl_runs_resume_from_saved_schema() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(JsonlStorage::open(dir.path()).unwrap());
    let schema_path = dir.path().join("_schema.json");
    let config = PipelineConfig::new("logs");

    let (schema, _) = Pipeline::new(config.clone(), SchemaModel::load(&schema_path).unwrap(), storage.clone())
        .run(vec![json!({"level": "info", "ctx": [{"k": "a"}]})])
        .unwrap();
    schema.save(&schema_path).unwrap();

    let reloaded = SchemaModel::load(&schema_path).unwrap();
    assert_eq!(reloaded, schema);

    let (schema, _) = Pipeline::new(config, reloaded, storage.clone())
        .run(vec![json!({"level": "warn", "code": 7})])
        .unwrap();
    assert!(schema.table("logs").unwrap().column("code").is_some());

    let logs = storage.read_table("logs").unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(storage.read_table("logs__ctx").unwrap().len(), 1);

    let metrics = TableMetrics::load(storage.as_ref(), "logs").unwrap();
    assert_eq!(metrics.row_count, 2);
    assert_eq!(metrics.column("code").unwrap().null_count, 1);
}
