//! smelter-normalize: Load nested JSON into linked relational tables
//!
//! Each table lands as `<table>.jsonl` in the output directory, and the
//! evolving schema is kept next to them in `_schema.json` so later runs
//! pick up where the last one stopped.
//!
//! Usage:
//!   # Append a JSON document or array
//!   smelter-normalize data.json --output-dir ./tables --table users
//!
//!   # Merge NDJSON from stdin by primary key
//!   cat events.jsonl | smelter-normalize --ndjson -o ./tables --table events \
//!       --disposition merge --primary-key id
//!
//!   # Start from a config file and override one setting
//!   smelter-normalize --ndjson repos.jsonl -o ./tables --config pipeline.json --workers 4

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use smelter::{
    logging, normalize_json, JsonlStorage, NullPolicy, Pipeline, PipelineConfig, SchemaModel,
    WriteDisposition,
};
use std::fs::File;
use std::io::{stdin, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

const SCHEMA_FILE: &str = "_schema.json";

#[derive(Parser, Debug)]
#[command(name = "smelter-normalize")]
#[command(about = "Load nested JSON into linked relational tables", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Process newline-delimited JSON (one record per line)
    #[arg(long)]
    ndjson: bool,

    /// Directory holding the table files and the schema
    #[arg(long, short = 'o')]
    output_dir: PathBuf,

    /// Pipeline configuration as JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root table name
    #[arg(long)]
    table: Option<String>,

    /// append, replace or merge
    #[arg(long, value_parser = parse_disposition)]
    disposition: Option<WriteDisposition>,

    /// Comma-separated primary key columns of the root table
    #[arg(long)]
    primary_key: Option<String>,

    /// Turn arrays of scalars into child tables
    #[arg(long)]
    explode_scalar_arrays: bool,

    /// Keep column types on conflict and null the values that do not fit
    #[arg(long)]
    keep_types: bool,

    /// Maximum nesting depth to descend
    #[arg(long)]
    max_depth: Option<usize>,

    /// Separator for nested column and table names (default: "__")
    #[arg(long)]
    separator: Option<String>,

    /// Records per commit
    #[arg(long)]
    batch_size: Option<usize>,

    /// Normalization workers per batch
    #[arg(long)]
    workers: Option<usize>,
}

fn parse_disposition(value: &str) -> Result<WriteDisposition, String> {
    serde_json::from_value(Value::String(value.to_lowercase()))
        .map_err(|_| format!("unknown disposition {}", value))
}

impl Args {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open config {}", path.display()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };

        if let Some(table) = &self.table {
            config.table_name = table.clone();
        }
        if let Some(disposition) = self.disposition {
            config.write_disposition = disposition;
        }
        if let Some(keys) = &self.primary_key {
            config.primary_key = keys
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if self.explode_scalar_arrays {
            config.explode_scalar_arrays = true;
        }
        if self.keep_types {
            config.null_policy = NullPolicy::Keep;
        }
        if let Some(depth) = self.max_depth {
            config.max_depth = depth;
        }
        if let Some(sep) = &self.separator {
            config.separator = sep.clone();
        }
        if let Some(size) = self.batch_size {
            config.batch_size = size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    logging::register_logger();
    let args = Args::parse();
    let config = args.pipeline_config()?;

    let storage = Arc::new(JsonlStorage::open(&args.output_dir)?);
    let schema_path = args.output_dir.join(SCHEMA_FILE);
    let schema = SchemaModel::load(&schema_path)?;

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path))?,
        )),
        None => Box::new(BufReader::new(stdin())),
    };

    let (schema, report) = if args.ndjson {
        normalize_json(reader, storage, config, schema)?
    } else {
        let value = read_document(reader)?;
        Pipeline::new(config, schema, storage).run(vec![value])?
    };

    schema.save(&schema_path)?;
    println!("{}", serde_json::to_string_pretty(&report.summary())?);

    if !report.is_clean() {
        eprintln!(
            "⚠ {} record(s) skipped, {} schema conflict(s), {} value(s) nulled",
            report.errors.len(),
            report.conflicts.len(),
            report.dropped_values
        );
    }
    Ok(())
}

/// Parse a whole JSON document with SIMD
fn read_document(mut reader: Box<dyn BufRead>) -> Result<Value> {
    let mut content = Vec::new();
    reader.read_to_end(&mut content)?;
    let value: Value =
        simd_json::serde::from_slice(&mut content).context("Failed to parse JSON document")?;
    Ok(value)
}
