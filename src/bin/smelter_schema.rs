//! smelter-schema: Describe the tables a set of records normalizes into
//!
//! Prints every table with its link to the parent, primary key and typed
//! columns, either from a schema saved by `smelter-normalize` or inferred
//! from sample input without writing anything.
//!
//! Usage:
//!   # Describe the schema saved in a table directory
//!   smelter-schema --schema ./tables
//!
//!   # Infer from NDJSON on stdin
//!   cat events.jsonl | smelter-schema --ndjson --table events --compact

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use smelter::{normalize_json, MemoryStorage, Pipeline, PipelineConfig, SchemaModel};
use std::fs::File;
use std::io::{stdin, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "smelter-schema")]
#[command(about = "Describe the relational schema of nested JSON", long_about = None)]
struct Args {
    /// Input file (use stdin if omitted)
    #[arg(value_name = "FILE")]
    input: Option<String>,

    /// Process newline-delimited JSON (one record per line)
    #[arg(long)]
    ndjson: bool,

    /// Describe a saved schema, or the one in a table directory, instead of
    /// reading records
    #[arg(long, conflicts_with = "input")]
    schema: Option<PathBuf>,

    /// Root table name
    #[arg(long, default_value = "root")]
    table: String,

    /// Turn arrays of scalars into child tables
    #[arg(long)]
    explode_scalar_arrays: bool,

    /// Compact output (no pretty-printing)
    #[arg(long)]
    compact: bool,
}

fn main() -> Result<()> {
    smelter::logging::register_logger();
    let args = Args::parse();

    let schema = match &args.schema {
        Some(path) if path.is_dir() => SchemaModel::load(path.join("_schema.json"))?,
        Some(path) => SchemaModel::load(path)?,
        None => infer(&args)?,
    };

    let output = schema.export();
    if args.compact {
        println!("{}", serde_json::to_string(&output)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&output)?);
    }

    eprintln!("✓ Described {} table(s) at schema version {}", schema.tables.len(), schema.version);
    Ok(())
}

/// Normalize the input into scratch memory and keep only the schema
fn infer(args: &Args) -> Result<SchemaModel> {
    let mut config = PipelineConfig::new(args.table.clone());
    config.explode_scalar_arrays = args.explode_scalar_arrays;
    let storage = Arc::new(MemoryStorage::new());

    let mut reader: Box<dyn BufRead> = if let Some(file_path) = &args.input {
        Box::new(BufReader::new(File::open(file_path)?))
    } else {
        Box::new(BufReader::new(stdin()))
    };

    let (schema, _) = if args.ndjson {
        normalize_json(reader, storage, config, SchemaModel::new())?
    } else {
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        let value: Value = simd_json::serde::from_slice(&mut content)?;
        Pipeline::new(config, SchemaModel::new(), storage).run(vec![value])?
    };
    Ok(schema)
}
