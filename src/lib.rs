//! # Smelter - nested documents to relational tables
//!
//! Smelter takes a stream of nested JSON records and turns it into a family
//! of linked flat tables, infers and evolves their schema as data arrives,
//! and writes them through a coordinator that keeps every batch atomic.
//! On top of the stored tables it can deduplicate entities drawn from
//! several sources and build derived tables from declarative views.
//!
//! ## Modules
//!
//! - **normalize**: flatten one record into root and child rows with link columns
//! - **schema**: the versioned table model and the type widening lattice
//! - **pipeline**: batch records, evolve the schema and commit per disposition
//! - **write**: storage backends and the per-table write coordinator
//! - **dedup**: priority-based merge of entities keyed across sources
//! - **transform**: views with joins, filters and measures
//! - **metrics**: column profiles of stored tables
//!
//! ## Quick Start
//!
//! ```rust
//! use smelter::{MemoryStorage, Pipeline, PipelineConfig, SchemaModel, Storage};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> anyhow::Result<()> {
//! let storage = Arc::new(MemoryStorage::new());
//! let config = PipelineConfig::new("repos").with_exploded_scalar_arrays();
//!
//! let records = vec![
//!     json!({"id": 1, "tags": ["a", "b"]}),
//!     json!({"id": 2, "tags": []}),
//! ];
//! let (schema, report) = Pipeline::new(config, SchemaModel::new(), storage.clone()).run(records)?;
//!
//! assert_eq!(report.committed, 2);
//! assert!(schema.table("repos__tags").is_some());
//! assert_eq!(storage.read_table("repos__tags")?.len(), 2);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use serde_json::Value;
use std::io::BufRead;
use std::sync::Arc;

pub mod dedup;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod pipeline;
pub mod schema;
pub mod transform;
pub mod types;
pub mod write;

// Re-export commonly used types for convenience
pub use dedup::{DedupConfig, DedupOutput, DedupSource, Deduplicator};
pub use error::Error;
pub use metrics::TableMetrics;
pub use normalize::{NormalizedRecord, Normalizer};
pub use pipeline::{Pipeline, RunReport};
pub use schema::{DataType, SchemaModel};
pub use transform::{TransformationEngine, ViewDefinition};
pub use types::{HardDelete, NullPolicy, PipelineConfig, Record, Row, WriteDisposition};
pub use write::{JsonlStorage, MemoryStorage, Storage, WriteCoordinator};

/// Normalize a newline-delimited JSON stream into `storage`.
///
/// Blank lines are skipped. A line that is not valid JSON stops the run
/// before it is finished.
pub fn normalize_json<R, S>(
    reader: R,
    storage: Arc<S>,
    config: PipelineConfig,
    schema: SchemaModel,
) -> Result<(SchemaModel, RunReport)>
where
    R: BufRead,
    S: Storage + ?Sized,
{
    let mut pipeline = Pipeline::new(config, schema, storage);
    let mut failure = None;

    let records = reader
        .lines()
        .enumerate()
        .map(|(n, line)| {
            let line = line.with_context(|| format!("Failed to read line {}", n + 1))?;
            if line.trim().is_empty() {
                return Ok(None);
            }
            let value: Value = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse JSON on line {}", n + 1))?;
            Ok(Some(value))
        })
        .map_while(|parsed: Result<Option<Value>>| match parsed {
            Ok(value) => Some(value),
            Err(e) => {
                failure = Some(e);
                None
            }
        })
        .flatten();

    pipeline.ingest(records)?;
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(pipeline.finish()?)
}
