use thiserror::Error;

/// Errors raised by normalization, deduplication, transformation and writes
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema conflict on {table}.{column}: {reason}")]
    SchemaConflict {
        table: String,
        column: String,
        reason: String,
    },

    #[error("dedup conflict for key {key} on field {field}: {existing} vs {incoming} at priority {priority}")]
    DedupConflict {
        key: String,
        field: String,
        existing: String,
        incoming: String,
        priority: i32,
    },

    #[error("join {join} in view {view} matched {matches} rows for key {key}, expected at most one")]
    LinkArityViolation {
        view: String,
        join: String,
        key: String,
        matches: usize,
    },

    #[error("view {view} references unknown {kind} {name}")]
    UnknownReference {
        view: String,
        kind: &'static str,
        name: String,
    },

    #[error("view {view} projects {column} outside its group-by")]
    UngroupedProjection { view: String, column: String },

    #[error("write conflict on table {table}: expected version {expected:?}, found {found:?}")]
    WriteConflict {
        table: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("measure {measure} in view {view} sums semi-additive column {column} across {dimensions:?}")]
    SemiAdditiveViolation {
        view: String,
        measure: String,
        column: String,
        dimensions: Vec<String>,
    },

    #[error("row for table {table} is missing primary key column {column}")]
    MissingPrimaryKey { table: String, column: String },

    #[error("records must be objects or scalars, got {0}")]
    UnsupportedRoot(&'static str),

    #[error("views {0:?} depend on each other")]
    DependencyCycle(Vec<String>),

    #[error("view {view} was skipped because {upstream} failed")]
    UpstreamFailed { view: String, upstream: String },

    #[error("commit applied partially, failed at table {table}: {source}")]
    PartialCommit {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether re-running the failed step can succeed without other changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WriteConflict { .. } | Error::Storage(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
