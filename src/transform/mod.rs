//! Declarative views over normalized tables
//!
//! A [`ViewDefinition`] joins stored tables on link columns, filters the
//! joined rows, and either projects them or groups and aggregates them into
//! measures. The [`TransformationEngine`] validates views against the tables
//! that exist, evaluates them, and writes the derived tables back.
//!
//! ```text
//! repos ──< repos__tags          ViewDefinition::rollup("repo_tags", ...)
//!   │                              group repos__tags by _parent_id
//!   └── left join ────────────►    left join back onto repos._row_id
//! ```

pub mod aggregate;
pub mod engine;
pub mod expr;
pub mod validate;
pub mod view;

pub use aggregate::AggregateKind;
pub use engine::{
    ColumnRole, DerivedColumn, DerivedTable, EngineConfig, Materialized, SemiAdditivePolicy,
    TransformationEngine,
};
pub use expr::{ColumnRef, CompareOp, Expr};
pub use validate::{Catalog, SemiAdditiveColumn};
pub use view::{Cardinality, JoinKind, JoinSource, JoinSpec, Measure, Projection, ViewDefinition};
