//! Schema inference
//!
//! This module holds the relational model inferred from records and the
//! widening rules used to type its columns.

pub mod format;
pub mod model;
pub mod types;

pub use model::{Column, Link, SchemaConflict, SchemaDelta, SchemaModel, Table};
pub use types::{reconcile, DataType, Resolution};
