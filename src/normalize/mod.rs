//! Normalization - flatten nested records into linked relational rows
//!
//! Scalar fields become columns named by their path (`a__b__c`). Arrays of
//! objects become child tables (`parent__field`) whose rows carry their own
//! `_row_id`, a `_parent_id` link to the row they were nested in, and a
//! `_root_id` link to the top-level row.

pub mod identity;
pub mod normalizer;

pub use identity::IdentityMode;
pub use normalizer::{Fragment, NormalizedRecord, Normalizer};
