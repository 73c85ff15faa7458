//! Writing rows to storage
//!
//! A [`Storage`] backend owns physical tables. The [`WriteCoordinator`] sits
//! on top of it and turns append, replace and merge dispositions into
//! versioned commits.

pub mod coordinator;
pub mod jsonl;
pub mod memory;
pub mod storage;

pub use crate::types::WriteDisposition;
pub use coordinator::{TableWrite, WriteCoordinator, WriteSummary};
pub use jsonl::JsonlStorage;
pub use memory::MemoryStorage;
pub use storage::{Expect, Storage, StorageWrite, TableMeta, WriteMode};
