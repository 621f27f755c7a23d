//! Storage engine - coordinates all storage components
//!
//! [`StorageEngine`] routes writes to one [`StorageGroupProcessor`] per
//! storage group. A group keeps a [`TsFileProcessor`] for each open file
//! and a [`TsFileManagement`](crate::management::TsFileManagement) per
//! time partition. Everything shared lives in the [`ResourceContext`].

mod context;
mod engine;
mod group;
mod processor;

pub use context::ResourceContext;
pub use engine::{storage_group_name, StorageEngine};
pub use group::StorageGroupProcessor;
pub use processor::TsFileProcessor;
