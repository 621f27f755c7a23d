//! Strata Core - time-series write path and compaction engine
//!
//! Points are buffered per storage group and time partition in MemTables,
//! flushed into immutable columnar TsFiles, and merged in the background.
//!
//! # Architecture
//!
//! - **MemTable**: per-file mutable buffer, taken from a bounded pool
//! - **Flush**: two-stage encode/I-O pipeline driven by a worker pool
//! - **TsFile**: chunk groups of paged, encoded series plus a metadata index
//! - **Resource**: per-file time index, delete markers and lifecycle flags
//! - **Management**: per-partition sequence and unsequenced file lists
//! - **Compaction**: inner-space and cross-space merges under a budget

pub mod cache;
pub mod compaction;
pub mod config;
pub mod encoding;
pub mod flush;
pub mod management;
pub mod memtable;
pub mod pool;
pub mod resource;
pub mod storage;
pub mod tsfile;

mod error;
mod types;

pub use config::EngineConfig;
pub use error::{Result, StrataError};
pub use storage::StorageEngine;
pub use types::*;

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
