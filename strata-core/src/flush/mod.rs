//! Flushing MemTables into TsFiles
//!
//! [`MemTableFlushTask`] turns one MemTable into chunk groups through an
//! encode stage and an I/O stage. [`FlushManager`] schedules flushes of
//! open files on a fixed pool of worker threads.

mod manager;
mod order;
mod task;

pub use manager::{FlushManager, FlushStats, FlushTarget};
pub use order::{LexicographicOrder, MeasurementOrder, SchemaOrder};
pub use task::MemTableFlushTask;
