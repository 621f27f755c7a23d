//! Engine configuration and library-wide constants
//!
//! Every option has a default, so a JSON file only needs to name the
//! options it overrides.

use crate::{CompressionType, Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Magic string at both ends of a TsFile
pub const MAGIC_STRING: &[u8; 6] = b"TsFile";

/// File format version written after the head magic
pub const VERSION_NUMBER: &[u8; 6] = b"000002";

/// Suffix of data files
pub const TSFILE_SUFFIX: &str = ".tsfile";

/// Suffix of the resource sidecar of a closed file
pub const RESOURCE_SUFFIX: &str = ".resource";

/// Suffix of modification (delete marker) files
pub const MODS_SUFFIX: &str = ".mods";

/// Suffix of a cross-space merge output before it is swapped in
pub const MERGE_SUFFIX: &str = ".merge";

/// Name of the merge operation log kept in a partition directory
pub const MERGE_LOG_NAME: &str = "merge.log";

/// Name of the modification file recording deletes issued during a merge
pub const MERGING_MODIFICATION_FILE_NAME: &str = "merging.mods";

/// Directory holding sequence files of a partition
pub const SEQUENCE_DIR: &str = "sequence";

/// Directory holding unsequenced files of a partition
pub const UNSEQUENCE_DIR: &str = "unsequence";

/// Bytes charged per point when estimating merge memory
pub const POINT_MEMORY_ESTIMATE: u64 = 16;

/// How the compaction scheduler orders its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompactionPriority {
    /// Round-robin inner-seq, inner-unseq and cross until nothing progresses
    Balance,
    /// Inner-space first, then cross-space
    InnerCross,
    /// Cross-space first, then inner-space
    CrossInner,
}

/// Cross-space file selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeFileStrategy {
    /// Maximize the number of files merged
    MaxFileNum,
    /// Maximize the number of series merged concurrently
    MaxSeriesNum,
}

/// Representation used for per-file time indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeIndexLevel {
    /// Exact start/end time per device
    Device,
    /// One range for the whole file plus the device set
    File,
}

/// Flush pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Worker threads of the flush manager
    pub flush_thread_count: usize,
    /// Capacity of the queue feeding the encoding stage
    pub encoding_task_queue_size_for_flushing: usize,
    /// Capacity of the queue feeding the I/O stage
    pub io_task_queue_size_for_flushing: usize,
    /// Reuse chunk buffers through a pool
    pub enable_chunk_buffer_pooling: bool,
    /// Maximum chunk buffers alive at once when pooling
    pub chunk_buffer_pool_capacity: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            flush_thread_count: 2,
            encoding_task_queue_size_for_flushing: 64,
            io_task_queue_size_for_flushing: 64,
            enable_chunk_buffer_pooling: true,
            chunk_buffer_pool_capacity: 128,
        }
    }
}

/// Compaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Global limit on in-flight compaction tasks
    pub concurrent_compaction_thread: usize,
    /// Accumulated size at which an inner-space run is submitted (bytes)
    pub target_compaction_file_size: u64,
    pub enable_seq_space_compaction: bool,
    pub enable_unseq_space_compaction: bool,
    pub enable_cross_space_compaction: bool,
    /// Memory budget of one cross-space merge (bytes)
    pub merge_memory_budget: u64,
    /// Cap on unsequenced files considered by one cross-space selection
    pub max_open_file_num_in_cross_space_compaction: usize,
    pub compaction_priority: CompactionPriority,
    pub merge_file_strategy: MergeFileStrategy,
    /// Interval of the periodic compaction driver; 0 disables it
    pub compaction_interval_ms: u64,
    /// Files whose data all ends before this bound are not merged.
    /// `None` means no bound.
    pub cross_compaction_time_lower_bound: Option<i64>,
    /// Upper bound of the randomized backoff between composite lock attempts
    pub lock_retry_max_backoff_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            concurrent_compaction_thread: 2,
            target_compaction_file_size: 1024 * 1024 * 1024,
            enable_seq_space_compaction: true,
            enable_unseq_space_compaction: true,
            enable_cross_space_compaction: true,
            merge_memory_budget: 512 * 1024 * 1024,
            max_open_file_num_in_cross_space_compaction: 100,
            compaction_priority: CompactionPriority::Balance,
            merge_file_strategy: MergeFileStrategy::MaxSeriesNum,
            compaction_interval_ms: 60_000,
            cross_compaction_time_lower_bound: None,
            lock_retry_max_backoff_ms: 10,
        }
    }
}

impl CompactionConfig {
    /// Lower time bound below which files are considered dead for merging
    pub fn time_lower_bound(&self) -> i64 {
        self.cross_compaction_time_lower_bound.unwrap_or(i64::MIN)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }

    pub fn lock_retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_max_backoff_ms)
    }
}

/// File format configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsFileConfig {
    /// A page is sealed once its estimated size reaches this many bytes
    pub page_size_bytes: usize,
    /// A page is sealed once it holds this many points
    pub max_points_per_page: usize,
    pub compression: CompressionType,
    /// Maximum children of one metadata index node
    pub max_degree_of_index_node: usize,
    /// Target false positive rate of the series bloom filter
    pub bloom_filter_error_rate: f64,
}

impl Default for TsFileConfig {
    fn default() -> Self {
        Self {
            page_size_bytes: 64 * 1024,
            max_points_per_page: 1024 * 1024,
            compression: CompressionType::Lz4,
            max_degree_of_index_node: 256,
            bloom_filter_error_rate: 0.05,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Path levels below the root that name a storage group
    pub storage_group_level: usize,
    /// Width of a time partition in milliseconds
    pub partition_interval: i64,
    /// Estimated MemTable size that triggers a flush (bytes)
    pub memtable_size_threshold: usize,
    /// Maximum MemTables alive at once
    pub memtable_pool_capacity: usize,
    /// File size at which an open file is closed (bytes)
    pub tsfile_size_threshold: u64,
    /// Period of the "still waiting" log line of a blocked pool acquire
    pub pool_wait_log_interval_ms: u64,
    pub time_index_level: TimeIndexLevel,
    pub enable_metadata_cache: bool,
    /// Entries kept by each metadata cache
    pub metadata_cache_capacity: usize,
    pub flush: FlushConfig,
    pub compaction: CompactionConfig,
    pub tsfile: TsFileConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            storage_group_level: 1,
            partition_interval: 604_800_000,
            memtable_size_threshold: 64 * 1024 * 1024,
            memtable_pool_capacity: 16,
            tsfile_size_threshold: 512 * 1024 * 1024,
            pool_wait_log_interval_ms: 2_000,
            time_index_level: TimeIndexLevel::Device,
            enable_metadata_cache: true,
            metadata_cache_capacity: 10_000,
            flush: FlushConfig::default(),
            compaction: CompactionConfig::default(),
            tsfile: TsFileConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Default configuration rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a (possibly partial) configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn pool_wait_log_interval(&self) -> Duration {
        Duration::from_millis(self.pool_wait_log_interval_ms.max(1))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("memtable_pool_capacity", self.memtable_pool_capacity),
            ("flush.flush_thread_count", self.flush.flush_thread_count),
            (
                "flush.encoding_task_queue_size_for_flushing",
                self.flush.encoding_task_queue_size_for_flushing,
            ),
            (
                "flush.io_task_queue_size_for_flushing",
                self.flush.io_task_queue_size_for_flushing,
            ),
            (
                "flush.chunk_buffer_pool_capacity",
                self.flush.chunk_buffer_pool_capacity,
            ),
            (
                "compaction.concurrent_compaction_thread",
                self.compaction.concurrent_compaction_thread,
            ),
            (
                "compaction.max_open_file_num_in_cross_space_compaction",
                self.compaction.max_open_file_num_in_cross_space_compaction,
            ),
            ("tsfile.max_points_per_page", self.tsfile.max_points_per_page),
            ("tsfile.page_size_bytes", self.tsfile.page_size_bytes),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(StrataError::Config(format!("{} must be positive", name)));
            }
        }

        if self.partition_interval <= 0 {
            return Err(StrataError::Config(
                "partition_interval must be positive".into(),
            ));
        }
        if self.tsfile.max_degree_of_index_node < 2 {
            return Err(StrataError::Config(
                "tsfile.max_degree_of_index_node must be at least 2".into(),
            ));
        }
        if !(self.tsfile.bloom_filter_error_rate > 0.0 && self.tsfile.bloom_filter_error_rate < 1.0)
        {
            return Err(StrataError::Config(
                "tsfile.bloom_filter_error_rate must be in (0, 1)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("strata.json");
        std::fs::write(
            &path,
            r#"{
                "memtable_pool_capacity": 4,
                "compaction": {
                    "compaction_priority": "CROSS_INNER",
                    "merge_file_strategy": "MAX_FILE_NUM"
                },
                "tsfile": { "compression": "UNCOMPRESSED" }
            }"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.memtable_pool_capacity, 4);
        assert_eq!(
            config.compaction.compaction_priority,
            CompactionPriority::CrossInner
        );
        assert_eq!(
            config.compaction.merge_file_strategy,
            MergeFileStrategy::MaxFileNum
        );
        assert_eq!(config.tsfile.compression, CompressionType::Uncompressed);
        assert_eq!(config.flush.flush_thread_count, 2);
        assert_eq!(config.compaction.time_lower_bound(), i64::MIN);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.flush.io_task_queue_size_for_flushing = 0;
        assert!(matches!(config.validate(), Err(StrataError::Config(_))));

        let mut config = EngineConfig::default();
        config.partition_interval = 0;
        assert!(config.validate().is_err());

        assert!(EngineConfig::default().validate().is_ok());
    }
}
