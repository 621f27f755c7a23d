//! Shared engine resources
//!
//! Everything that would otherwise be a process-wide singleton (pools,
//! worker pools, caches, the reject-write flag) lives in one
//! [`ResourceContext`] built by the engine and handed to its components.

use crate::cache::MetadataCaches;
use crate::compaction::{CompactionContext, CompactionTaskManager};
use crate::config::EngineConfig;
use crate::flush::{FlushManager, LexicographicOrder, MeasurementOrder};
use crate::memtable::MemTable;
use crate::pool::BufferPool;
use crate::tsfile::ChunkWriter;
use crate::{Result, TsDataType};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub struct ResourceContext {
    config: EngineConfig,
    memtable_pool: BufferPool<MemTable>,
    chunk_pool: Option<BufferPool<ChunkWriter>>,
    flush_manager: FlushManager,
    task_manager: Arc<CompactionTaskManager>,
    caches: Arc<MetadataCaches>,
    reject_write: Arc<AtomicBool>,
    next_version: AtomicU64,
    measurement_order: Box<dyn MeasurementOrder>,
}

impl ResourceContext {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_measurement_order(config, Box::new(LexicographicOrder))
    }

    /// Build the context, validating `config` first
    pub fn with_measurement_order(
        config: EngineConfig,
        measurement_order: Box<dyn MeasurementOrder>,
    ) -> Result<Self> {
        config.validate()?;

        let memtable_threshold = config.memtable_size_threshold;
        let memtable_pool = BufferPool::new(
            "MemTable",
            config.memtable_pool_capacity,
            config.pool_wait_log_interval(),
            move || MemTable::new(memtable_threshold),
        );

        let chunk_pool = config.flush.enable_chunk_buffer_pooling.then(|| {
            let tsfile_config = config.tsfile.clone();
            BufferPool::new(
                "chunk buffer",
                config.flush.chunk_buffer_pool_capacity,
                config.pool_wait_log_interval(),
                move || ChunkWriter::new("", TsDataType::Boolean, &tsfile_config),
            )
        });

        let reject_write = Arc::new(AtomicBool::new(false));
        let flush_manager = FlushManager::new(
            config.flush.flush_thread_count,
            Arc::clone(&reject_write),
        );
        let task_manager = Arc::new(CompactionTaskManager::new(
            config.compaction.concurrent_compaction_thread,
        ));
        let caches = Arc::new(MetadataCaches::new(
            config.enable_metadata_cache,
            config.metadata_cache_capacity,
        ));

        Ok(Self {
            config,
            memtable_pool,
            chunk_pool,
            flush_manager,
            task_manager,
            caches,
            reject_write,
            next_version: AtomicU64::new(1),
            measurement_order,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Take a MemTable from the pool, blocking while the pool is exhausted
    pub fn acquire_memtable(&self) -> MemTable {
        self.prepare_memtable(self.memtable_pool.acquire())
    }

    /// Take a MemTable only if one is idle or may still be created
    pub fn try_acquire_memtable(&self) -> Option<MemTable> {
        self.memtable_pool
            .try_acquire()
            .map(|memtable| self.prepare_memtable(memtable))
    }

    fn prepare_memtable(&self, mut memtable: MemTable) -> MemTable {
        memtable.set_size_threshold(self.config.memtable_size_threshold);
        memtable.set_version(self.next_version());
        memtable
    }

    pub fn release_memtable(&self, memtable: MemTable) {
        self.memtable_pool.release(memtable);
    }

    /// Account for a MemTable that could not be handed back
    pub fn forget_memtable(&self) {
        self.memtable_pool.forget();
    }

    pub fn memtable_pool(&self) -> &BufferPool<MemTable> {
        &self.memtable_pool
    }

    pub fn chunk_pool(&self) -> Option<&BufferPool<ChunkWriter>> {
        self.chunk_pool.as_ref()
    }

    pub fn flush_manager(&self) -> &FlushManager {
        &self.flush_manager
    }

    pub fn task_manager(&self) -> &Arc<CompactionTaskManager> {
        &self.task_manager
    }

    pub fn caches(&self) -> &Arc<MetadataCaches> {
        &self.caches
    }

    pub fn measurement_order(&self) -> &dyn MeasurementOrder {
        self.measurement_order.as_ref()
    }

    /// Next MemTable or file version
    pub fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::AcqRel)
    }

    /// Make sure versions handed out later exceed `version`
    pub fn observe_version(&self, version: u64) {
        self.next_version.fetch_max(version + 1, Ordering::AcqRel);
    }

    pub fn is_write_rejected(&self) -> bool {
        self.reject_write.load(Ordering::Acquire)
    }

    pub fn compaction_context(&self) -> CompactionContext {
        CompactionContext {
            tsfile_config: self.config.tsfile.clone(),
            partition_interval: self.config.partition_interval,
            time_index_level: self.config.time_index_level,
            caches: Arc::clone(&self.caches),
        }
    }

    /// Stop the worker pools; queued work finishes first
    pub fn shutdown(&self) {
        self.flush_manager.shutdown();
        self.task_manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memtables_get_increasing_versions() {
        let mut config = EngineConfig::default();
        config.memtable_size_threshold = 1234;
        let context = ResourceContext::new(config).unwrap();

        let a = context.acquire_memtable();
        let b = context.acquire_memtable();
        assert!(b.version() > a.version());
        context.observe_version(100);
        assert!(context.acquire_memtable().version() > 100);
        assert_eq!(context.memtable_pool().stats().created, 3);

        context.release_memtable(a);
        assert_eq!(context.memtable_pool().stats().idle, 1);
        context.shutdown();
    }

    #[test]
    fn test_try_acquire_memtable_respects_capacity() {
        let mut config = EngineConfig::default();
        config.memtable_pool_capacity = 1;
        let context = ResourceContext::new(config).unwrap();

        let held = context.try_acquire_memtable().unwrap();
        assert!(context.try_acquire_memtable().is_none());
        let version = held.version();
        context.release_memtable(held);
        let again = context.try_acquire_memtable().unwrap();
        assert!(again.version() > version);
        assert!(again.is_empty());
        context.shutdown();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.flush.flush_thread_count = 0;
        assert!(ResourceContext::new(config).is_err());
    }

    #[test]
    fn test_chunk_pool_follows_config() {
        let mut config = EngineConfig::default();
        config.flush.enable_chunk_buffer_pooling = false;
        let context = ResourceContext::new(config).unwrap();
        assert!(context.chunk_pool().is_none());
        assert!(!context.is_write_rejected());
    }
}
