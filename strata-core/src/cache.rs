//! Read-side metadata caches
//!
//! Series and chunk metadata of closed files, keyed by file and series.
//! Caches are cleared whenever files leave a file list, so no entry
//! outlives the file it describes.

use crate::tsfile::{ChunkMetadata, TimeseriesMetadata, TsFileSequenceReader};
use crate::{Result, SeriesPath};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type CacheKey = (PathBuf, SeriesPath);

/// Hit/miss counters of a cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded map from (file, series) to metadata
pub struct MetadataCache<V: Clone> {
    entries: RwLock<BTreeMap<CacheKey, V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

pub type TimeseriesMetadataCache = MetadataCache<Option<TimeseriesMetadata>>;
pub type ChunkMetadataCache = MetadataCache<Arc<Vec<ChunkMetadata>>>;

impl<V: Clone> MetadataCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for `(file, series)`, loading it on a miss
    pub fn get_or_load(
        &self,
        file: &Path,
        series: &SeriesPath,
        load: impl FnOnce() -> Result<V>,
    ) -> Result<V> {
        let key = (file.to_path_buf(), series.clone());
        if let Some(value) = self.entries.read().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let value = load()?;
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            // Simple eviction: remove the first key
            if let Some(first) = entries.keys().next().cloned() {
                entries.remove(&first);
            }
        }
        entries.insert(key, value.clone());
        Ok(value)
    }

    /// Drop every entry of `file`
    pub fn remove_file(&self, file: &Path) {
        self.entries.write().retain(|(path, _), _| path != file);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
        }
    }
}

/// The caches consulted by reads of closed files
pub struct MetadataCaches {
    enabled: bool,
    timeseries: TimeseriesMetadataCache,
    chunks: ChunkMetadataCache,
}

impl MetadataCaches {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            timeseries: MetadataCache::new(capacity),
            chunks: MetadataCache::new(capacity),
        }
    }

    pub fn timeseries_metadata(
        &self,
        reader: &TsFileSequenceReader,
        series: &SeriesPath,
    ) -> Result<Option<TimeseriesMetadata>> {
        if !self.enabled {
            return reader.timeseries_metadata(series);
        }
        self.timeseries
            .get_or_load(reader.path(), series, || reader.timeseries_metadata(series))
    }

    pub fn chunk_metadata(
        &self,
        reader: &TsFileSequenceReader,
        series: &SeriesPath,
    ) -> Result<Arc<Vec<ChunkMetadata>>> {
        if !self.enabled {
            return reader.chunk_metadata_list(series).map(Arc::new);
        }
        self.chunks.get_or_load(reader.path(), series, || {
            reader.chunk_metadata_list(series).map(Arc::new)
        })
    }

    pub fn remove_file(&self, file: &Path) {
        self.timeseries.remove_file(file);
        self.chunks.remove_file(file);
    }

    /// Invalidate everything; called when file lists change
    pub fn clear(&self) {
        self.timeseries.clear();
        self.chunks.clear();
    }

    pub fn chunk_stats(&self) -> CacheStats {
        self.chunks.stats()
    }

    pub fn timeseries_stats(&self) -> CacheStats {
        self.timeseries.stats()
    }
}
