//! Storage group processor
//!
//! Owns the partitions of one storage group. Each point goes to the
//! sequence file of its partition when it is newer than everything of its
//! device already on its way to disk, otherwise to the unsequenced file.

use super::{ResourceContext, TsFileProcessor};
use crate::config::{MERGE_SUFFIX, TSFILE_SUFFIX};
use crate::flush::FlushTarget;
use crate::management::TsFileManagement;
use crate::memtable::MemTable;
use crate::resource::{time_partition, Deletion, TsFileName, TsFileResource};
use crate::tsfile::TsFileSequenceReader;
use crate::{Result, SeriesPath, StrataError, TimeRange, TimeValuePair, Timestamp, TsValue};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts of a query that keeps meeting files removed by compaction
const QUERY_ATTEMPTS: usize = 8;

/// Open files and routing state of one time partition
#[derive(Default)]
struct PartitionWriters {
    sequence: Option<Arc<TsFileProcessor>>,
    unsequence: Option<Arc<TsFileProcessor>>,
    /// Newest time per device buffered in the open sequence file
    latest_time: HashMap<String, Timestamp>,
    /// Newest time per device of sequence data handed to a flush
    flushed_time: HashMap<String, Timestamp>,
}

impl PartitionWriters {
    fn promote_latest_time(&mut self) {
        for (device, time) in &self.latest_time {
            let flushed = self.flushed_time.entry(device.clone()).or_insert(*time);
            *flushed = (*flushed).max(*time);
        }
    }

    fn observe_sequence_file(&mut self, resource: &TsFileResource) {
        for device in resource.devices() {
            if let Some(end) = resource.end_time(&device) {
                let flushed = self.flushed_time.entry(device.clone()).or_insert(end);
                *flushed = (*flushed).max(end);
                let latest = self.latest_time.entry(device).or_insert(end);
                *latest = (*latest).max(end);
            }
        }
    }
}

pub struct StorageGroupProcessor {
    name: String,
    dir: PathBuf,
    context: Arc<ResourceContext>,
    /// Serializes inserts and routing decisions
    writers: Mutex<BTreeMap<i64, PartitionWriters>>,
    managements: RwLock<BTreeMap<i64, Arc<TsFileManagement>>>,
    /// Processors of files that are not sealed yet, by file path
    processors: RwLock<HashMap<PathBuf, Arc<TsFileProcessor>>>,
}

impl StorageGroupProcessor {
    /// Open the storage group, loading closed files found on disk
    pub fn open(name: impl Into<String>, context: Arc<ResourceContext>) -> Result<Self> {
        let name = name.into();
        let dir = context.config().data_dir.join(&name);
        fs::create_dir_all(&dir)?;

        let group = Self {
            name,
            dir,
            context,
            writers: Mutex::new(BTreeMap::new()),
            managements: RwLock::new(BTreeMap::new()),
            processors: RwLock::new(HashMap::new()),
        };
        group.load()?;
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn partitions(&self) -> Vec<i64> {
        self.managements.read().keys().copied().collect()
    }

    pub fn management(&self, partition: i64) -> Option<Arc<TsFileManagement>> {
        self.managements.read().get(&partition).cloned()
    }

    pub fn managements(&self) -> Vec<Arc<TsFileManagement>> {
        self.managements.read().values().cloned().collect()
    }

    fn load(&self) -> Result<()> {
        let level = self.context.config().time_index_level;
        let mut loaded_files = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let partition = match entry.file_name().to_str().and_then(|n| n.parse::<i64>().ok()) {
                Some(partition) if entry.path().is_dir() => partition,
                _ => continue,
            };
            let management = self.management_or_create(partition)?;
            if management.merge_log_path().exists() {
                warn!(
                    storage_group = %self.name,
                    partition,
                    "Found the log of an unfinished merge, keeping files as they are"
                );
            }

            let mut writers = self.writers.lock();
            let part = writers.entry(partition).or_default();
            for sequence in [true, false] {
                for file in fs::read_dir(management.file_dir(sequence))? {
                    let path = file?.path();
                    let file_name = match path.file_name().and_then(|n| n.to_str()) {
                        Some(name) => name.to_string(),
                        None => continue,
                    };
                    if file_name.ends_with(MERGE_SUFFIX) {
                        warn!("Removing leftover merge output {:?}", path);
                        if let Err(e) = fs::remove_file(&path) {
                            warn!("Cannot remove {:?}: {}", path, e);
                        }
                        continue;
                    }
                    if !file_name.ends_with(TSFILE_SUFFIX) {
                        continue;
                    }

                    let resource = match TsFileResource::load(&path, sequence, level) {
                        Ok(resource) => Arc::new(resource),
                        Err(e) => {
                            warn!("Skipping unreadable file {:?}: {}", path, e);
                            continue;
                        }
                    };
                    self.context.observe_version(resource.name().version);
                    if sequence {
                        part.observe_sequence_file(&resource);
                    }
                    management.add(resource, sequence);
                    loaded_files += 1;
                }
            }
        }

        if loaded_files > 0 {
            info!(
                storage_group = %self.name,
                "Loaded {} files from {:?}",
                loaded_files,
                self.dir
            );
        }
        Ok(())
    }

    fn management_or_create(&self, partition: i64) -> Result<Arc<TsFileManagement>> {
        if let Some(management) = self.managements.read().get(&partition) {
            return Ok(Arc::clone(management));
        }
        let mut managements = self.managements.write();
        if let Some(management) = managements.get(&partition) {
            return Ok(Arc::clone(management));
        }
        let management = Arc::new(TsFileManagement::new(
            self.name.clone(),
            partition,
            self.dir.join(partition.to_string()),
            self.context.config().compaction.lock_retry_max_backoff(),
        )?);
        managements.insert(partition, Arc::clone(&management));
        debug!(storage_group = %self.name, partition, "Created partition");
        Ok(management)
    }

    fn create_processor(
        &self,
        management: &Arc<TsFileManagement>,
        sequence: bool,
    ) -> Result<Arc<TsFileProcessor>> {
        let name = TsFileName::new(Utc::now().timestamp_millis(), self.context.next_version());
        let path = management.file_dir(sequence).join(name.to_string());
        let resource = Arc::new(TsFileResource::new(
            path,
            sequence,
            self.context.config().time_index_level,
        )?);
        let processor = Arc::new(TsFileProcessor::create(
            self.name.clone(),
            Arc::clone(&resource),
            Arc::clone(&self.context),
        )?);

        let mut processors = self.processors.write();
        processors.retain(|_, p| !p.is_closed());
        processors.insert(resource.path().to_path_buf(), Arc::clone(&processor));
        management.add(resource, sequence);
        Ok(processor)
    }

    /// Insert the values of one device at `time`
    pub fn insert_record(
        &self,
        device: &str,
        time: Timestamp,
        values: &[(String, TsValue)],
    ) -> Result<()> {
        let partition = time_partition(time, self.context.config().partition_interval);
        let management = self.management_or_create(partition)?;

        // Never wait on the MemTable pool while holding `writers`: freeing a
        // MemTable of this group needs that lock.
        let mut spare: Option<MemTable> = None;
        loop {
            let mut writers = self.writers.lock();
            let part = writers.entry(partition).or_default();
            let sequence = part
                .flushed_time
                .get(device)
                .map_or(true, |flushed| time > *flushed);
            let processor = match self.processor_or_create(part, &management, sequence) {
                Ok(processor) => processor,
                Err(e) => {
                    drop(writers);
                    if let Some(memtable) = spare.take() {
                        self.context.release_memtable(memtable);
                    }
                    return Err(e);
                }
            };

            if processor.needs_memtable() {
                match spare.take() {
                    Some(memtable) => {
                        if let Some(memtable) = processor.install_memtable(memtable) {
                            self.context.release_memtable(memtable);
                        }
                    }
                    None => {
                        drop(writers);
                        spare = Some(self.acquire_memtable());
                        continue;
                    }
                }
            } else if let Some(memtable) = spare.take() {
                self.context.release_memtable(memtable);
            }

            let full = processor.insert_record(device, time, values)?;
            if sequence {
                let latest = part.latest_time.entry(device.to_string()).or_insert(time);
                *latest = (*latest).max(time);
            }
            if full {
                self.flush_full(part, &processor, sequence);
            }
            return Ok(());
        }
    }

    fn processor_or_create(
        &self,
        part: &mut PartitionWriters,
        management: &Arc<TsFileManagement>,
        sequence: bool,
    ) -> Result<Arc<TsFileProcessor>> {
        let slot = if sequence {
            &mut part.sequence
        } else {
            &mut part.unsequence
        };
        match slot {
            Some(processor) => Ok(Arc::clone(processor)),
            None => {
                let processor = self.create_processor(management, sequence)?;
                *slot = Some(Arc::clone(&processor));
                Ok(processor)
            }
        }
    }

    /// Take a MemTable for this group. When the pool is exhausted, the
    /// working MemTables of this group are queued for flushing first so the
    /// wait ends once one of them is on disk.
    fn acquire_memtable(&self) -> MemTable {
        if let Some(memtable) = self.context.try_acquire_memtable() {
            return memtable;
        }
        debug!(
            storage_group = %self.name,
            "MemTable pool exhausted, flushing working MemTables"
        );
        self.async_flush_all();
        self.context.acquire_memtable()
    }

    fn flush_full(
        &self,
        part: &mut PartitionWriters,
        processor: &Arc<TsFileProcessor>,
        sequence: bool,
    ) {
        if sequence {
            part.promote_latest_time();
        }
        processor.async_flush();
        if processor.flushed_size() >= self.context.config().tsfile_size_threshold {
            let closing = if sequence {
                part.sequence.take()
            } else {
                part.unsequence.take()
            };
            if let Some(processor) = closing {
                processor.async_close();
            }
        }
    }

    /// Delete the points of `path` inside `range` from every file
    pub fn delete(&self, path: &SeriesPath, range: TimeRange) -> Result<()> {
        for management in self.managements() {
            let _merge = management.merge_lock().write();
            let (seq, unseq) = management.fork();
            for resource in seq.iter().chain(unseq.iter()) {
                if !may_contain(resource, &path.device, &range) {
                    continue;
                }
                let processor = self.processors.read().get(resource.path()).cloned();
                match processor {
                    Some(processor) if !processor.is_closed() => processor.delete(path, range)?,
                    _ => resource
                        .mod_file()
                        .append(&Deletion::new(path.clone(), range, u64::MAX))?,
                }
            }
            if let Some(mods) = management.merging_modification() {
                mods.append(&Deletion::new(path.clone(), range, u64::MAX))?;
            }
        }
        info!(
            storage_group = %self.name,
            "Deleted {} in [{}, {}]",
            path,
            range.start,
            range.end
        );
        Ok(())
    }

    /// Points of `path` in `range`, time-ascending. Unsequenced data
    /// overrides sequence data, newer files override older ones.
    pub fn query(&self, path: &SeriesPath, range: TimeRange) -> Result<Vec<TimeValuePair>> {
        for _ in 0..QUERY_ATTEMPTS {
            if let Some(points) = self.try_query(path, &range)? {
                return Ok(points.into_iter().collect());
            }
            debug!("Query of {} met a compacted file, retrying", path);
        }
        Err(StrataError::IllegalState(format!(
            "Query of {} kept meeting removed files",
            path
        )))
    }

    fn try_query(
        &self,
        path: &SeriesPath,
        range: &TimeRange,
    ) -> Result<Option<BTreeMap<Timestamp, TsValue>>> {
        let mut points = BTreeMap::new();
        for management in self.managements() {
            let (seq, unseq) = management.fork();
            for resource in seq.iter().chain(unseq.iter()) {
                if !may_contain(resource, &path.device, range) {
                    continue;
                }
                let _guard = resource.lock().read();
                if resource.is_deleted() {
                    return Ok(None);
                }
                let processor = self.processors.read().get(resource.path()).cloned();
                let file_points = match processor {
                    Some(processor) => processor.query(path, *range)?,
                    None => self.read_closed_file(resource, path, range)?,
                };
                points.extend(file_points);
            }
        }
        Ok(Some(points))
    }

    fn read_closed_file(
        &self,
        resource: &TsFileResource,
        path: &SeriesPath,
        range: &TimeRange,
    ) -> Result<BTreeMap<Timestamp, TsValue>> {
        let reader = TsFileSequenceReader::open(resource.path())?;
        let chunks: Vec<_> = self
            .context
            .caches()
            .chunk_metadata(&reader, path)?
            .iter()
            .filter(|c| c.end_time() >= range.start && c.start_time() <= range.end)
            .cloned()
            .collect();
        if chunks.is_empty() {
            return Ok(BTreeMap::new());
        }
        let deletions: Vec<Deletion> = resource
            .mod_file()
            .read_all()?
            .into_iter()
            .filter(|d| &d.path == path)
            .collect();
        reader.read_chunks_filtered(&chunks, |time, offset| {
            range.contains(time) && !deletions.iter().any(|d| d.covers(path, time, offset))
        })
    }

    /// Queue every working MemTable for flushing
    pub fn async_flush_all(&self) {
        let mut writers = self.writers.lock();
        for part in writers.values_mut() {
            if let Some(processor) = &part.sequence {
                if processor.async_flush() {
                    part.promote_latest_time();
                }
            }
            if let Some(processor) = &part.unsequence {
                processor.async_flush();
            }
        }
    }

    /// True while any open file still has MemTables waiting for a flush
    pub fn is_flushing(&self) -> bool {
        self.processors
            .read()
            .values()
            .any(|p| p.flushing_count() > 0)
    }

    /// Seal the open files of `partition` and wait for them
    pub fn close_partition(&self, partition: i64) -> Result<()> {
        let closing: Vec<Arc<TsFileProcessor>> = {
            let mut writers = self.writers.lock();
            let part = match writers.get_mut(&partition) {
                Some(part) => part,
                None => return Ok(()),
            };
            part.promote_latest_time();
            part.sequence
                .take()
                .into_iter()
                .chain(part.unsequence.take())
                .collect()
        };

        for processor in &closing {
            processor.async_close();
        }
        let mut result = Ok(());
        for processor in &closing {
            if let Err(e) = processor.wait_closed() {
                warn!(
                    storage_group = %self.name,
                    partition,
                    "Closing {:?} failed: {}",
                    processor.resource().path(),
                    e
                );
                result = Err(e);
            }
        }
        self.processors.write().retain(|_, p| !p.is_closed());
        result
    }

    /// Seal every open file, including ones already closing
    pub fn close_all(&self) -> Result<()> {
        let partitions: Vec<i64> = self.writers.lock().keys().copied().collect();
        let mut result = Ok(());
        for partition in partitions {
            if let Err(e) = self.close_partition(partition) {
                result = Err(e);
            }
        }
        let closing: Vec<_> = self.processors.read().values().cloned().collect();
        for processor in closing {
            processor.async_close();
            if let Err(e) = processor.wait_closed() {
                result = Err(e);
            }
        }
        self.processors.write().retain(|_, p| !p.is_closed());
        result
    }
}

/// True if the time index of `resource` overlaps `range` for `device`
fn may_contain(resource: &TsFileResource, device: &str, range: &TimeRange) -> bool {
    match (resource.start_time(device), resource.end_time(device)) {
        (Some(start), Some(end)) => start <= range.end && end >= range.start,
        _ => false,
    }
}
