//! Write-side owner of one unclosed TsFile
//!
//! A processor buffers inserts in a working MemTable. A full MemTable is
//! queued for flushing and written by the flush workers in FIFO order.
//! Deletes reach every layer: the working MemTable is edited in place,
//! queued MemTables remember them until they are on disk, and the
//! modification file records them against chunks already flushed.

use super::ResourceContext;
use crate::flush::{FlushTarget, MemTableFlushTask};
use crate::memtable::MemTable;
use crate::resource::{Deletion, TsFileResource};
use crate::tsfile::{read_chunk_at, ChunkGroupMetadata, ChunkMetadata, TsFileIOWriter};
use crate::{Result, SeriesPath, StrataError, TimeRange, Timestamp, TsValue};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// A MemTable waiting for its flush, plus deletes issued meanwhile
struct FlushingMemTable {
    memtable: MemTable,
    pending_deletions: Mutex<Vec<(SeriesPath, TimeRange)>>,
}

impl FlushingMemTable {
    fn is_deleted(&self, path: &SeriesPath, time: Timestamp) -> bool {
        self.pending_deletions
            .lock()
            .iter()
            .any(|(p, range)| p == path && range.contains(time))
    }
}

/// In-memory state; changes together with what is visible on disk
struct Buffers {
    working: Option<MemTable>,
    flushing: VecDeque<Arc<FlushingMemTable>>,
    /// Chunk groups already durable in the file
    flushed: Vec<ChunkGroupMetadata>,
    /// End of the last completed flush
    flushed_pos: u64,
}

#[derive(Default)]
struct CloseState {
    closed: bool,
    error: Option<String>,
}

/// Buffers and flushes one sequence or unsequenced file
pub struct TsFileProcessor {
    storage_group: String,
    sequence: bool,
    resource: Arc<TsFileResource>,
    context: Arc<ResourceContext>,
    writer: Mutex<Option<TsFileIOWriter>>,
    buffers: RwLock<Buffers>,
    managed: AtomicBool,
    should_close: AtomicBool,
    failed: AtomicBool,
    close_state: Mutex<CloseState>,
    close_signal: Condvar,
}

impl TsFileProcessor {
    /// Create the file behind `resource` and get ready for inserts
    pub fn create(
        storage_group: impl Into<String>,
        resource: Arc<TsFileResource>,
        context: Arc<ResourceContext>,
    ) -> Result<Self> {
        let writer = TsFileIOWriter::create(resource.path(), &context.config().tsfile)?;
        let flushed_pos = writer.pos();
        let storage_group = storage_group.into();
        debug!(
            storage_group = %storage_group,
            "Created {} file {:?}",
            if resource.is_sequence() { "sequence" } else { "unsequenced" },
            resource.path()
        );
        Ok(Self {
            storage_group,
            sequence: resource.is_sequence(),
            resource,
            context,
            writer: Mutex::new(Some(writer)),
            buffers: RwLock::new(Buffers {
                working: None,
                flushing: VecDeque::new(),
                flushed: Vec::new(),
                flushed_pos,
            }),
            managed: AtomicBool::new(false),
            should_close: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            close_state: Mutex::new(CloseState::default()),
            close_signal: Condvar::new(),
        })
    }

    pub fn resource(&self) -> &Arc<TsFileResource> {
        &self.resource
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    /// Bytes durable in the file so far
    pub fn flushed_size(&self) -> u64 {
        self.buffers.read().flushed_pos
    }

    pub fn is_closing(&self) -> bool {
        self.should_close.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.close_state.lock().closed
    }

    /// Buffer the values of one device at `time`. Returns true once the
    /// working MemTable is full and should be flushed.
    pub fn insert_record(
        &self,
        device: &str,
        time: Timestamp,
        values: &[(String, TsValue)],
    ) -> Result<bool> {
        if self.is_closing() {
            return Err(StrataError::IllegalState(format!(
                "{:?} is closing",
                self.resource.path()
            )));
        }
        self.ensure_working_memtable();

        let mut buffers = self.buffers.write();
        let memtable = buffers.working.as_mut().ok_or_else(|| {
            StrataError::IllegalState(format!(
                "{:?} lost its working MemTable",
                self.resource.path()
            ))
        })?;
        memtable.insert_record(device, time, values)?;
        self.resource.update_time(device, time);
        Ok(memtable.is_full())
    }

    /// True when the next insert has no working MemTable to go to
    pub fn needs_memtable(&self) -> bool {
        self.buffers.read().working.is_none()
    }

    /// Use `memtable` as the working MemTable. Hands it back if there
    /// already is one.
    pub fn install_memtable(&self, memtable: MemTable) -> Option<MemTable> {
        let mut buffers = self.buffers.write();
        if buffers.working.is_some() {
            return Some(memtable);
        }
        buffers.working = Some(memtable);
        None
    }

    // The pool may block until a flush hands a MemTable back, which needs
    // the buffers lock, so acquire outside of it.
    fn ensure_working_memtable(&self) {
        if self.buffers.read().working.is_some() {
            return;
        }
        let memtable = self.context.acquire_memtable();
        if let Some(spare) = self.install_memtable(memtable) {
            self.context.release_memtable(spare);
        }
    }

    /// Delete points of `path` in `range` from every layer of this file
    pub fn delete(&self, path: &SeriesPath, range: TimeRange) -> Result<()> {
        let mut buffers = self.buffers.write();
        if let Some(memtable) = buffers.working.as_mut() {
            memtable.delete(&path.device, &path.measurement, range.start, range.end);
        }
        for entry in &buffers.flushing {
            entry.pending_deletions.lock().push((path.clone(), range));
        }
        self.resource
            .mod_file()
            .append(&Deletion::new(path.clone(), range, buffers.flushed_pos))
    }

    /// Points of `path` in `range` across the file and its MemTables;
    /// newer layers override older ones at equal timestamps
    pub fn query(
        &self,
        path: &SeriesPath,
        range: TimeRange,
    ) -> Result<BTreeMap<Timestamp, TsValue>> {
        let (chunks, flushing, working) = {
            let buffers = self.buffers.read();
            let chunks: Vec<ChunkMetadata> = buffers
                .flushed
                .iter()
                .filter(|group| group.device == path.device)
                .flat_map(|group| group.chunk_metadata.iter())
                .filter(|chunk| {
                    chunk.measurement_id == path.measurement
                        && chunk.end_time() >= range.start
                        && chunk.start_time() <= range.end
                })
                .cloned()
                .collect();
            let flushing: Vec<_> = buffers.flushing.iter().cloned().collect();
            let working = buffers
                .working
                .as_ref()
                .map(|m| m.query(&path.device, &path.measurement, &range))
                .unwrap_or_default();
            (chunks, flushing, working)
        };

        let mut points = BTreeMap::new();
        if !chunks.is_empty() {
            let deletions: Vec<Deletion> = self
                .resource
                .mod_file()
                .read_all()?
                .into_iter()
                .filter(|d| &d.path == path)
                .collect();
            let mut file = BufReader::new(File::open(self.resource.path())?);
            for chunk_metadata in &chunks {
                let offset = chunk_metadata.offset_of_chunk_header;
                let chunk = read_chunk_at(&mut file, offset)?;
                for (time, value) in chunk.decode()? {
                    let deleted = deletions.iter().any(|d| d.covers(path, time, offset));
                    if range.contains(time) && !deleted {
                        points.insert(time, value);
                    }
                }
            }
        }

        for entry in &flushing {
            for (time, value) in entry.memtable.query(&path.device, &path.measurement, &range) {
                if !entry.is_deleted(path, time) {
                    points.insert(time, value);
                }
            }
        }
        points.extend(working);
        Ok(points)
    }

    /// Queue the working MemTable for flushing. Returns false if there was
    /// nothing to flush.
    pub fn async_flush(self: &Arc<Self>) -> bool {
        let queued = {
            let mut buffers = self.buffers.write();
            match buffers.working.take() {
                Some(mut memtable) if !memtable.is_empty() => {
                    memtable.mark_closed();
                    buffers.flushing.push_back(Arc::new(FlushingMemTable {
                        memtable,
                        pending_deletions: Mutex::new(Vec::new()),
                    }));
                    true
                }
                Some(memtable) => {
                    drop(buffers);
                    self.context.release_memtable(memtable);
                    false
                }
                None => false,
            }
        };
        if queued {
            let target: Arc<dyn FlushTarget> = Arc::clone(self) as Arc<dyn FlushTarget>;
            self.context.flush_manager().submit(target);
        }
        queued
    }

    /// Stop accepting inserts, flush what is buffered, then seal the file
    pub fn async_close(self: &Arc<Self>) {
        if self.should_close.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            storage_group = %self.storage_group,
            "Closing {:?}",
            self.resource.path()
        );
        self.async_flush();
        if self.failed.load(Ordering::Acquire) {
            self.finish_close(Err(StrataError::Flush(format!(
                "{:?} has a failed flush",
                self.resource.path()
            ))));
            return;
        }
        if let Err(e) = self.end_file_if_drained() {
            error!("Cannot seal {:?}: {}", self.resource.path(), e);
        }
    }

    /// Close and wait until the file is sealed
    pub fn sync_close(self: &Arc<Self>) -> Result<()> {
        self.async_close();
        self.wait_closed()
    }

    /// Wait for a close already in progress
    pub fn wait_closed(&self) -> Result<()> {
        let mut state = self.close_state.lock();
        while !state.closed {
            if self.failed.load(Ordering::Acquire) {
                return Err(StrataError::Flush(format!(
                    "{:?} has a failed flush",
                    self.resource.path()
                )));
            }
            self.close_signal
                .wait_for(&mut state, Duration::from_millis(100));
        }
        match &state.error {
            Some(e) => Err(StrataError::Flush(e.clone())),
            None => Ok(()),
        }
    }

    /// Seal the file once closing was requested and no MemTable is left
    fn end_file_if_drained(&self) -> Result<()> {
        if !self.is_closing() || !self.buffers.read().flushing.is_empty() {
            return Ok(());
        }
        let mut writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None => return Ok(()),
        };
        let result = writer
            .end_file()
            .and_then(|_| self.resource.close(self.context.config().partition_interval));
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(StrataError::Flush(e.to_string())),
        };
        self.finish_close(outcome);
        result
    }

    fn finish_close(&self, result: Result<()>) {
        let mut state = self.close_state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        match result {
            Ok(()) => info!(
                storage_group = %self.storage_group,
                "Closed {:?}",
                self.resource.path()
            ),
            Err(e) => state.error = Some(e.to_string()),
        }
        self.close_signal.notify_all();
    }
}

impl FlushTarget for TsFileProcessor {
    fn name(&self) -> String {
        format!("{:?}", self.resource.path())
    }

    fn flushing_count(&self) -> usize {
        self.buffers.read().flushing.len()
    }

    fn flush_one(&self) -> Result<()> {
        let entry = match self.buffers.read().flushing.front() {
            Some(entry) => Arc::clone(entry),
            None => return Ok(()),
        };

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or_else(|| {
            StrataError::IllegalState(format!("{:?} is already sealed", self.resource.path()))
        })?;

        let config = self.context.config();
        let mut task = MemTableFlushTask::new(
            &entry.memtable,
            writer,
            self.context.measurement_order(),
            &config.flush,
            &config.tsfile,
            &self.storage_group,
        );
        if let Some(pool) = self.context.chunk_pool() {
            task = task.with_chunk_pool(pool);
        }
        if let Err(e) = task.sync_flush() {
            self.failed.store(true, Ordering::Release);
            self.close_signal.notify_all();
            return Err(e);
        }

        {
            let mut buffers = self.buffers.write();
            let known = buffers.flushed.len();
            buffers
                .flushed
                .extend_from_slice(&writer.chunk_group_metadata_list()[known..]);
            buffers.flushed_pos = writer.pos();
            buffers.flushing.pop_front();

            let deletions: Vec<Deletion> = entry
                .pending_deletions
                .lock()
                .iter()
                .map(|(path, range)| Deletion::new(path.clone(), *range, buffers.flushed_pos))
                .collect();
            if !deletions.is_empty() {
                self.resource.mod_file().append_all(&deletions)?;
            }
        }
        drop(guard);

        match Arc::try_unwrap(entry) {
            Ok(flushed) => self.context.release_memtable(flushed.memtable),
            // A query still reads it; it is freed when that query ends
            Err(_) => self.context.forget_memtable(),
        }

        self.end_file_if_drained()
    }

    fn managed(&self) -> &AtomicBool {
        &self.managed
    }
}
