//! Two-stage flush of one MemTable
//!
//! ```text
//! caller ──EncodingTask──> encoding stage ──IoTask──> I/O stage ──> writer
//! ```
//!
//! Both queues are bounded, so a slow disk throttles encoding and a slow
//! encoder throttles the caller. A failing stage raises the shared cancel
//! flag; the others stop at their next step.

use super::MeasurementOrder;
use crate::config::{FlushConfig, TsFileConfig};
use crate::memtable::{MemTable, TvList};
use crate::pool::BufferPool;
use crate::tsfile::{ChunkWriter, TsFileIOWriter};
use crate::{Result, StrataError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const POOL_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum EncodingTask {
    StartChunkGroup(String),
    Series { measurement: String, list: TvList },
    EndChunkGroup,
    End,
}

enum IoTask {
    StartChunkGroup(String),
    Chunk(ChunkWriter),
    EndChunkGroup,
    End,
}

/// Flushes one MemTable into an open file writer
pub struct MemTableFlushTask<'a> {
    memtable: &'a MemTable,
    writer: &'a mut TsFileIOWriter,
    chunk_pool: Option<&'a BufferPool<ChunkWriter>>,
    order: &'a dyn MeasurementOrder,
    flush_config: &'a FlushConfig,
    tsfile_config: &'a TsFileConfig,
    storage_group: &'a str,
}

impl<'a> MemTableFlushTask<'a> {
    pub fn new(
        memtable: &'a MemTable,
        writer: &'a mut TsFileIOWriter,
        order: &'a dyn MeasurementOrder,
        flush_config: &'a FlushConfig,
        tsfile_config: &'a TsFileConfig,
        storage_group: &'a str,
    ) -> Self {
        Self {
            memtable,
            writer,
            chunk_pool: None,
            order,
            flush_config,
            tsfile_config,
            storage_group,
        }
    }

    /// Take chunk writers from `pool` instead of allocating them
    pub fn with_chunk_pool(mut self, pool: &'a BufferPool<ChunkWriter>) -> Self {
        self.chunk_pool = Some(pool);
        self
    }

    /// Run both stages to completion. On success the MemTable version is
    /// written after its chunk groups; on failure the file is truncated
    /// back to where this flush started.
    pub fn sync_flush(self) -> Result<()> {
        let memtable = self.memtable;
        let order = self.order;
        self.run(move |encoding_tx, cancelled| produce(memtable, order, encoding_tx, cancelled))
    }

    /// Run the stages over whatever `feed` sends into the encoding queue
    fn run(self, feed: impl FnOnce(Sender<EncodingTask>, &AtomicBool)) -> Result<()> {
        let started = Instant::now();
        let version = self.memtable.version();
        info!(
            storage_group = self.storage_group,
            version,
            "Start flushing MemTable with {} points into {:?}",
            self.memtable.total_points(),
            self.writer.path()
        );

        self.writer.mark();
        let cancelled = AtomicBool::new(false);
        let (encoding_tx, encoding_rx) =
            bounded(self.flush_config.encoding_task_queue_size_for_flushing.max(1));
        let (io_tx, io_rx) = bounded(self.flush_config.io_task_queue_size_for_flushing.max(1));

        let pool = self.chunk_pool;
        let tsfile_config = self.tsfile_config;
        let writer = &mut *self.writer;
        let cancelled_ref = &cancelled;

        let (encoding_result, io_result) = thread::scope(|s| {
            let encoder = s.spawn(move || {
                let result =
                    encoding_stage(encoding_rx, io_tx, pool, tsfile_config, cancelled_ref);
                if result.is_err() {
                    cancelled_ref.store(true, Ordering::Release);
                }
                result
            });
            let io = s.spawn(move || io_stage(writer, io_rx, pool, cancelled_ref));

            feed(encoding_tx, cancelled_ref);

            let encoding_result = encoder
                .join()
                .unwrap_or_else(|_| Err(StrataError::Internal("encoding stage panicked".into())));
            let io_result = io
                .join()
                .unwrap_or_else(|_| Err(StrataError::Internal("I/O stage panicked".into())));
            (encoding_result, io_result)
        });

        let result = match (encoding_result, io_result) {
            (Ok(()), Ok(())) => self
                .writer
                .write_version(version as i64)
                .and_then(|_| self.writer.flush_buffer()),
            // The stage that failed first is the root cause; the other one
            // only reports the cancellation
            (_, Err(e)) if !matches!(e, StrataError::FlushCancelled) => Err(e),
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    storage_group = self.storage_group,
                    version,
                    "Flushed MemTable into {:?} in {}ms",
                    self.writer.path(),
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    storage_group = self.storage_group,
                    version,
                    "Flush into {:?} failed: {}",
                    self.writer.path(),
                    e
                );
                if let Err(reset_error) = self.writer.reset_to_mark() {
                    error!(
                        "Cannot truncate {:?} after a failed flush: {}",
                        self.writer.path(),
                        reset_error
                    );
                }
                Err(e)
            }
        }
    }
}

/// Feed every non-empty series of the MemTable, device by device
fn produce(
    memtable: &MemTable,
    order: &dyn MeasurementOrder,
    encoding_tx: Sender<EncodingTask>,
    cancelled: &AtomicBool,
) {
    for device in memtable.devices() {
        if cancelled.load(Ordering::Acquire) {
            return;
        }
        if encoding_tx
            .send(EncodingTask::StartChunkGroup(device.clone()))
            .is_err()
        {
            return;
        }
        for measurement in order.order(&device, memtable.measurements(&device)) {
            let list = match memtable.sorted_tvlist(&device, &measurement) {
                Some(list) if !list.is_empty() => list,
                _ => continue,
            };
            if encoding_tx
                .send(EncodingTask::Series { measurement, list })
                .is_err()
            {
                return;
            }
        }
        if encoding_tx.send(EncodingTask::EndChunkGroup).is_err() {
            return;
        }
    }
    let _ = encoding_tx.send(EncodingTask::End);
}

fn encoding_stage(
    encoding_rx: Receiver<EncodingTask>,
    io_tx: Sender<IoTask>,
    pool: Option<&BufferPool<ChunkWriter>>,
    tsfile_config: &TsFileConfig,
    cancelled: &AtomicBool,
) -> Result<()> {
    loop {
        if cancelled.load(Ordering::Acquire) {
            return Err(StrataError::FlushCancelled);
        }
        let task = encoding_rx
            .recv()
            .map_err(|_| StrataError::FlushCancelled)?;

        let io_task = match task {
            EncodingTask::StartChunkGroup(device) => IoTask::StartChunkGroup(device),
            EncodingTask::EndChunkGroup => IoTask::EndChunkGroup,
            EncodingTask::End => {
                io_tx.send(IoTask::End).map_err(|_| StrataError::FlushCancelled)?;
                return Ok(());
            }
            EncodingTask::Series { measurement, list } => {
                let mut chunk =
                    acquire_chunk_writer(pool, cancelled, tsfile_config, &measurement, &list)?;
                if let Err(e) = encode_series(&mut chunk, &list) {
                    if let Some(pool) = pool {
                        pool.release(chunk);
                    }
                    return Err(e);
                }
                IoTask::Chunk(chunk)
            }
        };

        if let Err(rejected) = io_tx.send(io_task) {
            if let (Some(pool), IoTask::Chunk(chunk)) = (pool, rejected.into_inner()) {
                pool.release(chunk);
            }
            return Err(StrataError::FlushCancelled);
        }
    }
}

fn acquire_chunk_writer(
    pool: Option<&BufferPool<ChunkWriter>>,
    cancelled: &AtomicBool,
    tsfile_config: &TsFileConfig,
    measurement: &str,
    list: &TvList,
) -> Result<ChunkWriter> {
    let pool = match pool {
        Some(pool) => pool,
        None => return Ok(ChunkWriter::new(measurement, list.data_type(), tsfile_config)),
    };
    loop {
        if let Some(mut chunk) = pool.acquire_timeout(POOL_POLL_INTERVAL) {
            chunk.reinit(measurement, list.data_type(), tsfile_config);
            return Ok(chunk);
        }
        if cancelled.load(Ordering::Acquire) {
            return Err(StrataError::FlushCancelled);
        }
    }
}

/// Encode a sorted list, skipping a point when the next one repeats its
/// timestamp so the last inserted value wins
fn encode_series(chunk: &mut ChunkWriter, list: &TvList) -> Result<()> {
    let times = list.times();
    let values = list.values();
    for i in 0..times.len() {
        if i + 1 < times.len() && times[i] == times[i + 1] {
            continue;
        }
        chunk.write(times[i], &values[i])?;
    }
    chunk.seal_current_page()
}

fn io_stage(
    writer: &mut TsFileIOWriter,
    io_rx: Receiver<IoTask>,
    pool: Option<&BufferPool<ChunkWriter>>,
    cancelled: &AtomicBool,
) -> Result<()> {
    let result = write_io_tasks(writer, &io_rx, pool);
    if result.is_err() {
        cancelled.store(true, Ordering::Release);
        // Give pooled writers back until the encoder notices
        for task in io_rx.iter() {
            if let (Some(pool), IoTask::Chunk(chunk)) = (pool, task) {
                pool.release(chunk);
            }
        }
    }
    result
}

fn write_io_tasks(
    writer: &mut TsFileIOWriter,
    io_rx: &Receiver<IoTask>,
    pool: Option<&BufferPool<ChunkWriter>>,
) -> Result<()> {
    loop {
        match io_rx.recv().map_err(|_| StrataError::FlushCancelled)? {
            IoTask::StartChunkGroup(device) => writer.start_chunk_group(&device)?,
            IoTask::Chunk(mut chunk) => {
                let written = chunk.write_to_file_writer(writer);
                if let Some(pool) = pool {
                    pool.release(chunk);
                }
                written?;
            }
            IoTask::EndChunkGroup => writer.end_chunk_group()?,
            IoTask::End => {
                debug!("I/O stage finished at {}", writer.pos());
                return Ok(());
            }
        }
    }
}
