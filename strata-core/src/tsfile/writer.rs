//! Sequential TsFile writer
//!
//! The writer is a small state machine:
//!
//! ```text
//! create() ──> FileStarted ──start_chunk_group──> ChunkGroupOpen
//!                  ^  │                               │
//!                  └──┼──────end_chunk_group──────────┘
//!                     └──end_file──> Closed
//! ```
//!
//! Chunk metadata is kept in memory until [`TsFileIOWriter::end_file`]
//! builds the metadata index.

use super::metadata::{build_index_tree, IndexNodeSink};
use super::{
    marker, BloomFilter, Chunk, ChunkGroupFooter, ChunkGroupMetadata, ChunkHeader, ChunkMetadata,
    IndexEntry, MetadataIndexNode, MetadataIndexNodeType, Statistics, TimeseriesMetadata,
    TsFileMetadata,
};
use crate::config::{TsFileConfig, MAGIC_STRING, VERSION_NUMBER};
use crate::{
    CompressionType, Result, SeriesPath, StrataError, Timestamp, TsDataType, TsEncoding,
};
use bytes::BufMut;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Observable writer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    FileStarted,
    ChunkGroupOpen,
    Closed,
}

/// Snapshot taken by [`TsFileIOWriter::mark`]
#[derive(Debug, Clone, Copy)]
struct WriterMark {
    pos: u64,
    chunk_groups: usize,
    versions: usize,
    total_chunk_num: i32,
}

/// Writes chunk groups, version markers and the trailing metadata of a file
pub struct TsFileIOWriter {
    path: PathBuf,
    out: BufWriter<File>,
    pos: u64,
    can_write: bool,
    max_degree_of_index_node: usize,
    bloom_filter_error_rate: f64,

    chunk_group_metadata_list: Vec<ChunkGroupMetadata>,
    current_device: Option<String>,
    chunk_group_start: u64,
    chunk_metadata_list: Vec<ChunkMetadata>,
    current_chunk: Option<ChunkMetadata>,

    version_info: Vec<(i64, i64)>,
    total_chunk_num: i32,
    invalid_chunk_num: i32,
    mark: Option<WriterMark>,
}

impl TsFileIOWriter {
    /// Create a new file and write the head magic and version
    pub fn create(path: impl AsRef<Path>, config: &TsFileConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut writer = Self {
            path,
            out: BufWriter::with_capacity(64 * 1024, file),
            pos: 0,
            can_write: true,
            max_degree_of_index_node: config.max_degree_of_index_node,
            bloom_filter_error_rate: config.bloom_filter_error_rate,
            chunk_group_metadata_list: Vec::new(),
            current_device: None,
            chunk_group_start: 0,
            chunk_metadata_list: Vec::new(),
            current_chunk: None,
            version_info: Vec::new(),
            total_chunk_num: 0,
            invalid_chunk_num: 0,
            mark: None,
        };
        writer.write_bytes(MAGIC_STRING)?;
        writer.write_bytes(VERSION_NUMBER)?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn state(&self) -> WriterState {
        if !self.can_write {
            WriterState::Closed
        } else if self.current_device.is_some() {
            WriterState::ChunkGroupOpen
        } else {
            WriterState::FileStarted
        }
    }

    pub fn total_chunk_num(&self) -> i32 {
        self.total_chunk_num
    }

    pub fn invalid_chunk_num(&self) -> i32 {
        self.invalid_chunk_num
    }

    /// Chunk groups closed so far
    pub fn chunk_group_metadata_list(&self) -> &[ChunkGroupMetadata] {
        &self.chunk_group_metadata_list
    }

    pub fn version_info(&self) -> &[(i64, i64)] {
        &self.version_info
    }

    /// Chunk metadata of one device across every closed chunk group
    pub fn device_chunk_metadata(&self, device: &str) -> Vec<&ChunkMetadata> {
        self.chunk_group_metadata_list
            .iter()
            .filter(|group| group.device == device)
            .flat_map(|group| group.chunk_metadata.iter())
            .collect()
    }

    /// Open a chunk group for `device`
    pub fn start_chunk_group(&mut self, device: &str) -> Result<()> {
        self.check_state(WriterState::FileStarted, "start a chunk group")?;
        self.current_device = Some(device.to_string());
        self.chunk_group_start = self.pos;
        self.chunk_metadata_list.clear();
        debug!("Start chunk group {} at {}", device, self.pos);
        Ok(())
    }

    /// Write a chunk header and start recording its metadata
    #[allow(clippy::too_many_arguments)]
    pub fn start_flush_chunk(
        &mut self,
        measurement_id: &str,
        compression: CompressionType,
        data_type: TsDataType,
        encoding: TsEncoding,
        statistics: Statistics,
        data_size: i32,
        num_pages: i32,
    ) -> Result<()> {
        self.check_state(WriterState::ChunkGroupOpen, "start a chunk")?;
        if self.current_chunk.is_some() {
            return Err(StrataError::IllegalState(format!(
                "Chunk {} started before the previous chunk ended",
                measurement_id
            )));
        }

        self.current_chunk = Some(ChunkMetadata {
            measurement_id: measurement_id.to_string(),
            data_type,
            offset_of_chunk_header: self.pos,
            statistics,
        });

        let header = ChunkHeader {
            measurement_id: measurement_id.to_string(),
            data_size,
            data_type,
            compression,
            encoding,
            num_pages,
        };
        let mut buf = Vec::with_capacity(header.serialized_size());
        header.serialize(&mut buf);
        self.write_bytes(&buf)
    }

    /// Page bytes of the chunk started by [`Self::start_flush_chunk`]
    pub(crate) fn write_chunk_data(&mut self, data: &[u8]) -> Result<()> {
        if self.current_chunk.is_none() {
            return Err(StrataError::IllegalState(
                "Chunk data written outside a chunk".into(),
            ));
        }
        self.write_bytes(data)
    }

    /// Finish the current chunk
    pub fn end_current_chunk(&mut self) -> Result<()> {
        let chunk = self.current_chunk.take().ok_or_else(|| {
            StrataError::IllegalState("No chunk to end".into())
        })?;
        self.chunk_metadata_list.push(chunk);
        self.total_chunk_num += 1;
        Ok(())
    }

    /// Copy an encoded chunk from another file without decoding it
    pub fn write_chunk(&mut self, chunk: &Chunk, metadata: &ChunkMetadata) -> Result<()> {
        self.start_flush_chunk(
            &chunk.header.measurement_id,
            chunk.header.compression,
            chunk.header.data_type,
            chunk.header.encoding,
            metadata.statistics.clone(),
            chunk.header.data_size,
            chunk.header.num_pages,
        )?;
        self.write_chunk_data(&chunk.data)?;
        self.end_current_chunk()
    }

    /// Close the open chunk group; a group without chunks leaves no trace
    pub fn end_chunk_group(&mut self) -> Result<()> {
        self.check_state(WriterState::ChunkGroupOpen, "end a chunk group")?;
        if self.current_chunk.is_some() {
            return Err(StrataError::IllegalState(
                "Chunk group ended inside a chunk".into(),
            ));
        }
        let device = self.current_device.take().unwrap_or_default();

        if self.chunk_metadata_list.is_empty() {
            debug!("Chunk group {} is empty, no footer written", device);
            return Ok(());
        }

        let footer = ChunkGroupFooter {
            device_id: device.clone(),
            data_size: (self.pos - self.chunk_group_start) as i64,
            number_of_chunks: self.chunk_metadata_list.len() as i32,
        };
        let mut buf = Vec::new();
        footer.serialize(&mut buf);
        self.write_bytes(&buf)?;

        self.chunk_group_metadata_list.push(ChunkGroupMetadata {
            device,
            chunk_metadata: std::mem::take(&mut self.chunk_metadata_list),
        });
        Ok(())
    }

    /// Write a version marker and remember where it ended
    pub fn write_version(&mut self, version: i64) -> Result<()> {
        self.check_state(WriterState::FileStarted, "write a version")?;
        let mut buf = Vec::with_capacity(9);
        buf.put_u8(marker::VERSION);
        buf.put_i64(version);
        self.write_bytes(&buf)?;
        self.version_info.push((self.pos as i64, version));
        Ok(())
    }

    /// Drop chunk metadata that does not match the expected chunk start
    /// times of its series, in order. Dropped chunks stay in the data
    /// section and are counted as invalid; groups left without chunks are
    /// removed. A series missing from `chunk_start_times` loses every chunk.
    pub fn filter_chunks(&mut self, chunk_start_times: &HashMap<SeriesPath, Vec<Timestamp>>) {
        let mut next_index: HashMap<SeriesPath, usize> = HashMap::new();
        let mut invalid = 0;

        for group in &mut self.chunk_group_metadata_list {
            let device = group.device.clone();
            group.chunk_metadata.retain(|chunk| {
                let path = SeriesPath::new(device.clone(), chunk.measurement_id.clone());
                let idx = next_index.entry(path.clone()).or_insert(0);
                let valid = chunk_start_times
                    .get(&path)
                    .and_then(|times| times.get(*idx))
                    .map_or(false, |expected| *expected == chunk.start_time());
                if valid {
                    *idx += 1;
                } else {
                    invalid += 1;
                }
                valid
            });
        }

        self.chunk_group_metadata_list
            .retain(|group| !group.chunk_metadata.is_empty());
        self.invalid_chunk_num += invalid;
    }

    /// Write the metadata index, bloom filter and tail; the writer is
    /// immutable afterwards
    pub fn end_file(&mut self) -> Result<TsFileMetadata> {
        self.check_state(WriterState::FileStarted, "end the file")?;

        let meta_offset = self.pos as i64;
        self.write_bytes(&[marker::SEPARATOR])?;

        // device -> measurement -> chunks in file order
        let mut series: BTreeMap<String, BTreeMap<String, Vec<ChunkMetadata>>> = BTreeMap::new();
        for group in &self.chunk_group_metadata_list {
            let measurements = series.entry(group.device.clone()).or_default();
            for chunk in &group.chunk_metadata {
                measurements
                    .entry(chunk.measurement_id.clone())
                    .or_default()
                    .push(chunk.clone());
            }
        }

        let series_count = series.values().map(|m| m.len()).sum();
        let mut bloom_filter =
            BloomFilter::with_error_rate(series_count, self.bloom_filter_error_rate);
        let mut device_entries = Vec::with_capacity(series.len());

        for (device, measurements) in &series {
            let mut measurement_entries = Vec::with_capacity(measurements.len());
            for (measurement, chunks) in measurements {
                let data_type = chunks[0].data_type;
                if chunks.iter().any(|c| c.data_type != data_type) {
                    return Err(StrataError::IllegalState(format!(
                        "Series {}.{} has chunks of different types",
                        device, measurement
                    )));
                }

                let mut statistics = Statistics::new(data_type);
                let mut buf = Vec::new();
                for chunk in chunks {
                    statistics.merge(&chunk.statistics);
                    chunk.serialize(&mut buf);
                }
                let chunk_list_offset = self.pos as i64;
                self.write_bytes(&buf)?;

                let timeseries = TimeseriesMetadata {
                    offset_of_chunk_metadata_list: chunk_list_offset,
                    data_size_of_chunk_metadata_list: buf.len() as i32,
                    measurement_id: measurement.clone(),
                    data_type,
                    statistics,
                };
                let ts_offset = self.pos as i64;
                let mut ts_buf = Vec::new();
                timeseries.serialize(&mut ts_buf);
                self.write_bytes(&ts_buf)?;

                measurement_entries.push(IndexEntry {
                    name: measurement.clone(),
                    offset: ts_offset,
                });
                let path = SeriesPath::new(device.as_str(), measurement.as_str());
                bloom_filter.add(&path.to_string());
            }

            let end = self.pos as i64;
            let max_degree = self.max_degree_of_index_node;
            let device_root = build_index_tree(
                self,
                measurement_entries,
                MetadataIndexNodeType::LeafMeasurement,
                MetadataIndexNodeType::InternalMeasurement,
                end,
                max_degree,
            )?;
            let offset = self.write_node(&device_root)?;
            device_entries.push(IndexEntry {
                name: device.clone(),
                offset,
            });
        }

        let end = self.pos as i64;
        let max_degree = self.max_degree_of_index_node;
        let metadata_index = build_index_tree(
            self,
            device_entries,
            MetadataIndexNodeType::LeafDevice,
            MetadataIndexNodeType::InternalDevice,
            end,
            max_degree,
        )?;

        let metadata = TsFileMetadata {
            metadata_index,
            total_chunk_num: self.total_chunk_num,
            invalid_chunk_num: self.invalid_chunk_num,
            version_info: self.version_info.clone(),
            meta_offset,
            bloom_filter,
        };
        let mut buf = Vec::new();
        metadata.serialize(&mut buf);
        let metadata_size = buf.len() as i32;
        buf.put_i32(metadata_size);
        buf.put_slice(MAGIC_STRING);
        self.write_bytes(&buf)?;

        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        self.can_write = false;

        debug!(
            "Closed {:?}: {} series, {} chunks, {} bytes",
            self.path, series_count, self.total_chunk_num, self.pos
        );
        Ok(metadata)
    }

    /// Push buffered bytes to the OS so readers can see flushed chunks
    pub fn flush_buffer(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Remember the current position so a failed flush can be undone
    pub fn mark(&mut self) {
        self.mark = Some(WriterMark {
            pos: self.pos,
            chunk_groups: self.chunk_group_metadata_list.len(),
            versions: self.version_info.len(),
            total_chunk_num: self.total_chunk_num,
        });
    }

    /// Truncate the file back to the last mark and forget everything
    /// written after it
    pub fn reset_to_mark(&mut self) -> Result<()> {
        if !self.can_write {
            return Err(StrataError::IllegalState("Writer is closed".into()));
        }
        let mark = self
            .mark
            .ok_or_else(|| StrataError::IllegalState("No mark to reset to".into()))?;

        self.out.flush()?;
        self.out.get_ref().set_len(mark.pos)?;
        self.out.seek(SeekFrom::Start(mark.pos))?;
        self.pos = mark.pos;
        self.chunk_group_metadata_list.truncate(mark.chunk_groups);
        self.version_info.truncate(mark.versions);
        self.total_chunk_num = mark.total_chunk_num;
        self.current_device = None;
        self.current_chunk = None;
        self.chunk_metadata_list.clear();
        Ok(())
    }

    fn check_state(&self, expected: WriterState, action: &str) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(StrataError::IllegalState(format!(
                "Cannot {} in state {:?} of {:?}",
                action, state, self.path
            )));
        }
        Ok(())
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data)?;
        self.pos += data.len() as u64;
        Ok(())
    }
}

impl IndexNodeSink for TsFileIOWriter {
    fn write_node(&mut self, node: &MetadataIndexNode) -> Result<i64> {
        let offset = self.pos as i64;
        let mut buf = Vec::new();
        node.serialize(&mut buf);
        self.write_bytes(&buf)?;
        Ok(offset)
    }

    fn position(&self) -> i64 {
        self.pos as i64
    }
}
