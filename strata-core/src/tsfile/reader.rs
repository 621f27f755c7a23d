//! Random-access reader for closed TsFiles

use super::{
    get_i32, marker, Chunk, ChunkGroupFooter, ChunkHeader, ChunkMetadata, MetadataIndexNode,
    TimeseriesMetadata, TsFileMetadata,
};
use crate::config::{MAGIC_STRING, VERSION_NUMBER};
use crate::{Result, SeriesPath, StrataError, TimeValuePair, Timestamp, TsValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

const HEAD_SIZE: u64 = (MAGIC_STRING.len() + VERSION_NUMBER.len()) as u64;
const TAIL_SIZE: u64 = (4 + MAGIC_STRING.len()) as u64;

/// Chunk group found by a sequential scan of the data section
#[derive(Debug, Clone)]
pub struct ChunkGroupSummary {
    pub device: String,
    /// (measurement, chunk header offset) in file order
    pub chunks: Vec<(String, u64)>,
    pub data_size: i64,
}

/// Read the chunk whose header starts at `offset`
pub fn read_chunk_at<R: Read + Seek>(reader: &mut R, offset: u64) -> Result<Chunk> {
    reader.seek(SeekFrom::Start(offset))?;

    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != marker::CHUNK_HEADER {
        return Err(StrataError::Corruption(format!(
            "Expected chunk header marker at {}, found {}",
            offset, prefix[0]
        )));
    }
    let name_len = (&prefix[1..]).get_i32();
    if name_len < 0 {
        return Err(StrataError::Corruption(format!(
            "Invalid measurement length {} at {}",
            name_len, offset
        )));
    }

    let rest_len = name_len as usize + 4 + 3 + 4;
    let mut header_bytes = BytesMut::with_capacity(4 + rest_len);
    header_bytes.put_slice(&prefix[1..]);
    header_bytes.resize(4 + rest_len, 0);
    reader.read_exact(&mut header_bytes[4..])?;
    let header = ChunkHeader::deserialize(&mut header_bytes.freeze())?;

    if header.data_size < 0 {
        return Err(StrataError::Corruption(format!(
            "Invalid chunk size {} at {}",
            header.data_size, offset
        )));
    }
    let mut data = vec![0u8; header.data_size as usize];
    reader.read_exact(&mut data)?;

    Ok(Chunk {
        header,
        data: Bytes::from(data),
        offset,
    })
}

/// Reader over one closed file. The metadata section is loaded at open,
/// chunks are read on demand.
pub struct TsFileSequenceReader {
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    metadata: TsFileMetadata,
    metadata_size: u32,
    /// Bytes of `[meta_offset, file metadata start)`
    index: Bytes,
}

impl TsFileSequenceReader {
    /// Open a file and validate its head and tail
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEAD_SIZE + TAIL_SIZE {
            return Err(StrataError::Corruption(format!(
                "{:?} is too short to be a TsFile ({} bytes)",
                path, file_size
            )));
        }

        let mut head = [0u8; HEAD_SIZE as usize];
        file.read_exact(&mut head)?;
        if &head[..MAGIC_STRING.len()] != MAGIC_STRING
            || &head[MAGIC_STRING.len()..] != VERSION_NUMBER
        {
            return Err(StrataError::InvalidFormat(format!(
                "{:?} has a bad head magic",
                path
            )));
        }

        let mut tail = [0u8; TAIL_SIZE as usize];
        file.seek(SeekFrom::Start(file_size - TAIL_SIZE))?;
        file.read_exact(&mut tail)?;
        if &tail[4..] != MAGIC_STRING {
            return Err(StrataError::InvalidFormat(format!(
                "{:?} is incomplete: tail magic missing",
                path
            )));
        }
        let metadata_size = (&tail[..4]).get_i32();
        if metadata_size < 0 || metadata_size as u64 > file_size - HEAD_SIZE - TAIL_SIZE {
            return Err(StrataError::Corruption(format!(
                "{:?} has an invalid metadata size {}",
                path, metadata_size
            )));
        }

        let metadata_start = file_size - TAIL_SIZE - metadata_size as u64;
        let mut metadata_bytes = vec![0u8; metadata_size as usize];
        file.seek(SeekFrom::Start(metadata_start))?;
        file.read_exact(&mut metadata_bytes)?;
        let metadata = TsFileMetadata::deserialize(&mut metadata_bytes.as_slice())?;

        if metadata.meta_offset < HEAD_SIZE as i64 || metadata.meta_offset as u64 > metadata_start {
            return Err(StrataError::Corruption(format!(
                "{:?} has an invalid metadata offset {}",
                path, metadata.meta_offset
            )));
        }
        let mut index = vec![0u8; (metadata_start - metadata.meta_offset as u64) as usize];
        file.seek(SeekFrom::Start(metadata.meta_offset as u64))?;
        file.read_exact(&mut index)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            file_size,
            metadata,
            metadata_size: metadata_size as u32,
            index: Bytes::from(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn metadata(&self) -> &TsFileMetadata {
        &self.metadata
    }

    /// Size of the serialized file metadata
    pub fn metadata_size(&self) -> u32 {
        self.metadata_size
    }

    /// Devices in the file, sorted
    pub fn devices(&self) -> Result<Vec<String>> {
        let mut devices = Vec::new();
        self.collect_leaf_entries(&self.metadata.metadata_index, &mut |entry_name, _| {
            devices.push(entry_name.to_string());
            Ok(())
        })?;
        Ok(devices)
    }

    /// Series metadata of `path`, if the file holds it
    pub fn timeseries_metadata(&self, path: &SeriesPath) -> Result<Option<TimeseriesMetadata>> {
        if !self.metadata.bloom_filter.may_contain(&path.to_string()) {
            return Ok(None);
        }
        let device_root = match self.device_root(&path.device)? {
            Some(node) => node,
            None => return Ok(None),
        };
        match self.descend(device_root, &path.measurement)? {
            Some(offset) => Ok(Some(self.timeseries_at(offset)?)),
            None => Ok(None),
        }
    }

    /// Series metadata of every series of `device`, sorted by measurement
    pub fn device_timeseries_metadata(&self, device: &str) -> Result<Vec<TimeseriesMetadata>> {
        let device_root = match self.device_root(device)? {
            Some(node) => node,
            None => return Ok(Vec::new()),
        };
        let mut offsets = Vec::new();
        self.collect_leaf_entries(&device_root, &mut |_, offset| {
            offsets.push(offset);
            Ok(())
        })?;
        offsets
            .into_iter()
            .map(|offset| self.timeseries_at(offset))
            .collect()
    }

    /// Every series in the file with its metadata
    pub fn all_timeseries_metadata(&self) -> Result<Vec<(SeriesPath, TimeseriesMetadata)>> {
        let mut result = Vec::new();
        for device in self.devices()? {
            for timeseries in self.device_timeseries_metadata(&device)? {
                let path = SeriesPath::new(device.as_str(), timeseries.measurement_id.as_str());
                result.push((path, timeseries));
            }
        }
        Ok(result)
    }

    /// Chunk metadata of `path` in file order
    pub fn chunk_metadata_list(&self, path: &SeriesPath) -> Result<Vec<ChunkMetadata>> {
        match self.timeseries_metadata(path)? {
            Some(timeseries) => self.chunk_metadata_of(&timeseries),
            None => Ok(Vec::new()),
        }
    }

    /// Chunk metadata of every series of `device`, keyed by measurement
    pub fn device_chunk_metadata(
        &self,
        device: &str,
    ) -> Result<BTreeMap<String, Vec<ChunkMetadata>>> {
        let mut result = BTreeMap::new();
        for timeseries in self.device_timeseries_metadata(device)? {
            let chunks = self.chunk_metadata_of(&timeseries)?;
            result.insert(timeseries.measurement_id, chunks);
        }
        Ok(result)
    }

    /// Start and end time of every device
    pub fn device_time_ranges(&self) -> Result<BTreeMap<String, (Timestamp, Timestamp)>> {
        let mut ranges: BTreeMap<String, (Timestamp, Timestamp)> = BTreeMap::new();
        for (path, timeseries) in self.all_timeseries_metadata()? {
            if timeseries.statistics.is_empty() {
                continue;
            }
            let (start, end) = (
                timeseries.statistics.start_time(),
                timeseries.statistics.end_time(),
            );
            ranges
                .entry(path.device)
                .and_modify(|range| {
                    range.0 = range.0.min(start);
                    range.1 = range.1.max(end);
                })
                .or_insert((start, end));
        }
        Ok(ranges)
    }

    /// Largest point count of any series
    pub fn max_series_point_count(&self) -> Result<u64> {
        Ok(self
            .all_timeseries_metadata()?
            .iter()
            .map(|(_, timeseries)| timeseries.statistics.count())
            .max()
            .unwrap_or(0))
    }

    /// Read the chunk whose header starts at `offset`
    pub fn read_chunk(&self, offset: u64) -> Result<Chunk> {
        let mut file = self.file.lock();
        read_chunk_at(&mut *file, offset)
    }

    /// Decode every point of `path`. Chunks later in the file override
    /// earlier ones at equal timestamps.
    pub fn read_series(&self, path: &SeriesPath) -> Result<Vec<TimeValuePair>> {
        let points = self.read_series_filtered(path, |_, _| true)?;
        Ok(points.into_iter().collect())
    }

    /// Points of `path` for which `keep(time, chunk_offset)` holds, later
    /// chunks overriding earlier ones
    pub fn read_series_filtered(
        &self,
        path: &SeriesPath,
        keep: impl Fn(Timestamp, u64) -> bool,
    ) -> Result<BTreeMap<Timestamp, TsValue>> {
        let chunks = self.chunk_metadata_list(path)?;
        self.read_chunks_filtered(&chunks, keep)
    }

    /// Decode the given chunks in order, keeping points that pass `keep`
    pub fn read_chunks_filtered(
        &self,
        chunks: &[ChunkMetadata],
        keep: impl Fn(Timestamp, u64) -> bool,
    ) -> Result<BTreeMap<Timestamp, TsValue>> {
        let mut points = BTreeMap::new();
        for chunk_metadata in chunks {
            let offset = chunk_metadata.offset_of_chunk_header;
            let chunk = self.read_chunk(offset)?;
            for (time, value) in chunk.decode()? {
                if keep(time, offset) {
                    points.insert(time, value);
                }
            }
        }
        Ok(points)
    }

    /// Walk the data section and list its chunk groups
    pub fn scan_chunk_groups(&self) -> Result<Vec<ChunkGroupSummary>> {
        let file = self.file.lock().try_clone()?;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(HEAD_SIZE))?;

        let end = self.metadata.meta_offset as u64;
        let mut pos = HEAD_SIZE;
        let mut groups = Vec::new();
        let mut pending = Vec::new();

        while pos < end {
            let mut marker_byte = [0u8; 1];
            reader.read_exact(&mut marker_byte)?;
            match marker_byte[0] {
                marker::CHUNK_HEADER => {
                    let chunk = read_chunk_at(&mut reader, pos)?;
                    pending.push((chunk.header.measurement_id.clone(), pos));
                    pos += chunk.header.serialized_size() as u64 + chunk.data.len() as u64;
                    // read_chunk_at seeks, so the reader stays aligned
                }
                marker::CHUNK_GROUP_FOOTER => {
                    let footer = read_footer(&mut reader)?;
                    pos += 1 + footer_size(&footer);
                    groups.push(ChunkGroupSummary {
                        device: footer.device_id,
                        chunks: std::mem::take(&mut pending),
                        data_size: footer.data_size,
                    });
                }
                marker::VERSION => {
                    let mut version = [0u8; 8];
                    reader.read_exact(&mut version)?;
                    pos += 9;
                }
                marker::SEPARATOR => break,
                other => {
                    return Err(StrataError::Corruption(format!(
                        "Unknown marker {} at {} in {:?}",
                        other, pos, self.path
                    )));
                }
            }
        }

        if !pending.is_empty() {
            return Err(StrataError::Corruption(format!(
                "{:?} ends with {} chunks outside a chunk group",
                self.path,
                pending.len()
            )));
        }
        Ok(groups)
    }

    fn chunk_metadata_of(&self, timeseries: &TimeseriesMetadata) -> Result<Vec<ChunkMetadata>> {
        let start = self.index_offset(timeseries.offset_of_chunk_metadata_list)?;
        let size = timeseries.data_size_of_chunk_metadata_list.max(0) as usize;
        if start + size > self.index.len() {
            return Err(StrataError::Corruption(format!(
                "Chunk metadata of {} exceeds the index of {:?}",
                timeseries.measurement_id, self.path
            )));
        }
        let mut buf = self.index.slice(start..start + size);
        let mut chunks = Vec::new();
        while buf.has_remaining() {
            chunks.push(ChunkMetadata::deserialize(
                &mut buf,
                &timeseries.measurement_id,
                timeseries.data_type,
            )?);
        }
        Ok(chunks)
    }

    fn device_root(&self, device: &str) -> Result<Option<MetadataIndexNode>> {
        let root = self.metadata.metadata_index.clone();
        match self.descend(root, device)? {
            Some(offset) => Ok(Some(self.node_at(offset)?)),
            None => Ok(None),
        }
    }

    /// Follow `key` from `node` down to a leaf; returns the leaf entry offset
    fn descend(&self, mut node: MetadataIndexNode, key: &str) -> Result<Option<i64>> {
        loop {
            let offset = match node.find_child(key) {
                Some(entry) => entry.offset,
                None => return Ok(None),
            };
            if node.is_leaf() {
                return Ok(Some(offset));
            }
            node = self.node_at(offset)?;
        }
    }

    fn collect_leaf_entries(
        &self,
        node: &MetadataIndexNode,
        visit: &mut dyn FnMut(&str, i64) -> Result<()>,
    ) -> Result<()> {
        for entry in &node.children {
            if node.is_leaf() {
                visit(&entry.name, entry.offset)?;
            } else {
                let child = self.node_at(entry.offset)?;
                self.collect_leaf_entries(&child, visit)?;
            }
        }
        Ok(())
    }

    fn node_at(&self, offset: i64) -> Result<MetadataIndexNode> {
        let start = self.index_offset(offset)?;
        MetadataIndexNode::deserialize(&mut self.index.slice(start..))
    }

    fn timeseries_at(&self, offset: i64) -> Result<TimeseriesMetadata> {
        let start = self.index_offset(offset)?;
        TimeseriesMetadata::deserialize(&mut self.index.slice(start..))
    }

    fn index_offset(&self, offset: i64) -> Result<usize> {
        let relative = offset - self.metadata.meta_offset;
        if relative < 0 || relative as usize >= self.index.len() {
            return Err(StrataError::Corruption(format!(
                "Offset {} outside the index of {:?}",
                offset, self.path
            )));
        }
        Ok(relative as usize)
    }
}

fn read_footer<R: Read>(reader: &mut R) -> Result<ChunkGroupFooter> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let name_len = get_i32(&mut &len[..])?;
    if name_len < 0 {
        return Err(StrataError::Corruption(format!(
            "Invalid device length {}",
            name_len
        )));
    }
    let mut body = vec![0u8; 4 + name_len as usize + 8 + 4];
    body[..4].copy_from_slice(&len);
    reader.read_exact(&mut body[4..])?;
    ChunkGroupFooter::deserialize(&mut body.as_slice())
}

fn footer_size(footer: &ChunkGroupFooter) -> u64 {
    (4 + footer.device_id.len() + 8 + 4) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TsFileConfig;
    use crate::tsfile::{ChunkWriter, TsFileIOWriter};
    use crate::TsDataType;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(path: &Path, config: &TsFileConfig, devices: usize, measurements: usize) {
        let mut writer = TsFileIOWriter::create(path, config).unwrap();
        for d in 0..devices {
            writer.start_chunk_group(&format!("root.sg.d{:02}", d)).unwrap();
            for m in 0..measurements {
                let mut chunk =
                    ChunkWriter::new(&format!("s{:02}", m), TsDataType::Double, config);
                for t in 0..10 {
                    chunk
                        .write(t * 10 + d as i64, &TsValue::Double((t + m as i64) as f64))
                        .unwrap();
                }
                chunk.write_to_file_writer(&mut writer).unwrap();
            }
            writer.end_chunk_group().unwrap();
            writer.write_version(d as i64 + 1).unwrap();
        }
        writer.end_file().unwrap();
    }

    #[test]
    fn test_lookup_through_multi_level_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-1-0-0.tsfile");
        let config = TsFileConfig {
            max_degree_of_index_node: 3,
            ..Default::default()
        };
        write_file(&path, &config, 7, 8);

        let reader = TsFileSequenceReader::open(&path).unwrap();
        assert_eq!(reader.devices().unwrap().len(), 7);
        assert_eq!(reader.all_timeseries_metadata().unwrap().len(), 56);
        assert_eq!(reader.metadata().version_info.len(), 7);

        let series = SeriesPath::new("root.sg.d05", "s06");
        let timeseries = reader.timeseries_metadata(&series).unwrap().unwrap();
        assert_eq!(timeseries.statistics.count(), 10);
        assert_eq!(timeseries.statistics.start_time(), 5);
        assert_eq!(timeseries.statistics.end_time(), 95);

        let points = reader.read_series(&series).unwrap();
        assert_eq!(points.len(), 10);
        assert_eq!(points[0], (5, TsValue::Double(6.0)));

        assert!(reader
            .timeseries_metadata(&SeriesPath::new("root.sg.d05", "s99"))
            .unwrap()
            .is_none());
        assert!(reader
            .timeseries_metadata(&SeriesPath::new("root.sg.x", "s00"))
            .unwrap()
            .is_none());

        let ranges = reader.device_time_ranges().unwrap();
        assert_eq!(ranges["root.sg.d03"], (3, 93));
        assert_eq!(reader.max_series_point_count().unwrap(), 10);
    }

    #[test]
    fn test_scan_chunk_groups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-1-0-0.tsfile");
        write_file(&path, &TsFileConfig::default(), 3, 2);

        let reader = TsFileSequenceReader::open(&path).unwrap();
        let groups = reader.scan_chunk_groups().unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].device, "root.sg.d01");
        assert_eq!(groups[1].chunks.len(), 2);

        let (measurement, offset) = &groups[2].chunks[1];
        let chunk = reader.read_chunk(*offset).unwrap();
        assert_eq!(&chunk.header.measurement_id, measurement);
        assert_eq!(chunk.decode().unwrap().len(), 10);

        let by_metadata = reader
            .chunk_metadata_list(&SeriesPath::new("root.sg.d02", "s01"))
            .unwrap();
        assert_eq!(by_metadata[0].offset_of_chunk_header, *offset);
    }

    #[test]
    fn test_incomplete_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1-1-0-0.tsfile");
        {
            let mut writer = TsFileIOWriter::create(&path, &TsFileConfig::default()).unwrap();
            writer.start_chunk_group("root.sg.d0").unwrap();
            let mut chunk =
                ChunkWriter::new("s0", TsDataType::Double, &TsFileConfig::default());
            chunk.write(1, &TsValue::Double(1.0)).unwrap();
            chunk.write_to_file_writer(&mut writer).unwrap();
            writer.end_chunk_group().unwrap();
            writer.flush_buffer().unwrap();
        }
        assert!(TsFileSequenceReader::open(&path).is_err());

        let garbage = dir.path().join("2-2-0-0.tsfile");
        File::create(&garbage)
            .unwrap()
            .write_all(b"NotATsFile000000000000")
            .unwrap();
        assert!(matches!(
            TsFileSequenceReader::open(&garbage),
            Err(StrataError::InvalidFormat(_))
        ));
    }
}
