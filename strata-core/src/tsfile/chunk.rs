//! Chunk encoding and decoding
//!
//! A chunk is a run of pages for one series. Each page holds its own
//! header (sizes, statistics, checksum) followed by the optionally
//! compressed page body:
//!
//! ```text
//! time_bytes_len (i32) | gorilla timestamps | encoded values
//! ```

use super::{ensure, get_i32, ChunkHeader, PageHeader, Statistics, TsFileIOWriter};
use crate::config::TsFileConfig;
use crate::encoding::{decode_times, decode_values, encode_times, encode_values};
use crate::pool::Poolable;
use crate::{
    CompressionType, Result, StrataError, TimeValuePair, Timestamp, TsDataType, TsEncoding,
    TsValue,
};
use bytes::{Buf, BufMut, Bytes};
use tracing::debug;

/// Accumulates points of one series into sealed pages
///
/// Instances are pooled by the flush pipeline; [`Poolable::reset`] drops
/// buffered points and [`ChunkWriter::reinit`] points the writer at a new
/// series.
#[derive(Debug)]
pub struct ChunkWriter {
    measurement_id: String,
    data_type: TsDataType,
    encoding: TsEncoding,
    compression: CompressionType,
    page_size_bytes: usize,
    max_points_per_page: usize,

    page_times: Vec<Timestamp>,
    page_values: Vec<TsValue>,
    page_statistics: Statistics,
    page_size_estimate: usize,

    sealed_pages: Vec<u8>,
    num_pages: i32,
    statistics: Statistics,
}

impl ChunkWriter {
    /// Create a writer for one series
    pub fn new(measurement_id: &str, data_type: TsDataType, config: &TsFileConfig) -> Self {
        Self {
            measurement_id: measurement_id.to_string(),
            data_type,
            encoding: data_type.default_encoding(),
            compression: config.compression,
            page_size_bytes: config.page_size_bytes,
            max_points_per_page: config.max_points_per_page,
            page_times: Vec::new(),
            page_values: Vec::new(),
            page_statistics: Statistics::new(data_type),
            page_size_estimate: 0,
            sealed_pages: Vec::new(),
            num_pages: 0,
            statistics: Statistics::new(data_type),
        }
    }

    /// Point a (pooled, reset) writer at another series, keeping its buffers
    pub fn reinit(&mut self, measurement_id: &str, data_type: TsDataType, config: &TsFileConfig) {
        self.reset();
        self.measurement_id.clear();
        self.measurement_id.push_str(measurement_id);
        self.data_type = data_type;
        self.encoding = data_type.default_encoding();
        self.compression = config.compression;
        self.page_size_bytes = config.page_size_bytes;
        self.max_points_per_page = config.max_points_per_page;
        self.page_statistics = Statistics::new(data_type);
        self.statistics = Statistics::new(data_type);
    }

    /// Override the value encoding before the first write
    pub fn with_encoding(mut self, encoding: TsEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Append one point; the page is sealed when it reaches its limits
    pub fn write(&mut self, time: Timestamp, value: &TsValue) -> Result<()> {
        if value.data_type() != self.data_type {
            return Err(StrataError::TypeMismatch {
                series: self.measurement_id.clone(),
                expected: self.data_type.to_string(),
                actual: value.data_type().to_string(),
            });
        }

        self.page_times.push(time);
        self.page_size_estimate += 8 + value.size();
        self.page_statistics.update(time, value);
        self.page_values.push(value.clone());

        if self.page_times.len() >= self.max_points_per_page
            || self.page_size_estimate >= self.page_size_bytes
        {
            self.seal_current_page()?;
        }
        Ok(())
    }

    /// Append points in order
    pub fn write_points(&mut self, points: &[TimeValuePair]) -> Result<()> {
        for (time, value) in points {
            self.write(*time, value)?;
        }
        Ok(())
    }

    /// Encode the buffered points into a page
    pub fn seal_current_page(&mut self) -> Result<()> {
        if self.page_times.is_empty() {
            return Ok(());
        }

        let times = encode_times(&self.page_times);
        let values = encode_values(&self.page_values, self.data_type, self.encoding)?;
        let mut body = Vec::with_capacity(4 + times.len() + values.len());
        body.put_i32(times.len() as i32);
        body.extend_from_slice(&times);
        body.extend_from_slice(&values);

        let compressed = match self.compression {
            CompressionType::Uncompressed => body.clone(),
            CompressionType::Lz4 => lz4_flex::compress(&body),
        };

        let page_statistics =
            std::mem::replace(&mut self.page_statistics, Statistics::new(self.data_type));
        let header = PageHeader {
            uncompressed_size: body.len() as i32,
            compressed_size: compressed.len() as i32,
            crc: crc32fast::hash(&compressed),
            statistics: page_statistics,
        };
        header.serialize(&mut self.sealed_pages);
        self.sealed_pages.extend_from_slice(&compressed);

        self.statistics.merge(&header.statistics);
        self.num_pages += 1;
        self.page_times.clear();
        self.page_values.clear();
        self.page_size_estimate = 0;
        Ok(())
    }

    /// Seal the last page and write the chunk through `writer`
    ///
    /// A writer that never received a point writes nothing.
    pub fn write_to_file_writer(&mut self, writer: &mut TsFileIOWriter) -> Result<()> {
        self.seal_current_page()?;
        if self.num_pages == 0 {
            return Ok(());
        }

        writer.start_flush_chunk(
            &self.measurement_id,
            self.compression,
            self.data_type,
            self.encoding,
            self.statistics.clone(),
            self.sealed_pages.len() as i32,
            self.num_pages,
        )?;
        writer.write_chunk_data(&self.sealed_pages)?;
        writer.end_current_chunk()?;

        debug!(
            "Wrote chunk {} with {} pages, {} points",
            self.measurement_id,
            self.num_pages,
            self.statistics.count()
        );
        Ok(())
    }

    pub fn measurement_id(&self) -> &str {
        &self.measurement_id
    }

    pub fn data_type(&self) -> TsDataType {
        self.data_type
    }

    /// Statistics of the sealed pages
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// True if no point was written since the last reset
    pub fn is_empty(&self) -> bool {
        self.num_pages == 0 && self.page_times.is_empty()
    }

    /// Bytes currently buffered
    pub fn buffered_size(&self) -> usize {
        self.sealed_pages.len() + self.page_size_estimate
    }
}

impl Poolable for ChunkWriter {
    fn reset(&mut self) {
        self.page_times.clear();
        self.page_values.clear();
        self.page_size_estimate = 0;
        self.sealed_pages.clear();
        self.num_pages = 0;
        self.page_statistics = Statistics::new(self.data_type);
        self.statistics = Statistics::new(self.data_type);
    }
}

/// A chunk read back from a file
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: ChunkHeader,
    /// Page bytes, exactly `header.data_size` long
    pub data: Bytes,
    /// Offset of the chunk header in its file
    pub offset: u64,
}

impl Chunk {
    /// Decode every page of the chunk
    pub fn decode(&self) -> Result<Vec<TimeValuePair>> {
        let mut cursor = self.data.clone();
        let mut points = Vec::new();

        for _ in 0..self.header.num_pages {
            let page_header = PageHeader::deserialize(&mut cursor, self.header.data_type)?;
            let compressed_size = page_header.compressed_size.max(0) as usize;
            ensure(&cursor, compressed_size)?;
            let compressed = cursor.split_to(compressed_size);

            let actual = crc32fast::hash(&compressed);
            if actual != page_header.crc {
                return Err(StrataError::ChecksumMismatch {
                    expected: page_header.crc,
                    actual,
                });
            }

            let body = match self.header.compression {
                CompressionType::Uncompressed => compressed,
                CompressionType::Lz4 => Bytes::from(
                    lz4_flex::decompress(&compressed, page_header.uncompressed_size.max(0) as usize)
                        .map_err(|e| StrataError::Compression(e.to_string()))?,
                ),
            };

            let count = page_header.statistics.count() as usize;
            let mut body_cursor = body.clone();
            let time_len = get_i32(&mut body_cursor)?.max(0) as usize;
            ensure(&body_cursor, time_len)?;
            let times = decode_times(&body_cursor[..time_len], count)?;
            body_cursor.advance(time_len);
            let values = decode_values(
                &body_cursor,
                self.header.data_type,
                self.header.encoding,
                count,
            )?;

            points.extend(times.into_iter().zip(values));
        }

        if cursor.has_remaining() {
            return Err(StrataError::Corruption(format!(
                "{} trailing bytes after the last page of chunk {}",
                cursor.remaining(),
                self.header.measurement_id
            )));
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pages() -> TsFileConfig {
        TsFileConfig {
            max_points_per_page: 3,
            ..Default::default()
        }
    }

    fn encode_chunk(writer: &mut ChunkWriter) -> Chunk {
        writer.seal_current_page().unwrap();
        Chunk {
            header: ChunkHeader {
                measurement_id: writer.measurement_id.clone(),
                data_size: writer.sealed_pages.len() as i32,
                data_type: writer.data_type,
                compression: writer.compression,
                encoding: writer.encoding,
                num_pages: writer.num_pages,
            },
            data: Bytes::from(writer.sealed_pages.clone()),
            offset: 0,
        }
    }

    #[test]
    fn test_pages_split_by_point_limit() {
        let mut writer = ChunkWriter::new("s0", TsDataType::Int64, &small_pages());
        for t in 0..7 {
            writer.write(t, &TsValue::Int64(t * 10)).unwrap();
        }
        let chunk = encode_chunk(&mut writer);
        assert_eq!(chunk.header.num_pages, 3);
        assert_eq!(writer.statistics().count(), 7);
        assert_eq!(writer.statistics().end_time(), 6);

        let points = chunk.decode().unwrap();
        assert_eq!(points.len(), 7);
        assert_eq!(points[6], (6, TsValue::Int64(60)));
    }

    #[test]
    fn test_uncompressed_text_chunk() {
        let config = TsFileConfig {
            compression: CompressionType::Uncompressed,
            ..Default::default()
        };
        let mut writer = ChunkWriter::new("status", TsDataType::Text, &config);
        writer.write(1, &TsValue::from("ok")).unwrap();
        writer.write(2, &TsValue::from("degraded")).unwrap();
        let chunk = encode_chunk(&mut writer);
        assert_eq!(
            chunk.decode().unwrap(),
            vec![(1, TsValue::from("ok")), (2, TsValue::from("degraded"))]
        );
    }

    #[test]
    fn test_corrupted_page_detected() {
        let mut writer = ChunkWriter::new("s0", TsDataType::Double, &TsFileConfig::default());
        for t in 0..100 {
            writer.write(t, &TsValue::Double(t as f64 * 0.5)).unwrap();
        }
        let mut chunk = encode_chunk(&mut writer);
        let mut data = chunk.data.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        chunk.data = Bytes::from(data);
        assert!(chunk.decode().unwrap_err().is_corruption());
    }

    #[test]
    fn test_type_mismatch_and_reinit() {
        let config = TsFileConfig::default();
        let mut writer = ChunkWriter::new("s0", TsDataType::Int32, &config);
        assert!(matches!(
            writer.write(1, &TsValue::Double(1.0)),
            Err(StrataError::TypeMismatch { .. })
        ));

        writer.write(1, &TsValue::Int32(5)).unwrap();
        writer.reinit("s1", TsDataType::Boolean, &config);
        assert!(writer.is_empty());
        assert_eq!(writer.measurement_id(), "s1");
        writer.write(1, &TsValue::Boolean(true)).unwrap();
        assert_eq!(encode_chunk(&mut writer).decode().unwrap().len(), 1);
    }
}
