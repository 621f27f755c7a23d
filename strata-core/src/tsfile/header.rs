//! Chunk, page and chunk-group headers

use super::{
    ensure, get_i32, get_i64, get_string, get_u8, marker, put_string, string_size, Statistics,
};
use crate::{CompressionType, Result, TsDataType, TsEncoding};
use bytes::{Buf, BufMut};

/// Header preceding the pages of a chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
    pub measurement_id: String,
    /// Size of all pages of the chunk in bytes
    pub data_size: i32,
    pub data_type: TsDataType,
    pub compression: CompressionType,
    pub encoding: TsEncoding,
    pub num_pages: i32,
}

impl ChunkHeader {
    /// Serialized size including the marker byte
    pub fn serialized_size(&self) -> usize {
        1 + string_size(&self.measurement_id) + 4 + 3 + 4
    }

    /// Write the marker and the header
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(marker::CHUNK_HEADER);
        put_string(buf, &self.measurement_id);
        buf.put_i32(self.data_size);
        buf.put_u8(self.data_type as u8);
        buf.put_u8(self.compression as u8);
        buf.put_u8(self.encoding as u8);
        buf.put_i32(self.num_pages);
    }

    /// Read a header whose marker was already consumed
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let measurement_id = get_string(buf)?;
        let data_size = get_i32(buf)?;
        let data_type = TsDataType::try_from(get_u8(buf)?)?;
        let compression = CompressionType::try_from(get_u8(buf)?)?;
        let encoding = TsEncoding::try_from(get_u8(buf)?)?;
        let num_pages = get_i32(buf)?;
        Ok(Self {
            measurement_id,
            data_size,
            data_type,
            compression,
            encoding,
            num_pages,
        })
    }
}

/// Header preceding the (possibly compressed) bytes of a page
#[derive(Debug, Clone, PartialEq)]
pub struct PageHeader {
    pub uncompressed_size: i32,
    pub compressed_size: i32,
    pub statistics: Statistics,
    /// CRC32 of the compressed page bytes
    pub crc: u32,
}

impl PageHeader {
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.uncompressed_size);
        buf.put_i32(self.compressed_size);
        self.statistics.serialize(buf);
        buf.put_u32(self.crc);
    }

    pub fn deserialize<B: Buf>(buf: &mut B, data_type: TsDataType) -> Result<Self> {
        let uncompressed_size = get_i32(buf)?;
        let compressed_size = get_i32(buf)?;
        let statistics = Statistics::deserialize(buf, data_type)?;
        ensure(buf, 4)?;
        let crc = buf.get_u32();
        Ok(Self {
            uncompressed_size,
            compressed_size,
            statistics,
            crc,
        })
    }
}

/// Footer closing a chunk group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkGroupFooter {
    pub device_id: String,
    /// Bytes of all chunks of the group
    pub data_size: i64,
    pub number_of_chunks: i32,
}

impl ChunkGroupFooter {
    /// Write the marker and the footer
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(marker::CHUNK_GROUP_FOOTER);
        put_string(buf, &self.device_id);
        buf.put_i64(self.data_size);
        buf.put_i32(self.number_of_chunks);
    }

    /// Read a footer whose marker was already consumed
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        Ok(Self {
            device_id: get_string(buf)?,
            data_size: get_i64(buf)?,
            number_of_chunks: get_i32(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_header_size_matches_bytes() {
        let header = ChunkHeader {
            measurement_id: "s0".into(),
            data_size: 128,
            data_type: TsDataType::Int64,
            compression: CompressionType::Lz4,
            encoding: TsEncoding::DeltaVarint,
            num_pages: 2,
        };
        let mut buf = Vec::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), header.serialized_size());
        assert_eq!(buf[0], marker::CHUNK_HEADER);

        let restored = ChunkHeader::deserialize(&mut &buf[1..]).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_truncated_footer_is_corruption() {
        let footer = ChunkGroupFooter {
            device_id: "root.vehicle.d0".into(),
            data_size: 4096,
            number_of_chunks: 3,
        };
        let mut buf = Vec::new();
        footer.serialize(&mut buf);
        let err = ChunkGroupFooter::deserialize(&mut &buf[1..buf.len() - 2]).unwrap_err();
        assert!(err.is_corruption());
    }
}
