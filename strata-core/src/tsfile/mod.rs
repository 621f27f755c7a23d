//! TsFile: the immutable columnar file format
//!
//! # Layout
//!
//! ```text
//! "TsFile" "000002"                     head magic + version
//! { chunk group | version marker }*     data section
//! 0x02                                  separator
//! chunk metadata, series metadata and index nodes
//! file metadata                         index root, counters, version info, bloom filter
//! metadata size (i32) "TsFile"          tail
//! ```
//!
//! All integers are big-endian.

mod bloom;
mod chunk;
mod header;
mod metadata;
mod reader;
mod statistics;
mod writer;

pub use bloom::BloomFilter;
pub use chunk::{Chunk, ChunkWriter};
pub use header::{ChunkGroupFooter, ChunkHeader, PageHeader};
pub use metadata::{
    ChunkGroupMetadata, ChunkMetadata, IndexEntry, MetadataIndexNode, MetadataIndexNodeType,
    TimeseriesMetadata, TsFileMetadata,
};
pub use reader::{read_chunk_at, ChunkGroupSummary, TsFileSequenceReader};
pub use statistics::Statistics;
pub use writer::{TsFileIOWriter, WriterState};

use crate::{Result, StrataError};
use bytes::{Buf, BufMut};

/// Marker bytes preceding each record of the data section
pub mod marker {
    pub const CHUNK_GROUP_FOOTER: u8 = 0;
    pub const CHUNK_HEADER: u8 = 1;
    pub const SEPARATOR: u8 = 2;
    pub const VERSION: u8 = 3;
}

/// Write a length-prefixed UTF-8 string
pub(crate) fn put_string<B: BufMut>(buf: &mut B, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

/// Read a length-prefixed UTF-8 string
pub(crate) fn get_string<B: Buf>(buf: &mut B) -> Result<String> {
    let len = get_i32(buf)?;
    if len < 0 || buf.remaining() < len as usize {
        return Err(StrataError::Corruption(format!(
            "Invalid string length {}",
            len
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|e| StrataError::Corruption(e.to_string()))
}

/// Serialized size of a string written by [`put_string`]
pub(crate) fn string_size(s: &str) -> usize {
    4 + s.len()
}

pub(crate) fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(StrataError::Corruption(format!(
            "Unexpected end of data: need {} bytes, have {}",
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8<B: Buf>(buf: &mut B) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_i32<B: Buf>(buf: &mut B) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub(crate) fn get_i64<B: Buf>(buf: &mut B) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub(crate) fn get_f64<B: Buf>(buf: &mut B) -> Result<f64> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}
