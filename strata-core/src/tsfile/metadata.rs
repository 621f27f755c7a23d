//! Chunk, series and file metadata plus the metadata index tree
//!
//! The index is a B-tree-like structure written bottom-up by the file
//! writer. Device-level nodes map device ids to the root of each device's
//! measurement tree; measurement leaves map measurement ids to the offset of
//! their [`TimeseriesMetadata`]. Entries in a node are sorted by name and
//! internal entries carry the first name of their child.

use super::{get_i32, get_i64, get_string, get_u8, put_string, BloomFilter, Statistics};
use crate::{Result, StrataError, Timestamp, TsDataType};
use bytes::{Buf, BufMut};

/// Location and statistics of one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMetadata {
    pub measurement_id: String,
    pub data_type: TsDataType,
    pub offset_of_chunk_header: u64,
    pub statistics: Statistics,
}

impl ChunkMetadata {
    pub fn start_time(&self) -> Timestamp {
        self.statistics.start_time()
    }

    pub fn end_time(&self) -> Timestamp {
        self.statistics.end_time()
    }

    /// The measurement id and data type are implied by the owning series
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(self.offset_of_chunk_header as i64);
        self.statistics.serialize(buf);
    }

    pub fn deserialize<B: Buf>(
        buf: &mut B,
        measurement_id: &str,
        data_type: TsDataType,
    ) -> Result<Self> {
        let offset = get_i64(buf)?;
        if offset < 0 {
            return Err(StrataError::Corruption(format!(
                "Negative chunk offset {}",
                offset
            )));
        }
        Ok(Self {
            measurement_id: measurement_id.to_string(),
            data_type,
            offset_of_chunk_header: offset as u64,
            statistics: Statistics::deserialize(buf, data_type)?,
        })
    }
}

/// Chunks written for one device between a group start and its footer
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroupMetadata {
    pub device: String,
    pub chunk_metadata: Vec<ChunkMetadata>,
}

/// Series-level summary pointing at the series' chunk metadata list
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesMetadata {
    pub offset_of_chunk_metadata_list: i64,
    pub data_size_of_chunk_metadata_list: i32,
    pub measurement_id: String,
    pub data_type: TsDataType,
    pub statistics: Statistics,
}

impl TimeseriesMetadata {
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(self.offset_of_chunk_metadata_list);
        buf.put_i32(self.data_size_of_chunk_metadata_list);
        put_string(buf, &self.measurement_id);
        buf.put_u8(self.data_type as u8);
        self.statistics.serialize(buf);
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let offset_of_chunk_metadata_list = get_i64(buf)?;
        let data_size_of_chunk_metadata_list = get_i32(buf)?;
        let measurement_id = get_string(buf)?;
        let data_type = TsDataType::try_from(get_u8(buf)?)?;
        let statistics = Statistics::deserialize(buf, data_type)?;
        Ok(Self {
            offset_of_chunk_metadata_list,
            data_size_of_chunk_metadata_list,
            measurement_id,
            data_type,
            statistics,
        })
    }
}

/// Kind of an index node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetadataIndexNodeType {
    InternalDevice = 0,
    LeafDevice = 1,
    InternalMeasurement = 2,
    LeafMeasurement = 3,
}

impl TryFrom<u8> for MetadataIndexNodeType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MetadataIndexNodeType::InternalDevice),
            1 => Ok(MetadataIndexNodeType::LeafDevice),
            2 => Ok(MetadataIndexNodeType::InternalMeasurement),
            3 => Ok(MetadataIndexNodeType::LeafMeasurement),
            _ => Err(StrataError::Corruption(format!(
                "Invalid index node type: {}",
                value
            ))),
        }
    }
}

/// Name and file offset of an index child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub offset: i64,
}

/// One node of the metadata index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataIndexNode {
    pub children: Vec<IndexEntry>,
    /// End of the region covered by the last child
    pub end_offset: i64,
    pub node_type: MetadataIndexNodeType,
}

impl MetadataIndexNode {
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32(self.children.len() as i32);
        for entry in &self.children {
            put_string(buf, &entry.name);
            buf.put_i64(entry.offset);
        }
        buf.put_i64(self.end_offset);
        buf.put_u8(self.node_type as u8);
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = get_i32(buf)?;
        if count < 0 {
            return Err(StrataError::Corruption(format!(
                "Invalid index node size {}",
                count
            )));
        }
        let mut children = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = get_string(buf)?;
            let offset = get_i64(buf)?;
            children.push(IndexEntry { name, offset });
        }
        let end_offset = get_i64(buf)?;
        let node_type = MetadataIndexNodeType::try_from(get_u8(buf)?)?;
        Ok(Self {
            children,
            end_offset,
            node_type,
        })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self.node_type,
            MetadataIndexNodeType::LeafDevice | MetadataIndexNodeType::LeafMeasurement
        )
    }

    /// Child whose subtree may contain `key`: exact match in a leaf, the
    /// last entry not greater than `key` in an internal node
    pub fn find_child(&self, key: &str) -> Option<&IndexEntry> {
        if self.is_leaf() {
            return self
                .children
                .binary_search_by(|e| e.name.as_str().cmp(key))
                .ok()
                .map(|i| &self.children[i]);
        }
        let idx = self.children.partition_point(|e| e.name.as_str() <= key);
        idx.checked_sub(1).map(|i| &self.children[i])
    }
}

/// Destination of index nodes while the tree is built
pub(crate) trait IndexNodeSink {
    /// Write a node and return its offset
    fn write_node(&mut self, node: &MetadataIndexNode) -> Result<i64>;

    fn position(&self) -> i64;
}

/// Build an index tree over `entries` (sorted by name), writing every node
/// except the root, which is returned
pub(crate) fn build_index_tree<S: IndexNodeSink>(
    sink: &mut S,
    entries: Vec<IndexEntry>,
    leaf_type: MetadataIndexNodeType,
    internal_type: MetadataIndexNodeType,
    end_offset: i64,
    max_degree: usize,
) -> Result<MetadataIndexNode> {
    let mut level = group_into_nodes(entries, leaf_type, end_offset, max_degree);

    while level.len() > 1 {
        let mut parents = Vec::with_capacity(level.len());
        for node in &level {
            let offset = sink.write_node(node)?;
            let name = node
                .children
                .first()
                .map(|e| e.name.clone())
                .unwrap_or_default();
            parents.push(IndexEntry { name, offset });
        }
        let level_end = sink.position();
        level = group_into_nodes(parents, internal_type, level_end, max_degree);
    }

    Ok(level.pop().unwrap_or(MetadataIndexNode {
        children: Vec::new(),
        end_offset,
        node_type: leaf_type,
    }))
}

fn group_into_nodes(
    entries: Vec<IndexEntry>,
    node_type: MetadataIndexNodeType,
    end_offset: i64,
    max_degree: usize,
) -> Vec<MetadataIndexNode> {
    let max_degree = max_degree.max(2);
    let mut nodes: Vec<MetadataIndexNode> = Vec::new();
    let mut current = Vec::with_capacity(max_degree);

    for entry in entries {
        if current.len() == max_degree {
            let node_end = entry.offset;
            nodes.push(MetadataIndexNode {
                children: std::mem::take(&mut current),
                end_offset: node_end,
                node_type,
            });
        }
        current.push(entry);
    }
    if !current.is_empty() {
        nodes.push(MetadataIndexNode {
            children: current,
            end_offset,
            node_type,
        });
    }
    nodes
}

/// Trailing file metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TsFileMetadata {
    /// Root of the device-level index
    pub metadata_index: MetadataIndexNode,
    pub total_chunk_num: i32,
    /// Chunks left in the data section but dropped from the index
    pub invalid_chunk_num: i32,
    /// (position after the marker, version) pairs in file order
    pub version_info: Vec<(i64, i64)>,
    /// Offset of the separator that ends the data section
    pub meta_offset: i64,
    pub bloom_filter: BloomFilter,
}

impl TsFileMetadata {
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        self.metadata_index.serialize(buf);
        buf.put_i32(self.total_chunk_num);
        buf.put_i32(self.invalid_chunk_num);
        buf.put_i32(self.version_info.len() as i32);
        for (position, version) in &self.version_info {
            buf.put_i64(*position);
            buf.put_i64(*version);
        }
        buf.put_i64(self.meta_offset);
        self.bloom_filter.serialize(buf);
    }

    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        let metadata_index = MetadataIndexNode::deserialize(buf)?;
        let total_chunk_num = get_i32(buf)?;
        let invalid_chunk_num = get_i32(buf)?;
        let versions = get_i32(buf)?.max(0) as usize;
        let mut version_info = Vec::with_capacity(versions);
        for _ in 0..versions {
            version_info.push((get_i64(buf)?, get_i64(buf)?));
        }
        let meta_offset = get_i64(buf)?;
        let bloom_filter = BloomFilter::deserialize(buf)?;
        Ok(Self {
            metadata_index,
            total_chunk_num,
            invalid_chunk_num,
            version_info,
            meta_offset,
            bloom_filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink(Vec<u8>);

    impl IndexNodeSink for VecSink {
        fn write_node(&mut self, node: &MetadataIndexNode) -> Result<i64> {
            let offset = self.0.len() as i64;
            node.serialize(&mut self.0);
            Ok(offset)
        }

        fn position(&self) -> i64 {
            self.0.len() as i64
        }
    }

    fn entries(n: usize) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| IndexEntry {
                name: format!("s{:03}", i),
                offset: 1000 + i as i64 * 10,
            })
            .collect()
    }

    #[test]
    fn test_small_tree_is_single_leaf() {
        let mut sink = VecSink(Vec::new());
        let root = build_index_tree(
            &mut sink,
            entries(3),
            MetadataIndexNodeType::LeafMeasurement,
            MetadataIndexNodeType::InternalMeasurement,
            2000,
            4,
        )
        .unwrap();
        assert!(sink.0.is_empty());
        assert_eq!(root.node_type, MetadataIndexNodeType::LeafMeasurement);
        assert_eq!(root.end_offset, 2000);
        assert_eq!(root.find_child("s001").map(|e| e.offset), Some(1010));
        assert!(root.find_child("s0015").is_none());
    }

    #[test]
    fn test_multi_level_tree_lookup() {
        let mut sink = VecSink(Vec::new());
        let root = build_index_tree(
            &mut sink,
            entries(20),
            MetadataIndexNodeType::LeafMeasurement,
            MetadataIndexNodeType::InternalMeasurement,
            2000,
            3,
        )
        .unwrap();
        assert_eq!(root.node_type, MetadataIndexNodeType::InternalMeasurement);

        // Walk down to the leaf holding s017
        let mut node = root;
        while !node.is_leaf() {
            let child = node.find_child("s017").unwrap().offset as usize;
            node = MetadataIndexNode::deserialize(&mut &sink.0[child..]).unwrap();
        }
        assert_eq!(node.find_child("s017").map(|e| e.offset), Some(1170));
        assert!(node.children.len() <= 3);
    }

    #[test]
    fn test_empty_tree() {
        let mut sink = VecSink(Vec::new());
        let root = build_index_tree(
            &mut sink,
            Vec::new(),
            MetadataIndexNodeType::LeafDevice,
            MetadataIndexNodeType::InternalDevice,
            7,
            256,
        )
        .unwrap();
        assert!(root.children.is_empty());
        assert!(root.find_child("root.d0").is_none());
    }
}
