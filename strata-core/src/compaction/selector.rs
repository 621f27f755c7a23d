//! Cross-space file selection under a memory budget
//!
//! Unsequenced files are considered oldest first. Each one pulls in the
//! sequence files its device ranges overlap; the pair is accepted while the
//! estimated memory of everything selected stays within the budget.

use crate::config::{MergeFileStrategy, POINT_MEMORY_ESTIMATE};
use crate::resource::TsFileResource;
use crate::tsfile::TsFileSequenceReader;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Readers of the files taking part in one selection and its merge
#[derive(Default)]
pub struct MergeResource {
    readers: Mutex<HashMap<PathBuf, Arc<TsFileSequenceReader>>>,
}

impl MergeResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (once) the reader of `file`
    pub fn reader(&self, file: &TsFileResource) -> Result<Arc<TsFileSequenceReader>> {
        let mut readers = self.readers.lock();
        if let Some(reader) = readers.get(file.path()) {
            return Ok(Arc::clone(reader));
        }
        let reader = Arc::new(TsFileSequenceReader::open(file.path())?);
        readers.insert(file.path().to_path_buf(), Arc::clone(&reader));
        Ok(reader)
    }

    pub fn open_readers(&self) -> usize {
        self.readers.lock().len()
    }

    /// Close every reader
    pub fn clear(&self) {
        self.readers.lock().clear();
    }
}

/// Files chosen for one cross-space merge, each list oldest first
#[derive(Debug, Clone)]
pub struct CrossSpaceSelection {
    pub seq_files: Vec<Arc<TsFileResource>>,
    pub unseq_files: Vec<Arc<TsFileResource>>,
    /// Estimated memory of the merge in bytes
    pub total_cost: u64,
    /// Series assumed to be merged at the same time when costing
    pub concurrent_series: u64,
}

pub struct FileSelector<'a> {
    resource: &'a MergeResource,
    memory_budget: u64,
    strategy: MergeFileStrategy,
    time_lower_bound: i64,
    max_open_files: usize,
}

struct Candidate {
    seq: Vec<usize>,
    unseq: Vec<usize>,
    cost: u64,
}

impl<'a> FileSelector<'a> {
    pub fn new(
        resource: &'a MergeResource,
        memory_budget: u64,
        strategy: MergeFileStrategy,
        time_lower_bound: i64,
        max_open_files: usize,
    ) -> Self {
        Self {
            resource,
            memory_budget,
            strategy,
            time_lower_bound,
            max_open_files,
        }
    }

    /// Choose files to merge; `None` if nothing fits
    pub fn select(
        &self,
        seq_files: &[Arc<TsFileResource>],
        unseq_files: &[Arc<TsFileResource>],
    ) -> Result<Option<CrossSpaceSelection>> {
        if seq_files.is_empty() || unseq_files.is_empty() {
            return Ok(None);
        }
        let unseq = self.unseq_candidates(unseq_files);
        if unseq.is_empty() {
            return Ok(None);
        }

        let mut costs = CostTable::new(self.resource, seq_files, unseq_files);
        let (candidate, concurrent_series) = match self.strategy {
            MergeFileStrategy::MaxFileNum => (
                self.select_with(&mut costs, seq_files, unseq_files, &unseq, 1)?,
                1,
            ),
            MergeFileStrategy::MaxSeriesNum => {
                self.select_max_series(&mut costs, seq_files, unseq_files, &unseq)?
            }
        };

        if candidate.unseq.is_empty() || candidate.seq.is_empty() {
            return Ok(None);
        }
        debug!(
            "Selected {} seq and {} unseq files, cost {} of budget {}",
            candidate.seq.len(),
            candidate.unseq.len(),
            candidate.cost,
            self.memory_budget
        );
        let mut seq_indexes = candidate.seq;
        seq_indexes.sort_unstable();
        Ok(Some(CrossSpaceSelection {
            seq_files: seq_indexes.iter().map(|&i| Arc::clone(&seq_files[i])).collect(),
            unseq_files: candidate
                .unseq
                .iter()
                .map(|&i| Arc::clone(&unseq_files[i]))
                .collect(),
            total_cost: candidate.cost,
            concurrent_series,
        }))
    }

    /// Oldest closed, non-merging unsequenced files, up to the open file cap
    fn unseq_candidates(&self, unseq_files: &[Arc<TsFileResource>]) -> Vec<usize> {
        let mut candidates = Vec::new();
        for (i, file) in unseq_files.iter().enumerate() {
            if candidates.len() >= self.max_open_files {
                break;
            }
            if !file.is_closed() || file.is_merging() {
                break;
            }
            if file.still_lives(self.time_lower_bound) {
                candidates.push(i);
            }
        }
        candidates
    }

    /// Largest concurrent series count that keeps as many files as a
    /// single-series estimate does
    fn select_max_series(
        &self,
        costs: &mut CostTable<'_>,
        seq_files: &[Arc<TsFileResource>],
        unseq_files: &[Arc<TsFileResource>],
        unseq: &[usize],
    ) -> Result<(Candidate, u64)> {
        let base = self.select_with(costs, seq_files, unseq_files, unseq, 1)?;
        let base_files = base.seq.len() + base.unseq.len();
        if base_files == 0 {
            return Ok((base, 1));
        }

        let (mut low, mut high) = (1u64, costs.max_series_count().max(1));
        let mut best = base;
        while low < high {
            let mid = low + (high - low + 1) / 2;
            let candidate = self.select_with(costs, seq_files, unseq_files, unseq, mid)?;
            if candidate.seq.len() + candidate.unseq.len() == base_files {
                low = mid;
                best = candidate;
            } else {
                high = mid - 1;
            }
        }
        Ok((best, low))
    }

    fn select_with(
        &self,
        costs: &mut CostTable<'_>,
        seq_files: &[Arc<TsFileResource>],
        unseq_files: &[Arc<TsFileResource>],
        unseq: &[usize],
        concurrent_series: u64,
    ) -> Result<Candidate> {
        let mut selected = Candidate {
            seq: Vec::new(),
            unseq: Vec::new(),
            cost: 0,
        };

        for &u in unseq {
            let required = match required_seq_files(&unseq_files[u], seq_files) {
                Some(required) => required,
                None => break,
            };
            let new_seq: Vec<usize> = required
                .into_iter()
                .filter(|i| !selected.seq.contains(i))
                .collect();

            let mut added = costs.unseq_cost(u);
            for &s in &new_seq {
                added = added.saturating_add(costs.seq_cost(s, concurrent_series));
            }
            if selected.cost.saturating_add(added) > self.memory_budget {
                break;
            }
            selected.cost += added;
            selected.unseq.push(u);
            selected.seq.extend(new_seq);
        }
        Ok(selected)
    }
}

/// Sequence files an unsequenced file overlaps, by index. `None` if one of
/// them cannot take part in a merge now.
fn required_seq_files(
    unseq: &TsFileResource,
    seq_files: &[Arc<TsFileResource>],
) -> Option<Vec<usize>> {
    fn add(i: usize, required: &mut Vec<usize>) {
        if !required.contains(&i) {
            required.push(i);
        }
    }

    if seq_files.is_empty() {
        return Some(Vec::new());
    }
    let mut required: Vec<usize> = Vec::new();

    for device in unseq.devices() {
        let (start, end) = match (unseq.start_time(&device), unseq.end_time(&device)) {
            (Some(start), Some(end)) => (start, end),
            _ => continue,
        };
        let holding: Vec<usize> = (0..seq_files.len())
            .filter(|&i| seq_files[i].contains_device(&device))
            .collect();

        let last = match holding.last() {
            Some(&last) => last,
            None => {
                add(seq_files.len() - 1, &mut required);
                continue;
            }
        };

        let mut reached_end = false;
        let mut started = false;
        for &i in &holding {
            let seq_end = seq_files[i].end_time(&device).unwrap_or(i64::MIN);
            if !started && seq_end >= start {
                started = true;
            }
            if started {
                add(i, &mut required);
                if seq_end >= end {
                    reached_end = true;
                    break;
                }
            }
        }
        if !reached_end {
            add(last, &mut required);
        }
    }

    if required
        .iter()
        .any(|&i| !seq_files[i].is_closed() || seq_files[i].is_merging())
    {
        return None;
    }
    Some(required)
}

/// Per-file cost inputs, read once per selection
struct CostTable<'a> {
    resource: &'a MergeResource,
    seq_files: &'a [Arc<TsFileResource>],
    unseq_sizes: Vec<u64>,
    seq_inputs: HashMap<usize, (u64, u64, u64)>,
}

impl<'a> CostTable<'a> {
    fn new(
        resource: &'a MergeResource,
        seq_files: &'a [Arc<TsFileResource>],
        unseq_files: &[Arc<TsFileResource>],
    ) -> Self {
        Self {
            resource,
            seq_files,
            unseq_sizes: unseq_files.iter().map(|f| f.file_size()).collect(),
            seq_inputs: HashMap::new(),
        }
    }

    fn unseq_cost(&self, index: usize) -> u64 {
        self.unseq_sizes[index]
    }

    /// Metadata size plus the points of `concurrent_series` of the
    /// largest series held in memory
    fn seq_cost(&mut self, index: usize, concurrent_series: u64) -> u64 {
        let (metadata_size, max_points, _) = self.seq_input(index);
        concurrent_series
            .saturating_mul(max_points)
            .saturating_mul(POINT_MEMORY_ESTIMATE)
            .saturating_add(metadata_size)
    }

    fn max_series_count(&mut self) -> u64 {
        (0..self.seq_files.len())
            .map(|i| self.seq_input(i).2)
            .max()
            .unwrap_or(1)
    }

    fn seq_input(&mut self, index: usize) -> (u64, u64, u64) {
        if let Some(input) = self.seq_inputs.get(&index) {
            return *input;
        }
        let input = match self.read_seq_input(index) {
            Ok(input) => input,
            // An unreadable file never fits
            Err(e) => {
                debug!("Cannot cost {:?}: {}", self.seq_files[index].path(), e);
                (u64::MAX, 0, 0)
            }
        };
        self.seq_inputs.insert(index, input);
        input
    }

    fn read_seq_input(&self, index: usize) -> Result<(u64, u64, u64)> {
        let reader = self.resource.reader(&self.seq_files[index])?;
        let series = reader.all_timeseries_metadata()?;
        let max_points = series
            .iter()
            .map(|(_, timeseries)| timeseries.statistics.count())
            .max()
            .unwrap_or(0);
        Ok((reader.metadata_size() as u64, max_points, series.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TimeIndexLevel, TsFileConfig};
    use crate::resource::TsFileName;
    use crate::tsfile::{ChunkWriter, TsFileIOWriter};
    use crate::{Timestamp, TsDataType, TsValue};
    use std::path::Path;
    use tempfile::TempDir;

    fn write_file(
        dir: &Path,
        version: u64,
        seq: bool,
        device: &str,
        times: &[Timestamp],
    ) -> Arc<TsFileResource> {
        let path = dir.join(TsFileName::new(0, version).to_string());
        let config = TsFileConfig::default();
        let mut writer = TsFileIOWriter::create(&path, &config).unwrap();
        let resource = TsFileResource::new(&path, seq, TimeIndexLevel::Device).unwrap();
        writer.start_chunk_group(device).unwrap();
        let mut chunk = ChunkWriter::new("s0", TsDataType::Int64, &config);
        for &time in times {
            chunk.write(time, &TsValue::Int64(time)).unwrap();
            resource.update_time(device, time);
        }
        chunk.write_to_file_writer(&mut writer).unwrap();
        writer.end_chunk_group().unwrap();
        writer.end_file().unwrap();
        resource.close(i64::MAX).unwrap();
        Arc::new(resource)
    }

    fn selector(
        resource: &MergeResource,
        budget: u64,
        strategy: MergeFileStrategy,
    ) -> FileSelector<'_> {
        FileSelector::new(resource, budget, strategy, i64::MIN, 100)
    }

    #[test]
    fn test_required_seq_files() {
        let dir = TempDir::new().unwrap();
        let seq = vec![
            write_file(dir.path(), 1, true, "d0", &[1, 10]),
            write_file(dir.path(), 2, true, "d0", &[11, 20]),
            write_file(dir.path(), 3, true, "d0", &[21, 30]),
        ];

        let inside = write_file(dir.path(), 10, false, "d0", &[12, 15]);
        assert_eq!(required_seq_files(&inside, &seq), Some(vec![1]));

        let spanning = write_file(dir.path(), 11, false, "d0", &[5, 25]);
        assert_eq!(required_seq_files(&spanning, &seq), Some(vec![0, 1, 2]));

        let after = write_file(dir.path(), 12, false, "d0", &[40]);
        assert_eq!(required_seq_files(&after, &seq), Some(vec![2]));

        let other_device = write_file(dir.path(), 13, false, "d9", &[5]);
        assert_eq!(required_seq_files(&other_device, &seq), Some(vec![2]));

        seq[1].set_merging(true);
        assert_eq!(required_seq_files(&inside, &seq), None);
    }

    #[test]
    fn test_selection_respects_budget() {
        let dir = TempDir::new().unwrap();
        let seq = vec![
            write_file(dir.path(), 1, true, "d0", &[1, 10]),
            write_file(dir.path(), 2, true, "d0", &[11, 20]),
        ];
        let unseq = vec![
            write_file(dir.path(), 3, false, "d0", &[5]),
            write_file(dir.path(), 4, false, "d0", &[15]),
        ];

        let resource = MergeResource::new();
        let all = selector(&resource, u64::MAX, MergeFileStrategy::MaxFileNum)
            .select(&seq, &unseq)
            .unwrap()
            .unwrap();
        assert_eq!(all.seq_files.len(), 2);
        assert_eq!(all.unseq_files.len(), 2);

        // Only the first pair fits
        let first_pair = unseq[0].file_size()
            + resource.reader(&seq[0]).unwrap().metadata_size() as u64
            + 2 * POINT_MEMORY_ESTIMATE;
        let limited = selector(&resource, first_pair, MergeFileStrategy::MaxFileNum)
            .select(&seq, &unseq)
            .unwrap()
            .unwrap();
        assert_eq!(limited.unseq_files.len(), 1);
        assert_eq!(limited.seq_files.len(), 1);
        assert!(limited.total_cost <= first_pair);

        assert!(selector(&resource, 1, MergeFileStrategy::MaxFileNum)
            .select(&seq, &unseq)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_max_series_keeps_file_count() {
        let dir = TempDir::new().unwrap();
        let seq = vec![write_file(dir.path(), 1, true, "d0", &[1, 2, 3])];
        let unseq = vec![write_file(dir.path(), 2, false, "d0", &[2])];

        let resource = MergeResource::new();
        let selection = selector(&resource, u64::MAX, MergeFileStrategy::MaxSeriesNum)
            .select(&seq, &unseq)
            .unwrap()
            .unwrap();
        assert_eq!(selection.unseq_files.len(), 1);
        assert_eq!(selection.concurrent_series, 1);
        assert_eq!(resource.open_readers(), 1);
        resource.clear();
        assert_eq!(resource.open_readers(), 0);
    }

    #[test]
    fn test_merging_unseq_file_ends_candidates() {
        let dir = TempDir::new().unwrap();
        let seq = vec![write_file(dir.path(), 1, true, "d0", &[1, 10])];
        let unseq = vec![
            write_file(dir.path(), 2, false, "d0", &[5]),
            write_file(dir.path(), 3, false, "d0", &[6]),
        ];
        unseq[0].set_merging(true);

        let resource = MergeResource::new();
        assert!(selector(&resource, u64::MAX, MergeFileStrategy::MaxFileNum)
            .select(&seq, &unseq)
            .unwrap()
            .is_none());
    }
}
