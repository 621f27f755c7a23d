//! Cross-space compaction: fold unsequenced files into sequence files
//!
//! Every selected sequence file is rewritten once. Series that receive
//! unsequenced points, or that carry deletions, are merged and written
//! first; then all valid chunks of the old file are copied verbatim and
//! [`TsFileIOWriter::filter_chunks`] drops the copies the merge superseded.

use super::{
    read_live_points, remove_quietly, temp_path, write_merged_groups, CompactionContext,
    MergeLogger, MergeResource, SeriesPoints,
};
use crate::management::TsFileManagement;
use crate::resource::TsFileResource;
use crate::tsfile::{ChunkMetadata, TsFileIOWriter};
use crate::{Result, SeriesPath, Timestamp};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

type SeriesMap = BTreeMap<SeriesPath, SeriesPoints>;

pub struct CrossCompactionTask {
    id: Uuid,
    management: Arc<TsFileManagement>,
    seq_files: Vec<Arc<TsFileResource>>,
    unseq_files: Vec<Arc<TsFileResource>>,
    resource: MergeResource,
    context: CompactionContext,
}

impl CrossCompactionTask {
    /// The caller has already marked every file as merging
    pub fn new(
        management: Arc<TsFileManagement>,
        seq_files: Vec<Arc<TsFileResource>>,
        unseq_files: Vec<Arc<TsFileResource>>,
        resource: MergeResource,
        context: CompactionContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            management,
            seq_files,
            unseq_files,
            resource,
            context,
        }
    }

    pub fn description(&self) -> String {
        format!(
            "cross compaction {} of {} seq and {} unseq files in {}[{}]",
            self.id,
            self.seq_files.len(),
            self.unseq_files.len(),
            self.management.storage_group(),
            self.management.partition()
        )
    }

    pub fn abort(self) {
        for file in self.seq_files.iter().chain(&self.unseq_files) {
            file.set_merging(false);
        }
        self.resource.clear();
    }

    /// On failure the merging flags and `merge.log` stay in place
    pub fn run(self) -> Result<()> {
        let _running = self.management.begin_task();
        self.management.start_unseq_merge();

        let mut written = Vec::new();
        let result = self.merge(&mut written);
        self.resource.clear();
        if let Err(e) = &result {
            error!(
                storage_group = %self.management.storage_group(),
                partition = self.management.partition(),
                "Cross compaction failed, merge log kept for recovery: {}",
                e
            );
            for path in &written {
                remove_quietly(path);
            }
        }
        result
    }

    fn merge(&self, written: &mut Vec<PathBuf>) -> Result<()> {
        let mut logger = MergeLogger::create(self.management.merge_log_path())?;
        logger.log_files(&self.seq_files, &self.unseq_files)?;
        logger.log_merge_start()?;

        let unseq_points = self.load_unseq_points()?;
        let mut assigned = self.assign(unseq_points);

        let mut replacements = Vec::with_capacity(self.seq_files.len());
        for (i, seq_file) in self.seq_files.iter().enumerate() {
            logger.log_file_merge_start(seq_file.path())?;
            let extra = std::mem::take(&mut assigned[i]);
            let target = self.rewrite(seq_file, extra, written)?;
            logger.log_file_merge_end(seq_file.path())?;
            replacements.push((Arc::clone(seq_file), target));
        }
        logger.log_all_ts_end()?;
        logger.log_merge_end()?;
        written.clear();

        self.management
            .merge_end_action(&replacements, &self.unseq_files, &self.context.caches)?;
        info!(
            storage_group = %self.management.storage_group(),
            partition = self.management.partition(),
            "Cross compaction folded {} unseq files into {} seq files",
            self.unseq_files.len(),
            self.seq_files.len()
        );
        Ok(())
    }

    /// Live points of every unsequenced series, newer files overriding older
    fn load_unseq_points(&self) -> Result<SeriesMap> {
        let mut series = SeriesMap::new();
        for file in &self.unseq_files {
            let reader = self.resource.reader(file)?;
            let deletions = file.mod_file().read_all()?;
            for (path, _) in reader.all_timeseries_metadata()? {
                let points = read_live_points(&reader, &path, &deletions)?;
                series.entry(path).or_default().extend(points);
            }
        }
        Ok(series)
    }

    /// Distribute points over the selected sequence files
    fn assign(&self, unseq_points: SeriesMap) -> Vec<SeriesMap> {
        let mut assigned = vec![SeriesMap::new(); self.seq_files.len()];
        for (path, points) in unseq_points {
            for (time, value) in points {
                let i = self.target_index(&path.device, time);
                assigned[i]
                    .entry(path.clone())
                    .or_default()
                    .insert(time, value);
            }
        }
        assigned
    }

    /// First file whose device end time reaches `time`, else the last file
    /// holding the device, else the last file
    fn target_index(&self, device: &str, time: Timestamp) -> usize {
        let mut last_holding = None;
        for (i, file) in self.seq_files.iter().enumerate() {
            if let Some(end) = file.end_time(device) {
                if end >= time {
                    return i;
                }
                last_holding = Some(i);
            }
        }
        last_holding.unwrap_or(self.seq_files.len() - 1)
    }

    fn rewrite(
        &self,
        seq_file: &Arc<TsFileResource>,
        extra: SeriesMap,
        written: &mut Vec<PathBuf>,
    ) -> Result<Arc<TsFileResource>> {
        let reader = self.resource.reader(seq_file)?;
        let deletions = seq_file.mod_file().read_all()?;

        let mut touched = SeriesMap::new();
        for (path, _) in reader.all_timeseries_metadata()? {
            if extra.contains_key(&path) || deletions.iter().any(|d| d.path == path) {
                let points = read_live_points(&reader, &path, &deletions)?;
                touched.insert(path, points);
            }
        }
        for (path, points) in extra {
            touched.entry(path).or_default().extend(points);
        }

        let target_path = self
            .management
            .file_dir(true)
            .join(seq_file.name().next_cross().to_string());
        let temp = temp_path(&target_path);
        written.push(temp.clone());

        let mut writer = TsFileIOWriter::create(&temp, &self.context.tsfile_config)?;
        let merged_starts =
            write_merged_groups(&mut writer, &touched, &self.context.tsfile_config)?;

        let mut expected: HashMap<SeriesPath, Vec<Timestamp>> = HashMap::new();
        for device in reader.devices()? {
            let by_measurement = reader.device_chunk_metadata(&device)?;
            let mut chunks: Vec<ChunkMetadata> = Vec::new();
            for (measurement, list) in by_measurement {
                let path = SeriesPath::new(device.as_str(), measurement);
                if !touched.contains_key(&path) {
                    expected.insert(path, list.iter().map(ChunkMetadata::start_time).collect());
                }
                chunks.extend(list);
            }
            chunks.sort_by_key(|chunk| chunk.offset_of_chunk_header);

            writer.start_chunk_group(&device)?;
            for metadata in &chunks {
                let chunk = reader.read_chunk(metadata.offset_of_chunk_header)?;
                writer.write_chunk(&chunk, metadata)?;
            }
            writer.end_chunk_group()?;
        }
        for path in touched.keys() {
            let starts = merged_starts.get(path).map(|start| vec![*start]);
            expected.insert(path.clone(), starts.unwrap_or_default());
        }
        writer.filter_chunks(&expected);
        debug!(
            "Rewrote {:?}: {} merged series, {} superseded chunks",
            seq_file.path(),
            touched.len(),
            writer.invalid_chunk_num()
        );

        writer.write_version(seq_file.name().version as i64)?;
        writer.end_file()?;
        fs::rename(&temp, &target_path)?;
        written.push(target_path.clone());

        let target = TsFileResource::new(&target_path, true, self.context.time_index_level)?;
        for device in seq_file.devices() {
            let start = seq_file.start_time(&device);
            if let (Some(start), Some(end)) = (start, seq_file.end_time(&device)) {
                target.update_start_time(&device, start);
                target.update_end_time(&device, end);
            }
        }
        for (path, points) in &touched {
            if let (Some((first, _)), Some((last, _))) =
                (points.iter().next(), points.iter().next_back())
            {
                target.update_start_time(&path.device, *first);
                target.update_end_time(&path.device, *last);
            }
        }
        target.close(self.context.partition_interval)?;
        Ok(Arc::new(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCaches;
    use crate::config::{TimeIndexLevel, TsFileConfig};
    use crate::resource::{Deletion, TsFileName};
    use crate::tsfile::{ChunkWriter, TsFileSequenceReader};
    use crate::{TimeRange, TsDataType, TsValue};
    use std::time::Duration;
    use tempfile::TempDir;

    fn context() -> CompactionContext {
        CompactionContext {
            tsfile_config: TsFileConfig::default(),
            partition_interval: i64::MAX,
            time_index_level: TimeIndexLevel::Device,
            caches: Arc::new(MetadataCaches::new(true, 100)),
        }
    }

    fn write_file(
        management: &TsFileManagement,
        seq: bool,
        version: u64,
        series: &[(&str, &str, &[(Timestamp, i64)])],
    ) -> Arc<TsFileResource> {
        let path = management
            .file_dir(seq)
            .join(TsFileName::new(0, version).to_string());
        let config = TsFileConfig::default();
        let mut writer = TsFileIOWriter::create(&path, &config).unwrap();
        let resource = TsFileResource::new(&path, seq, TimeIndexLevel::Device).unwrap();
        for (device, measurement, points) in series {
            writer.start_chunk_group(device).unwrap();
            let mut chunk = ChunkWriter::new(measurement, TsDataType::Int64, &config);
            for (time, value) in points.iter() {
                chunk.write(*time, &TsValue::Int64(*value)).unwrap();
                resource.update_time(device, *time);
            }
            chunk.write_to_file_writer(&mut writer).unwrap();
            writer.end_chunk_group().unwrap();
        }
        writer.end_file().unwrap();
        resource.close(i64::MAX).unwrap();
        let resource = Arc::new(resource);
        resource.set_merging(true);
        management.add(Arc::clone(&resource), seq);
        resource
    }

    fn values(path: &std::path::Path, device: &str, measurement: &str) -> Vec<(Timestamp, i64)> {
        TsFileSequenceReader::open(path)
            .unwrap()
            .read_series(&SeriesPath::new(device, measurement))
            .unwrap()
            .into_iter()
            .map(|(time, value)| match value {
                TsValue::Int64(v) => (time, v),
                other => panic!("unexpected value {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_unseq_points_land_in_overlapping_seq_files() {
        let dir = TempDir::new().unwrap();
        let management =
            Arc::new(TsFileManagement::new("root.sg", 0, dir.path(), Duration::ZERO).unwrap());
        let seq_a = write_file(
            &management,
            true,
            1,
            &[("d0", "s0", &[(1, 1), (10, 10)]), ("d0", "s1", &[(1, 100)])],
        );
        let seq_b = write_file(&management, true, 2, &[("d0", "s0", &[(20, 20), (30, 30)])]);
        let unseq = write_file(
            &management,
            false,
            3,
            &[("d0", "s0", &[(5, 500), (10, 1000), (25, 2500), (40, 4000)])],
        );

        let task = CrossCompactionTask::new(
            Arc::clone(&management),
            vec![Arc::clone(&seq_a), Arc::clone(&seq_b)],
            vec![Arc::clone(&unseq)],
            MergeResource::new(),
            context(),
        );
        task.run().unwrap();

        assert!(management.is_empty(false));
        assert!(!unseq.path().exists());
        assert!(!management.merge_log_path().exists());
        assert!(!management.is_unseq_merging());

        let files = management.iter(true);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name(), TsFileName::new(0, 1).next_cross());
        assert_eq!(
            values(files[0].path(), "d0", "s0"),
            vec![(1, 1), (5, 500), (10, 1000)]
        );
        // Untouched series are copied as they were
        assert_eq!(values(files[0].path(), "d0", "s1"), vec![(1, 100)]);
        assert_eq!(
            values(files[1].path(), "d0", "s0"),
            vec![(20, 20), (25, 2500), (30, 30), (40, 4000)]
        );
        assert_eq!(files[1].end_time("d0"), Some(40));
        assert!(files.iter().all(|f| !f.is_merging()));

        let reader = TsFileSequenceReader::open(files[0].path()).unwrap();
        assert_eq!(reader.metadata().invalid_chunk_num, 1);
    }

    #[test]
    fn test_seq_deletions_are_applied() {
        let dir = TempDir::new().unwrap();
        let management =
            Arc::new(TsFileManagement::new("root.sg", 0, dir.path(), Duration::ZERO).unwrap());
        let seq = write_file(&management, true, 1, &[("d0", "s0", &[(1, 1), (2, 2), (3, 3)])]);
        let unseq = write_file(&management, false, 2, &[("d1", "s0", &[(1, 7)])]);
        seq.mod_file()
            .append(&Deletion::new(
                SeriesPath::new("d0", "s0"),
                TimeRange::new(2, 2),
                seq.file_size(),
            ))
            .unwrap();

        CrossCompactionTask::new(
            Arc::clone(&management),
            vec![Arc::clone(&seq)],
            vec![unseq],
            MergeResource::new(),
            context(),
        )
        .run()
        .unwrap();

        let files = management.iter(true);
        assert_eq!(values(files[0].path(), "d0", "s0"), vec![(1, 1), (3, 3)]);
        assert_eq!(values(files[0].path(), "d1", "s0"), vec![(1, 7)]);
        assert_eq!(files[0].mod_entry_count().unwrap(), 0);
    }

    #[test]
    fn test_failure_keeps_flags_and_log() {
        let dir = TempDir::new().unwrap();
        let management =
            Arc::new(TsFileManagement::new("root.sg", 0, dir.path(), Duration::ZERO).unwrap());
        let seq = write_file(&management, true, 1, &[("d0", "s0", &[(1, 1)])]);
        let unseq = write_file(&management, false, 2, &[("d0", "s0", &[(0, 0)])]);
        fs::remove_file(seq.path()).unwrap();

        let result = CrossCompactionTask::new(
            Arc::clone(&management),
            vec![Arc::clone(&seq)],
            vec![Arc::clone(&unseq)],
            MergeResource::new(),
            context(),
        )
        .run();

        assert!(result.is_err());
        assert!(seq.is_merging());
        assert!(unseq.is_merging());
        assert!(management.merge_log_path().exists());
        assert_eq!(management.size(false), 1);
    }
}
