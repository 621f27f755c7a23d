//! Inner-space compaction: merge a run of same-kind files into one

use super::{
    close_target, read_live_points, remove_quietly, temp_path, write_merged_groups,
    CompactionContext, SeriesPoints,
};
use crate::management::TsFileManagement;
use crate::resource::{Deletion, TsFileResource};
use crate::tsfile::{ChunkMetadata, TsFileIOWriter, TsFileSequenceReader};
use crate::{Result, SeriesPath, StrataError};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Merges `sources` (oldest first) into a file named after the newest
/// source with its inner counter incremented
pub struct InnerCompactionTask {
    id: Uuid,
    management: Arc<TsFileManagement>,
    sequence: bool,
    sources: Vec<Arc<TsFileResource>>,
    context: CompactionContext,
}

impl InnerCompactionTask {
    /// The caller has already marked every source as merging
    pub fn new(
        management: Arc<TsFileManagement>,
        sequence: bool,
        sources: Vec<Arc<TsFileResource>>,
        context: CompactionContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            management,
            sequence,
            sources,
            context,
        }
    }

    pub fn sources(&self) -> &[Arc<TsFileResource>] {
        &self.sources
    }

    pub fn description(&self) -> String {
        format!(
            "inner {} compaction {} of {} files in {}[{}]",
            if self.sequence { "seq" } else { "unseq" },
            self.id,
            self.sources.len(),
            self.management.storage_group(),
            self.management.partition()
        )
    }

    pub fn abort(self) {
        for source in &self.sources {
            source.set_merging(false);
        }
    }

    pub fn run(self) -> Result<()> {
        let _running = self.management.begin_task();
        let newest = self
            .sources
            .last()
            .ok_or_else(|| StrataError::Compaction("Inner compaction without sources".into()))?;
        let target_path = self
            .management
            .file_dir(self.sequence)
            .join(newest.name().next_inner().to_string());
        let temp = temp_path(&target_path);

        let result = self.compact(&temp, &target_path);
        if result.is_err() {
            remove_quietly(&temp);
            for source in &self.sources {
                source.set_merging(false);
            }
        }
        result
    }

    fn compact(&self, temp: &Path, target_path: &Path) -> Result<()> {
        // Deletions present now are applied while merging; later ones are
        // migrated to the target when it is swapped in
        let mut recorded = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            recorded.push(source.mod_file().read_all()?);
        }

        let mut readers = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            readers.push(TsFileSequenceReader::open(source.path())?);
        }

        let fast_path = self.sequence && recorded.iter().all(Vec::is_empty);
        self.write_target(temp, &readers, &recorded, fast_path)?;
        fs::rename(temp, target_path)?;

        let target = match close_target(target_path, self.sequence, &self.context) {
            Ok(target) => target,
            Err(e) => {
                remove_quietly(target_path);
                return Err(e);
            }
        };
        if let Err(e) = self.swap_in(&target, &recorded) {
            let _guard = target.lock().write();
            if let Err(remove_err) = target.remove() {
                warn!("Cannot remove compaction target {:?}: {}", target.path(), remove_err);
            }
            return Err(e);
        }

        info!(
            storage_group = %self.management.storage_group(),
            partition = self.management.partition(),
            "Inner compaction merged {} files into {:?}{}",
            self.sources.len(),
            target.path(),
            if fast_path { " by chunk copy" } else { "" }
        );
        Ok(())
    }

    fn write_target(
        &self,
        temp: &Path,
        readers: &[TsFileSequenceReader],
        recorded: &[Vec<Deletion>],
        fast_path: bool,
    ) -> Result<()> {
        let mut writer = TsFileIOWriter::create(temp, &self.context.tsfile_config)?;
        if fast_path {
            copy_chunks(&mut writer, readers)?;
        } else {
            let mut series: BTreeMap<SeriesPath, SeriesPoints> = BTreeMap::new();
            for (reader, deletions) in readers.iter().zip(recorded) {
                for (path, _) in reader.all_timeseries_metadata()? {
                    let points = read_live_points(reader, &path, deletions)?;
                    series.entry(path).or_default().extend(points);
                }
            }
            series.retain(|_, points| !points.is_empty());
            write_merged_groups(&mut writer, &series, &self.context.tsfile_config)?;
        }

        let version = self
            .sources
            .iter()
            .map(|source| source.name().version)
            .max()
            .unwrap_or(0);
        writer.write_version(version as i64)?;
        writer.end_file()?;
        Ok(())
    }

    fn swap_in(&self, target: &Arc<TsFileResource>, recorded: &[Vec<Deletion>]) -> Result<()> {
        let _guard = self.management.acquire_composite(&self.sources);

        let mut migrated = Vec::new();
        for (source, before) in self.sources.iter().zip(recorded) {
            let all = source.mod_file().read_all()?;
            migrated.extend(all.iter().skip(before.len()).map(Deletion::for_any_offset));
        }
        if !migrated.is_empty() {
            debug!(
                "Migrating {} deletions to {:?}",
                migrated.len(),
                target.path()
            );
            target.mod_file().append_all(&migrated)?;
        }

        self.management
            .replace(self.sequence, &self.sources, Arc::clone(target));
        for source in &self.sources {
            self.context.caches.remove_file(source.path());
            if let Err(e) = source.remove() {
                warn!("Cannot remove compacted file {:?}: {}", source.path(), e);
            }
        }
        Ok(())
    }
}

/// Copy every chunk of non-overlapping files, one group per device
fn copy_chunks(writer: &mut TsFileIOWriter, readers: &[TsFileSequenceReader]) -> Result<()> {
    let mut devices = BTreeSet::new();
    for reader in readers {
        devices.extend(reader.devices()?);
    }

    for device in devices {
        writer.start_chunk_group(&device)?;
        for reader in readers {
            let mut chunks: Vec<ChunkMetadata> = reader
                .device_chunk_metadata(&device)?
                .into_values()
                .flatten()
                .collect();
            chunks.sort_by_key(|chunk| chunk.offset_of_chunk_header);
            for metadata in chunks {
                let chunk = reader.read_chunk(metadata.offset_of_chunk_header)?;
                writer.write_chunk(&chunk, &metadata)?;
            }
        }
        writer.end_chunk_group()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetadataCaches;
    use crate::config::{TimeIndexLevel, TsFileConfig};
    use crate::resource::TsFileName;
    use crate::tsfile::ChunkWriter;
    use crate::{TimeRange, Timestamp, TsDataType, TsValue};
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
        points: &[(&str, &str, Timestamp, i64)],
    ) -> Arc<TsFileResource> {
        let path = management
            .file_dir(seq)
            .join(TsFileName::new(1000, version).to_string());
        let config = TsFileConfig::default();
        let mut writer = TsFileIOWriter::create(&path, &config).unwrap();
        let resource = TsFileResource::new(&path, seq, TimeIndexLevel::Device).unwrap();

        let mut by_series: BTreeMap<(String, String), Vec<(Timestamp, i64)>> = BTreeMap::new();
        for (device, measurement, time, value) in points {
            by_series
                .entry((device.to_string(), measurement.to_string()))
                .or_default()
                .push((*time, *value));
            resource.update_time(device, *time);
        }
        let mut current: Option<String> = None;
        for ((device, measurement), series) in &by_series {
            if current.as_deref() != Some(device.as_str()) {
                if current.is_some() {
                    writer.end_chunk_group().unwrap();
                }
                writer.start_chunk_group(device).unwrap();
                current = Some(device.clone());
            }
            let mut chunk = ChunkWriter::new(measurement, TsDataType::Int64, &config);
            for (time, value) in series {
                chunk.write(*time, &TsValue::Int64(*value)).unwrap();
            }
            chunk.write_to_file_writer(&mut writer).unwrap();
        }
        writer.end_chunk_group().unwrap();
        writer.write_version(version as i64).unwrap();
        writer.end_file().unwrap();
        resource.close(i64::MAX).unwrap();

        let resource = Arc::new(resource);
        management.add(Arc::clone(&resource), seq);
        resource
    }

    fn management(dir: &TempDir) -> Arc<TsFileManagement> {
        Arc::new(TsFileManagement::new("root.sg", 0, dir.path(), Duration::ZERO).unwrap())
    }

    fn read(path: &Path, device: &str, measurement: &str) -> Vec<(Timestamp, TsValue)> {
        TsFileSequenceReader::open(path)
            .unwrap()
            .read_series(&SeriesPath::new(device, measurement))
            .unwrap()
    }

    #[test]
    fn test_seq_files_are_copied_into_one() {
        let dir = TempDir::new().unwrap();
        let management = management(&dir);
        let a = write_file(&management, true, 1, &[("d0", "s0", 1, 10), ("d0", "s0", 2, 20)]);
        let b = write_file(&management, true, 2, &[("d0", "s0", 5, 50), ("d1", "s0", 6, 60)]);
        for file in [&a, &b] {
            file.set_merging(true);
        }

        let task = InnerCompactionTask::new(
            Arc::clone(&management),
            true,
            vec![Arc::clone(&a), Arc::clone(&b)],
            context(),
        );
        task.run().unwrap();

        let files = management.iter(true);
        assert_eq!(files.len(), 1);
        let target = &files[0];
        assert_eq!(target.name(), TsFileName::new(1000, 2).next_inner());
        assert!(!a.path().exists());
        assert!(!b.path().exists());
        assert_eq!(target.start_time("d0"), Some(1));
        assert_eq!(target.end_time("d1"), Some(6));

        let times: Vec<_> = read(target.path(), "d0", "s0").into_iter().map(|p| p.0).collect();
        assert_eq!(times, vec![1, 2, 5]);
        assert!(!management.is_compacting());
    }

    #[test]
    fn test_unseq_merge_prefers_newer_file_and_applies_deletions() {
        let dir = TempDir::new().unwrap();
        let management = management(&dir);
        let old = write_file(&management, false, 1, &[("d0", "s0", 1, 1), ("d0", "s0", 3, 3)]);
        let new = write_file(&management, false, 2, &[("d0", "s0", 3, 30), ("d0", "s0", 7, 70)]);
        old.mod_file()
            .append(&Deletion::new(
                SeriesPath::new("d0", "s0"),
                TimeRange::new(1, 1),
                old.file_size(),
            ))
            .unwrap();

        let task = InnerCompactionTask::new(
            Arc::clone(&management),
            false,
            vec![old, new],
            context(),
        );
        task.run().unwrap();

        let files = management.iter(false);
        assert_eq!(files.len(), 1);
        assert_eq!(
            read(files[0].path(), "d0", "s0"),
            vec![(3, TsValue::Int64(30)), (7, TsValue::Int64(70))]
        );
        assert_eq!(files[0].mod_entry_count().unwrap(), 0);
    }

    #[test]
    fn test_failure_clears_merging_flags() {
        let dir = TempDir::new().unwrap();
        let management = management(&dir);
        let a = write_file(&management, true, 1, &[("d0", "s0", 1, 1)]);
        a.set_merging(true);
        fs::remove_file(a.path()).unwrap();

        let task = InnerCompactionTask::new(
            Arc::clone(&management),
            true,
            vec![Arc::clone(&a)],
            context(),
        );
        assert!(task.run().is_err());
        assert!(!a.is_merging());
        assert_eq!(management.size(true), 1);
        assert!(!temp_path(
            &management
                .file_dir(true)
                .join(TsFileName::new(1000, 1).next_inner().to_string())
        )
        .exists());
    }
}
