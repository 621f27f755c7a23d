//! Background compaction of TsFiles
//!
//! - **Inner-space**: merges a run of adjacent files of the same kind
//!   (sequence or unsequenced) into one larger file.
//! - **Cross-space**: folds unsequenced files into the sequence files
//!   whose time ranges they overlap.
//!
//! The [`CompactionScheduler`] selects candidates per partition and hands
//! tasks to the [`CompactionTaskManager`], whose worker count is also the
//! global limit of running tasks.

mod cross;
mod inner;
mod merge_log;
mod scheduler;
mod selector;
mod task_manager;

pub use cross::CrossCompactionTask;
pub use inner::InnerCompactionTask;
pub use merge_log::MergeLogger;
pub use scheduler::{CompactionDriver, CompactionScheduler};
pub use selector::{CrossSpaceSelection, FileSelector, MergeResource};
pub use task_manager::{CompactionStats, CompactionTaskManager, TaskPermit};

use crate::cache::MetadataCaches;
use crate::config::{TimeIndexLevel, TsFileConfig, MERGE_SUFFIX};
use crate::resource::{Deletion, TsFileResource};
use crate::tsfile::{ChunkWriter, TsFileIOWriter, TsFileSequenceReader};
use crate::{Result, SeriesPath, Timestamp, TsValue};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Settings shared by every compaction task
#[derive(Clone)]
pub struct CompactionContext {
    pub tsfile_config: TsFileConfig,
    pub partition_interval: i64,
    pub time_index_level: TimeIndexLevel,
    pub caches: Arc<MetadataCaches>,
}

/// A unit of work for the compaction workers
pub enum CompactionTask {
    Inner(InnerCompactionTask),
    Cross(CrossCompactionTask),
}

impl CompactionTask {
    pub fn run(self) -> Result<()> {
        match self {
            CompactionTask::Inner(task) => task.run(),
            CompactionTask::Cross(task) => task.run(),
        }
    }

    /// Undo the selection of a task that will never run
    pub fn abort(self) {
        match self {
            CompactionTask::Inner(task) => task.abort(),
            CompactionTask::Cross(task) => task.abort(),
        }
    }

    pub fn description(&self) -> String {
        match self {
            CompactionTask::Inner(task) => task.description(),
            CompactionTask::Cross(task) => task.description(),
        }
    }
}

/// Points of one series, time-ordered
pub(crate) type SeriesPoints = BTreeMap<Timestamp, TsValue>;

/// Read every live point of `path` from a file, honoring its deletions
pub(crate) fn read_live_points(
    reader: &TsFileSequenceReader,
    path: &SeriesPath,
    deletions: &[Deletion],
) -> Result<SeriesPoints> {
    reader.read_series_filtered(path, |time, offset| {
        !deletions.iter().any(|d| d.covers(path, time, offset))
    })
}

/// Write one chunk group per device from merged points. Returns the start
/// time of the chunk written for each series.
pub(crate) fn write_merged_groups(
    writer: &mut TsFileIOWriter,
    series: &BTreeMap<SeriesPath, SeriesPoints>,
    config: &TsFileConfig,
) -> Result<BTreeMap<SeriesPath, Timestamp>> {
    let mut starts = BTreeMap::new();
    let mut current_device: Option<&str> = None;

    for (path, points) in series {
        if current_device != Some(path.device.as_str()) {
            if current_device.is_some() {
                writer.end_chunk_group()?;
            }
            writer.start_chunk_group(&path.device)?;
            current_device = Some(path.device.as_str());
        }
        let (first_time, first_value) = match points.iter().next() {
            Some(first) => first,
            None => continue,
        };
        let mut chunk = ChunkWriter::new(&path.measurement, first_value.data_type(), config);
        for (time, value) in points {
            chunk.write(*time, value)?;
        }
        chunk.write_to_file_writer(writer)?;
        starts.insert(path.clone(), *first_time);
    }
    if current_device.is_some() {
        writer.end_chunk_group()?;
    }
    Ok(starts)
}

/// Temporary path a compaction writes to before renaming into place
pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(MERGE_SUFFIX);
    PathBuf::from(name)
}

/// Build the closed resource of a freshly written file
pub(crate) fn close_target(
    path: &Path,
    seq: bool,
    context: &CompactionContext,
) -> Result<Arc<TsFileResource>> {
    let resource = TsFileResource::new(path, seq, context.time_index_level)?;
    let reader = TsFileSequenceReader::open(path)?;
    for (device, (start, end)) in reader.device_time_ranges()? {
        resource.update_start_time(&device, start);
        resource.update_end_time(&device, end);
    }
    resource.close(context.partition_interval)?;
    Ok(Arc::new(resource))
}

pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove {:?}: {}", path, e),
    }
}
