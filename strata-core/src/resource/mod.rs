//! TsFile resources: the in-memory handle of one data file
//!
//! A resource tracks the file's lifecycle flags, its time index, its
//! modification file and the lock that guards its replacement or removal.
//! Closed resources persist their time index in a `.resource` sidecar.

mod modification;
mod time_index;

pub use modification::{Deletion, ModificationFile};
pub use time_index::{time_partition, DeviceTimeIndex, FileTimeIndex, TimeIndex};

use crate::config::{TimeIndexLevel, MODS_SUFFIX, RESOURCE_SUFFIX, TSFILE_SUFFIX};
use crate::tsfile::TsFileSequenceReader;
use crate::{Result, StrataError, Timestamp};
use parking_lot::{RwLock, RwLockReadGuard};
use regex::{Captures, Regex};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Parsed `{create_ms}-{version}-{inner}-{cross}.tsfile` file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TsFileName {
    pub time: i64,
    pub version: u64,
    pub inner_compaction_count: u32,
    pub cross_compaction_count: u32,
}

impl TsFileName {
    pub fn new(time: i64, version: u64) -> Self {
        Self {
            time,
            version,
            inner_compaction_count: 0,
            cross_compaction_count: 0,
        }
    }

    pub fn parse(file_name: &str) -> Result<Self> {
        let pattern = Regex::new(r"^(\d+)-(\d+)-(\d+)-(\d+)\.tsfile$")
            .map_err(|e| StrataError::Internal(e.to_string()))?;
        let captures = pattern.captures(file_name).ok_or_else(|| {
            StrataError::InvalidFormat(format!("Not a TsFile name: {}", file_name))
        })?;
        Ok(Self {
            time: parse_field(&captures, 1, file_name)?,
            version: parse_field(&captures, 2, file_name)?,
            inner_compaction_count: parse_field(&captures, 3, file_name)?,
            cross_compaction_count: parse_field(&captures, 4, file_name)?,
        })
    }

    /// Name of the file produced by an inner-space compaction of this one
    pub fn next_inner(&self) -> Self {
        Self {
            inner_compaction_count: self.inner_compaction_count + 1,
            ..*self
        }
    }

    /// Name of the file produced by a cross-space compaction of this one
    pub fn next_cross(&self) -> Self {
        Self {
            cross_compaction_count: self.cross_compaction_count + 1,
            ..*self
        }
    }
}

impl fmt::Display for TsFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}{}",
            self.time,
            self.version,
            self.inner_compaction_count,
            self.cross_compaction_count,
            TSFILE_SUFFIX
        )
    }
}

fn parse_field<T: FromStr>(captures: &Captures<'_>, i: usize, file_name: &str) -> Result<T> {
    captures
        .get(i)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| StrataError::InvalidFormat(format!("Bad number in {}", file_name)))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Handle of one data file
pub struct TsFileResource {
    path: PathBuf,
    name: TsFileName,
    sequence: bool,
    time_index: RwLock<TimeIndex>,
    closed: AtomicBool,
    merging: AtomicBool,
    deleted: AtomicBool,
    file_size: AtomicU64,
    mod_file: ModificationFile,
    lock: RwLock<()>,
}

impl fmt::Debug for TsFileResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsFileResource")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .field("merging", &self.is_merging())
            .finish()
    }
}

impl TsFileResource {
    /// Resource of a file that is still being written
    pub fn new(path: impl Into<PathBuf>, sequence: bool, level: TimeIndexLevel) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StrataError::InvalidFormat(format!("Bad file path {:?}", path)))?;
        let name = TsFileName::parse(file_name)?;
        let mod_file = ModificationFile::new(with_suffix(&path, MODS_SUFFIX));
        Ok(Self {
            path,
            name,
            sequence,
            time_index: RwLock::new(TimeIndex::new(level)),
            closed: AtomicBool::new(false),
            merging: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            file_size: AtomicU64::new(0),
            mod_file,
            lock: RwLock::new(()),
        })
    }

    /// Resource of a closed file, from its sidecar or, failing that, by
    /// reading the file itself
    pub fn load(path: impl Into<PathBuf>, sequence: bool, level: TimeIndexLevel) -> Result<Self> {
        let resource = Self::new(path, sequence, level)?;
        let sidecar = resource.resource_path();
        let time_index = match fs::read(&sidecar) {
            Ok(data) => TimeIndex::deserialize(&data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{:?} has no resource file, rebuilding from data", resource.path);
                let rebuilt = resource.rebuild_time_index(level)?;
                fs::write(&sidecar, rebuilt.serialize()?)?;
                rebuilt
            }
            Err(e) => return Err(e.into()),
        };
        *resource.time_index.write() = time_index;
        resource.refresh_file_size()?;
        resource.closed.store(true, Ordering::Release);
        Ok(resource)
    }

    fn rebuild_time_index(&self, level: TimeIndexLevel) -> Result<TimeIndex> {
        let reader = TsFileSequenceReader::open(&self.path)?;
        let mut index = TimeIndex::new(level);
        for (device, (start, end)) in reader.device_time_ranges()? {
            index.update_start_time(&device, start);
            index.update_end_time(&device, end);
        }
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> TsFileName {
        self.name
    }

    pub fn is_sequence(&self) -> bool {
        self.sequence
    }

    pub fn resource_path(&self) -> PathBuf {
        with_suffix(&self.path, RESOURCE_SUFFIX)
    }

    pub fn mod_file(&self) -> &ModificationFile {
        &self.mod_file
    }

    /// Lock guarding replacement and removal of the file
    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn time_index(&self) -> RwLockReadGuard<'_, TimeIndex> {
        self.time_index.read()
    }

    pub fn update_time(&self, device: &str, time: Timestamp) {
        self.time_index.write().update(device, time);
    }

    pub fn update_start_time(&self, device: &str, time: Timestamp) {
        self.time_index.write().update_start_time(device, time);
    }

    pub fn update_end_time(&self, device: &str, time: Timestamp) {
        self.time_index.write().update_end_time(device, time);
    }

    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        self.time_index.read().start_time(device)
    }

    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        self.time_index.read().end_time(device)
    }

    pub fn devices(&self) -> Vec<String> {
        self.time_index.read().devices()
    }

    pub fn contains_device(&self, device: &str) -> bool {
        self.time_index.read().contains_device(device)
    }

    /// True if the file may hold data at or after `lower_bound`
    pub fn still_lives(&self, lower_bound: Timestamp) -> bool {
        self.time_index.read().still_lives(lower_bound)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub fn refresh_file_size(&self) -> Result<u64> {
        let size = fs::metadata(&self.path)?.len();
        self.file_size.store(size, Ordering::Release);
        Ok(size)
    }

    /// Number of delete markers recorded against the file
    pub fn mod_entry_count(&self) -> Result<usize> {
        Ok(self.mod_file.read_all()?.len())
    }

    /// Time partition of the file; sequence files must not span partitions
    pub fn time_partition_with_check(&self, partition_interval: i64) -> Result<Option<i64>> {
        self.time_index
            .read()
            .time_partition_with_check(partition_interval)
    }

    /// Mark the file closed and write its sidecar. Sequence files are
    /// checked to lie in a single partition first.
    pub fn close(&self, partition_interval: i64) -> Result<()> {
        if self.sequence {
            self.time_partition_with_check(partition_interval)?;
        }
        self.serialize()?;
        self.refresh_file_size()?;
        self.closed.store(true, Ordering::Release);
        debug!("Closed resource {:?}", self.path);
        Ok(())
    }

    /// Write the time index sidecar
    pub fn serialize(&self) -> Result<()> {
        let data = self.time_index.read().serialize()?;
        let tmp = with_suffix(&self.resource_path(), ".tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, self.resource_path())?;
        Ok(())
    }

    /// Delete the data file, its sidecar and its modification file. The
    /// caller holds the write side of [`Self::lock`].
    pub fn remove(&self) -> Result<()> {
        self.deleted.store(true, Ordering::Release);
        for path in [self.path.clone(), self.resource_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.mod_file.remove()
    }
}
