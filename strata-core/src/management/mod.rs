//! Per-partition file lists and their locking protocol
//!
//! Three kinds of lock protect a partition:
//! - `lists`: short-lived lock around list mutation and snapshots
//! - `hot_compaction_lock`: held while merge results are swapped in
//! - `merge_lock`: serializes merge completion against deletes
//!
//! plus the per-file lock of every [`TsFileResource`]. Swapping merged
//! files needs the file locks, the merge lock and the hot compaction lock
//! together. They are taken with try-locks as a group; if any is busy all
//! are released and the attempt repeats after a short random backoff, so
//! no global lock order is required.

use crate::cache::MetadataCaches;
use crate::config::{MERGE_LOG_NAME, MERGING_MODIFICATION_FILE_NAME, SEQUENCE_DIR, UNSEQUENCE_DIR};
use crate::resource::{ModificationFile, TsFileResource};
use crate::Result;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::Rng;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sequence and unsequenced files of a partition, oldest first
#[derive(Default)]
struct FileLists {
    seq: Vec<Arc<TsFileResource>>,
    unseq: Vec<Arc<TsFileResource>>,
}

impl FileLists {
    fn list(&self, seq: bool) -> &Vec<Arc<TsFileResource>> {
        if seq {
            &self.seq
        } else {
            &self.unseq
        }
    }

    fn list_mut(&mut self, seq: bool) -> &mut Vec<Arc<TsFileResource>> {
        if seq {
            &mut self.seq
        } else {
            &mut self.unseq
        }
    }
}

/// All locks needed to swap merged files; released on drop
pub struct CompositeGuard<'a> {
    _files: Vec<RwLockWriteGuard<'a, ()>>,
    _merge: RwLockWriteGuard<'a, ()>,
    _hot: RwLockWriteGuard<'a, ()>,
}

/// Marks a compaction task as running in a partition until dropped
pub struct RunningTask {
    management: Arc<TsFileManagement>,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.management.running_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

/// File lists of one (storage group, time partition)
pub struct TsFileManagement {
    storage_group: String,
    partition: i64,
    dir: PathBuf,
    lists: RwLock<FileLists>,
    hot_compaction_lock: RwLock<()>,
    merge_lock: RwLock<()>,
    unseq_merging: AtomicBool,
    merging_modification: Mutex<Option<Arc<ModificationFile>>>,
    running_tasks: AtomicUsize,
    /// Serializes candidate selection of concurrent scheduler ticks
    selection_lock: Mutex<()>,
    lock_retry_max_backoff: Duration,
}

impl TsFileManagement {
    /// Create the manager and its `sequence/` and `unsequence/` directories
    pub fn new(
        storage_group: impl Into<String>,
        partition: i64,
        dir: impl Into<PathBuf>,
        lock_retry_max_backoff: Duration,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SEQUENCE_DIR))?;
        fs::create_dir_all(dir.join(UNSEQUENCE_DIR))?;
        Ok(Self {
            storage_group: storage_group.into(),
            partition,
            dir,
            lists: RwLock::new(FileLists::default()),
            hot_compaction_lock: RwLock::new(()),
            merge_lock: RwLock::new(()),
            unseq_merging: AtomicBool::new(false),
            merging_modification: Mutex::new(None),
            running_tasks: AtomicUsize::new(0),
            selection_lock: Mutex::new(()),
            lock_retry_max_backoff,
        })
    }

    pub fn storage_group(&self) -> &str {
        &self.storage_group
    }

    pub fn partition(&self) -> i64 {
        self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_dir(&self, seq: bool) -> PathBuf {
        self.dir.join(if seq { SEQUENCE_DIR } else { UNSEQUENCE_DIR })
    }

    pub fn merge_log_path(&self) -> PathBuf {
        self.dir.join(MERGE_LOG_NAME)
    }

    pub fn merging_modification_path(&self) -> PathBuf {
        self.dir.join(MERGING_MODIFICATION_FILE_NAME)
    }

    // ---- list operations ----

    /// Insert `resource`, keeping the list ordered by file name
    pub fn add(&self, resource: Arc<TsFileResource>, seq: bool) {
        let mut lists = self.lists.write();
        let list = lists.list_mut(seq);
        let pos = list.partition_point(|r| r.name() <= resource.name());
        list.insert(pos, resource);
    }

    pub fn add_all(&self, resources: Vec<Arc<TsFileResource>>, seq: bool) {
        for resource in resources {
            self.add(resource, seq);
        }
    }

    pub fn remove(&self, resource: &Arc<TsFileResource>, seq: bool) -> bool {
        let mut lists = self.lists.write();
        let list = lists.list_mut(seq);
        let before = list.len();
        list.retain(|r| !Arc::ptr_eq(r, resource));
        list.len() != before
    }

    pub fn remove_all(&self, resources: &[Arc<TsFileResource>], seq: bool) {
        let mut lists = self.lists.write();
        lists
            .list_mut(seq)
            .retain(|r| !resources.iter().any(|x| Arc::ptr_eq(r, x)));
    }

    pub fn contains(&self, resource: &Arc<TsFileResource>, seq: bool) -> bool {
        self.lists
            .read()
            .list(seq)
            .iter()
            .any(|r| Arc::ptr_eq(r, resource))
    }

    /// Snapshot, oldest first
    pub fn iter(&self, seq: bool) -> Vec<Arc<TsFileResource>> {
        self.lists.read().list(seq).clone()
    }

    /// Snapshot, newest first
    pub fn reverse_iter(&self, seq: bool) -> Vec<Arc<TsFileResource>> {
        let mut files = self.iter(seq);
        files.reverse();
        files
    }

    /// Consistent snapshot of both lists
    pub fn fork(&self) -> (Vec<Arc<TsFileResource>>, Vec<Arc<TsFileResource>>) {
        let lists = self.lists.read();
        (lists.seq.clone(), lists.unseq.clone())
    }

    pub fn size(&self, seq: bool) -> usize {
        self.lists.read().list(seq).len()
    }

    pub fn is_empty(&self, seq: bool) -> bool {
        self.size(seq) == 0
    }

    pub fn clear(&self) {
        let mut lists = self.lists.write();
        lists.seq.clear();
        lists.unseq.clear();
    }

    /// Put `new` where the first of `olds` was and drop `olds`. The caller
    /// holds the [`CompositeGuard`] of `olds`.
    pub fn replace(&self, seq: bool, olds: &[Arc<TsFileResource>], new: Arc<TsFileResource>) {
        let mut lists = self.lists.write();
        let list = lists.list_mut(seq);
        let pos = list
            .iter()
            .position(|r| olds.iter().any(|o| Arc::ptr_eq(r, o)))
            .unwrap_or(list.len());
        list.insert(pos, new);
        list.retain(|r| !olds.iter().any(|o| Arc::ptr_eq(r, o)));
    }

    // ---- locking ----

    /// Take the file locks of `files`, the merge lock and the hot
    /// compaction lock together
    pub fn acquire_composite<'a>(&'a self, files: &'a [Arc<TsFileResource>]) -> CompositeGuard<'a> {
        let started = Instant::now();
        let mut attempts: u64 = 0;
        loop {
            if let Some(guard) = self.try_composite(files) {
                if attempts > 0 {
                    debug!(
                        "Took composite lock of {} files after {} retries in {}ms",
                        files.len(),
                        attempts,
                        started.elapsed().as_millis()
                    );
                }
                return guard;
            }
            attempts += 1;
            self.backoff();
        }
    }

    fn try_composite<'a>(&'a self, files: &'a [Arc<TsFileResource>]) -> Option<CompositeGuard<'a>> {
        let hot = self.hot_compaction_lock.try_write()?;
        let merge = self.merge_lock.try_write()?;
        let mut file_guards = Vec::with_capacity(files.len());
        for file in files {
            file_guards.push(file.lock().try_write()?);
        }
        Some(CompositeGuard {
            _files: file_guards,
            _merge: merge,
            _hot: hot,
        })
    }

    fn backoff(&self) {
        let max = self.lock_retry_max_backoff.as_micros() as u64;
        if max == 0 {
            thread::yield_now();
        } else {
            let micros = rand::thread_rng().gen_range(0..=max);
            thread::sleep(Duration::from_micros(micros));
        }
    }

    /// Lock taken for writing by deletes and merge completion
    pub fn merge_lock(&self) -> &RwLock<()> {
        &self.merge_lock
    }

    /// Held while candidates of this partition are selected
    pub fn selection_lock(&self) -> &Mutex<()> {
        &self.selection_lock
    }

    // ---- compaction state ----

    /// Register a running compaction task until the returned marker drops
    pub fn begin_task(self: &Arc<Self>) -> RunningTask {
        self.running_tasks.fetch_add(1, Ordering::AcqRel);
        RunningTask {
            management: Arc::clone(self),
        }
    }

    pub fn is_compacting(&self) -> bool {
        self.running_tasks.load(Ordering::Acquire) > 0
    }

    pub fn is_unseq_merging(&self) -> bool {
        self.unseq_merging.load(Ordering::Acquire)
    }

    /// Start recording deletes into the merging modification file
    pub fn start_unseq_merge(&self) {
        let _merge = self.merge_lock.write();
        *self.merging_modification.lock() =
            Some(Arc::new(ModificationFile::new(self.merging_modification_path())));
        self.unseq_merging.store(true, Ordering::Release);
    }

    /// Modification file of the running cross-space merge, if any
    pub fn merging_modification(&self) -> Option<Arc<ModificationFile>> {
        self.merging_modification.lock().clone()
    }

    /// Drop merged unsequenced files from the list, invalidate caches and
    /// delete the files
    pub fn remove_unseq_files(&self, files: &[Arc<TsFileResource>], caches: &MetadataCaches) {
        {
            let _merge = self.merge_lock.write();
            self.remove_all(files, false);
            caches.clear();
        }
        for file in files {
            let _guard = file.lock().write();
            if let Err(e) = file.remove() {
                warn!("Cannot remove merged unsequenced file {:?}: {}", file.path(), e);
            }
        }
    }

    /// Complete a cross-space merge: swap every old sequence file for its
    /// replacement, carry over deletes issued during the merge, then drop
    /// the merged unsequenced files and the merge bookkeeping
    pub fn merge_end_action(
        &self,
        replacements: &[(Arc<TsFileResource>, Arc<TsFileResource>)],
        unseq_files: &[Arc<TsFileResource>],
        caches: &MetadataCaches,
    ) -> Result<()> {
        let merging_modification = self.merging_modification();

        for (old, new) in replacements {
            let olds = std::slice::from_ref(old);
            let _guard = self.acquire_composite(olds);

            if let Some(mods) = &merging_modification {
                let deletions: Vec<_> = mods
                    .read_all()?
                    .iter()
                    .map(|d| d.for_any_offset())
                    .collect();
                new.mod_file().append_all(&deletions)?;
            }
            self.replace(true, olds, Arc::clone(new));
            caches.remove_file(old.path());
            if let Err(e) = old.remove() {
                warn!("Cannot remove merged sequence file {:?}: {}", old.path(), e);
            }
        }

        self.remove_unseq_files(unseq_files, caches);

        let _merge = self.merge_lock.write();
        if let Some(mods) = self.merging_modification.lock().take() {
            mods.remove()?;
        }
        self.unseq_merging.store(false, Ordering::Release);
        match fs::remove_file(self.merge_log_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            storage_group = %self.storage_group,
            partition = self.partition,
            "Merge end: {} sequence files replaced, {} unsequenced files removed",
            replacements.len(),
            unseq_files.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeIndexLevel;
    use crate::resource::Deletion;
    use crate::{SeriesPath, TimeRange};
    use tempfile::TempDir;

    fn resource(dir: &Path, name: &str, seq: bool) -> Arc<TsFileResource> {
        let path = dir.join(name);
        fs::write(&path, b"data").unwrap();
        Arc::new(TsFileResource::new(path, seq, TimeIndexLevel::Device).unwrap())
    }

    fn management(dir: &Path) -> Arc<TsFileManagement> {
        Arc::new(TsFileManagement::new("root.sg", 0, dir, Duration::from_millis(1)).unwrap())
    }

    #[test]
    fn test_list_operations() {
        let dir = TempDir::new().unwrap();
        let m = management(dir.path());
        let a = resource(dir.path(), "1-1-0-0.tsfile", true);
        let b = resource(dir.path(), "2-2-0-0.tsfile", true);
        let c = resource(dir.path(), "3-3-0-0.tsfile", true);

        m.add(c.clone(), true);
        m.add_all(vec![b.clone(), a.clone()], true);
        let names: Vec<_> = m.iter(true).iter().map(|r| r.name().version).collect();
        assert_eq!(names, vec![1, 2, 3]);
        assert_eq!(m.reverse_iter(true)[0].name().version, 3);
        assert!(m.contains(&b, true));
        assert!(!m.contains(&b, false));

        let merged = resource(dir.path(), "2-2-1-0.tsfile", true);
        m.replace(true, &[a.clone(), b.clone()], merged.clone());
        let names: Vec<_> = m.iter(true).iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["2-2-1-0.tsfile", "3-3-0-0.tsfile"]);

        assert!(m.remove(&c, true));
        assert!(!m.remove(&c, true));
        let (seq, unseq) = m.fork();
        assert_eq!(seq.len(), 1);
        assert!(unseq.is_empty());
        m.clear();
        assert!(m.is_empty(true));
    }

    #[test]
    fn test_composite_lock_waits_for_busy_file() {
        let dir = TempDir::new().unwrap();
        let m = management(dir.path());
        let file = resource(dir.path(), "1-1-0-0.tsfile", true);

        let reader = file.lock().read();
        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let m = Arc::clone(&m);
            let file = Arc::clone(&file);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let files = [file];
                let _guard = m.acquire_composite(&files);
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(reader);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_merge_end_migrates_deletes() {
        let dir = TempDir::new().unwrap();
        let m = management(dir.path());
        let old = resource(dir.path(), "1-1-0-0.tsfile", true);
        let unseq = resource(dir.path(), "5-5-0-0.tsfile", false);
        m.add(old.clone(), true);
        m.add(unseq.clone(), false);

        m.start_unseq_merge();
        fs::write(m.merge_log_path(), b"seqFiles\n").unwrap();
        let deletion = Deletion::new(SeriesPath::new("root.sg.d0", "s0"), TimeRange::new(0, 9), 12);
        m.merging_modification().unwrap().append(&deletion).unwrap();

        let new = resource(dir.path(), "1-1-0-1.tsfile", true);
        let caches = MetadataCaches::new(true, 16);
        m.merge_end_action(&[(old.clone(), new.clone())], &[unseq.clone()], &caches)
            .unwrap();

        assert_eq!(new.mod_file().read_all().unwrap(), vec![deletion.for_any_offset()]);
        assert!(!m.is_unseq_merging());
        assert!(!m.merge_log_path().exists());
        assert!(!m.merging_modification_path().exists());
        assert!(!old.path().exists());
        assert!(!unseq.path().exists());
        assert!(m.is_empty(false));
        assert_eq!(m.iter(true)[0].name().cross_compaction_count, 1);
    }
}
