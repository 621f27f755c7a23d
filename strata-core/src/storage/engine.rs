//! Storage engine - top-level coordinator

use super::{ResourceContext, StorageGroupProcessor};
use crate::compaction::{CompactionDriver, CompactionScheduler};
use crate::config::EngineConfig;
use crate::{Result, SeriesPath, StrataError, TimeRange, TimeValuePair, Timestamp, TsValue};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

type GroupMap = RwLock<HashMap<String, Arc<StorageGroupProcessor>>>;

/// Strata storage engine
pub struct StorageEngine {
    context: Arc<ResourceContext>,
    groups: Arc<GroupMap>,
    scheduler: Arc<CompactionScheduler>,
    driver: Mutex<Option<CompactionDriver>>,
    shut_down: AtomicBool,
}

impl StorageEngine {
    /// Open the engine, loading every storage group found in the data directory
    pub fn open(config: EngineConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let context = Arc::new(ResourceContext::new(config)?);
        let scheduler = Arc::new(CompactionScheduler::new(
            context.config().compaction.clone(),
            context.compaction_context(),
            Arc::clone(context.task_manager()),
        ));

        let engine = Self {
            context,
            groups: Arc::new(RwLock::new(HashMap::new())),
            scheduler,
            driver: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        };
        engine.load_storage_groups()?;

        if engine.context.config().compaction.compaction_interval_ms > 0 {
            let groups = Arc::clone(&engine.groups);
            let scheduler = Arc::clone(&engine.scheduler);
            let driver = CompactionDriver::start(
                engine.context.config().compaction.compaction_interval(),
                move || {
                    schedule_all(&groups, &scheduler);
                },
            )?;
            *engine.driver.lock() = Some(driver);
        }

        info!("Storage engine opened at {:?}", engine.context.config().data_dir);
        Ok(engine)
    }

    fn load_storage_groups(&self) -> Result<()> {
        let data_dir = &self.context.config().data_dir;
        for entry in fs::read_dir(data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            match StorageGroupProcessor::open(name.clone(), Arc::clone(&self.context)) {
                Ok(group) => {
                    self.groups.write().insert(name, Arc::new(group));
                }
                Err(e) => warn!("Failed to load storage group {}: {}", name, e),
            }
        }
        Ok(())
    }

    pub fn context(&self) -> &Arc<ResourceContext> {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        self.context.config()
    }

    /// Names of the known storage groups
    pub fn storage_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn storage_group(&self, name: &str) -> Option<Arc<StorageGroupProcessor>> {
        self.groups.read().get(name).cloned()
    }

    fn group_of(&self, device: &str) -> Result<Option<Arc<StorageGroupProcessor>>> {
        let name = storage_group_name(device, self.context.config().storage_group_level)?;
        Ok(self.storage_group(&name))
    }

    fn group_or_create(&self, device: &str) -> Result<Arc<StorageGroupProcessor>> {
        let name = storage_group_name(device, self.context.config().storage_group_level)?;
        if let Some(group) = self.storage_group(&name) {
            return Ok(group);
        }
        let mut groups = self.groups.write();
        if let Some(group) = groups.get(&name) {
            return Ok(Arc::clone(group));
        }
        let group = Arc::new(StorageGroupProcessor::open(
            name.clone(),
            Arc::clone(&self.context),
        )?);
        groups.insert(name.clone(), Arc::clone(&group));
        info!("Created storage group: {}", name);
        Ok(group)
    }

    fn check_writable(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StrataError::Shutdown);
        }
        if self.context.is_write_rejected() {
            return Err(StrataError::WriteRejected);
        }
        Ok(())
    }

    /// Insert one point
    pub fn insert(&self, path: &SeriesPath, time: Timestamp, value: TsValue) -> Result<()> {
        self.insert_record(&path.device, time, &[(path.measurement.clone(), value)])
    }

    /// Insert one value per measurement of `device`, all at `time`
    pub fn insert_record(
        &self,
        device: &str,
        time: Timestamp,
        values: &[(String, TsValue)],
    ) -> Result<()> {
        self.check_writable()?;
        self.group_or_create(device)?
            .insert_record(device, time, values)
    }

    /// Delete the points of `path` inside `range`
    pub fn delete(&self, path: &SeriesPath, range: TimeRange) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StrataError::Shutdown);
        }
        match self.group_of(&path.device)? {
            Some(group) => group.delete(path, range),
            None => Ok(()),
        }
    }

    /// Raw points of one series in `range`, time-ascending
    pub fn query_series(&self, path: &SeriesPath, range: TimeRange) -> Result<Vec<TimeValuePair>> {
        match self.group_of(&path.device)? {
            Some(group) => group.query(path, range),
            None => Ok(Vec::new()),
        }
    }

    fn groups_snapshot(&self) -> Vec<Arc<StorageGroupProcessor>> {
        self.groups.read().values().cloned().collect()
    }

    /// Flush every working MemTable and wait until the flushes finish
    pub fn flush_all(&self) -> Result<()> {
        let groups = self.groups_snapshot();
        for group in &groups {
            group.async_flush_all();
        }
        while groups.iter().any(|g| g.is_flushing()) {
            if self.context.is_write_rejected() {
                return Err(StrataError::Flush(
                    "a flush failed while flushing all storage groups".into(),
                ));
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Seal the open files of one partition of a storage group
    pub fn close_partition(&self, storage_group: &str, partition: i64) -> Result<()> {
        match self.storage_group(storage_group) {
            Some(group) => group.close_partition(partition),
            None => Ok(()),
        }
    }

    /// Seal every open file
    pub fn close_all(&self) -> Result<()> {
        let mut result = Ok(());
        for group in self.groups_snapshot() {
            if let Err(e) = group.close_all() {
                error!("Closing storage group {} failed: {}", group.name(), e);
                result = Err(e);
            }
        }
        result
    }

    /// Run one compaction tick for every partition. Returns the number of
    /// submitted tasks.
    pub fn schedule_compaction(&self) -> usize {
        schedule_all(&self.groups, &self.scheduler)
    }

    /// Wait until no compaction task is running
    pub fn wait_compaction_idle(&self, timeout: Duration) -> bool {
        self.context.task_manager().wait_until_idle(timeout)
    }

    /// Stop compaction, seal all open files and stop the worker pools
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down storage engine");
        if let Some(driver) = self.driver.lock().take() {
            driver.stop();
        }
        let result = self.close_all();
        self.context.shutdown();
        info!("Storage engine stopped");
        result
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Storage engine shutdown failed: {}", e);
        }
    }
}

fn schedule_all(groups: &GroupMap, scheduler: &CompactionScheduler) -> usize {
    let groups: Vec<_> = groups.read().values().cloned().collect();
    groups
        .iter()
        .flat_map(|group| group.managements())
        .map(|management| scheduler.schedule(&management))
        .sum()
}

/// Storage group of a device: `root` plus the first `level` nodes below it
pub fn storage_group_name(device: &str, level: usize) -> Result<String> {
    let nodes: Vec<&str> = device.split('.').collect();
    if nodes.first() != Some(&"root") || nodes.iter().any(|n| n.is_empty()) {
        return Err(StrataError::InvalidFormat(format!(
            "Device {} is not a path under root",
            device
        )));
    }
    if nodes.len() <= level {
        return Err(StrataError::InvalidFormat(format!(
            "Device {} is shorter than storage group level {}",
            device, level
        )));
    }
    Ok(nodes[..=level].join("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> StorageEngine {
        let mut config = EngineConfig::with_data_dir(dir.path());
        config.compaction.compaction_interval_ms = 0;
        StorageEngine::open(config).unwrap()
    }

    #[test]
    fn test_storage_group_name() {
        assert_eq!(storage_group_name("root.vehicle.d0", 1).unwrap(), "root.vehicle");
        assert_eq!(storage_group_name("root.ln.wf01.wt01", 2).unwrap(), "root.ln.wf01");
        assert!(storage_group_name("vehicle.d0", 1).is_err());
        assert!(storage_group_name("root", 1).is_err());
        assert!(storage_group_name("root..d0", 1).is_err());
    }

    #[test]
    fn test_out_of_order_points_in_one_buffer() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let s0 = SeriesPath::new("root.vehicle.d0", "s0");

        engine.insert(&s0, 100, TsValue::Int32(99)).unwrap();
        engine.insert(&s0, 101, TsValue::Int32(99)).unwrap();
        engine.insert(&s0, 2, TsValue::Int32(10000)).unwrap();
        engine.flush_all().unwrap();

        let points = engine.query_series(&s0, TimeRange::all()).unwrap();
        assert_eq!(
            points,
            vec![
                (2, TsValue::Int32(10000)),
                (100, TsValue::Int32(99)),
                (101, TsValue::Int32(99)),
            ]
        );
        let management = engine.storage_group("root.vehicle").unwrap().management(0).unwrap();
        assert_eq!(management.size(true), 1);
        assert_eq!(management.size(false), 0);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let s0 = SeriesPath::new("root.vehicle.d0", "s0");
        {
            let engine = engine(&dir);
            engine.insert(&s0, 1, TsValue::Double(1.5)).unwrap();
            engine.insert(&s0, 2, TsValue::Double(2.5)).unwrap();
            engine.delete(&s0, TimeRange::new(1, 1)).unwrap();
            engine.shutdown().unwrap();
        }

        let engine = engine(&dir);
        assert_eq!(engine.storage_groups(), vec!["root.vehicle".to_string()]);
        assert_eq!(
            engine.query_series(&s0, TimeRange::all()).unwrap(),
            vec![(2, TsValue::Double(2.5))]
        );
    }

    #[test]
    fn test_writes_rejected_after_shutdown() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        engine.shutdown().unwrap();
        let err = engine
            .insert(&SeriesPath::new("root.sg.d0", "s0"), 1, TsValue::Int64(1))
            .unwrap_err();
        assert!(matches!(err, StrataError::Shutdown));
    }

    #[test]
    fn test_unknown_series_is_empty() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let path = SeriesPath::new("root.none.d0", "s0");
        assert!(engine.query_series(&path, TimeRange::all()).unwrap().is_empty());
        engine.delete(&path, TimeRange::all()).unwrap();
        assert!(engine.storage_groups().is_empty());
    }
}
