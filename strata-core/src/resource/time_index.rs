//! Per-file time indexes
//!
//! [`DeviceTimeIndex`] keeps an exact range per device. [`FileTimeIndex`]
//! keeps one range for the whole file plus the device set, which is
//! cheaper but answers every device with the file-wide range.

use crate::config::TimeIndexLevel;
use crate::{Result, StrataError, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Exact start/end time of every device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceTimeIndex {
    devices: HashMap<String, usize>,
    start_times: Vec<Timestamp>,
    end_times: Vec<Timestamp>,
}

impl DeviceTimeIndex {
    fn slot(&mut self, device: &str) -> usize {
        if let Some(&i) = self.devices.get(device) {
            return i;
        }
        let i = self.start_times.len();
        self.devices.insert(device.to_string(), i);
        self.start_times.push(Timestamp::MAX);
        self.end_times.push(Timestamp::MIN);
        i
    }
}

/// One range for the whole file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTimeIndex {
    devices: BTreeSet<String>,
    start_time: Timestamp,
    end_time: Timestamp,
}

impl Default for FileTimeIndex {
    fn default() -> Self {
        Self {
            devices: BTreeSet::new(),
            start_time: Timestamp::MAX,
            end_time: Timestamp::MIN,
        }
    }
}

/// Time index of a file, at the configured precision
#[derive(Debug, Clone, PartialEq)]
pub enum TimeIndex {
    Device(DeviceTimeIndex),
    File(FileTimeIndex),
}

impl TimeIndex {
    pub fn new(level: TimeIndexLevel) -> Self {
        match level {
            TimeIndexLevel::Device => TimeIndex::Device(DeviceTimeIndex::default()),
            TimeIndexLevel::File => TimeIndex::File(FileTimeIndex::default()),
        }
    }

    pub fn level(&self) -> TimeIndexLevel {
        match self {
            TimeIndex::Device(_) => TimeIndexLevel::Device,
            TimeIndex::File(_) => TimeIndexLevel::File,
        }
    }

    /// Lower the start time of `device` to `time` if it is earlier
    pub fn update_start_time(&mut self, device: &str, time: Timestamp) {
        match self {
            TimeIndex::Device(index) => {
                let i = index.slot(device);
                index.start_times[i] = index.start_times[i].min(time);
            }
            TimeIndex::File(index) => {
                index.devices.insert(device.to_string());
                index.start_time = index.start_time.min(time);
            }
        }
    }

    /// Raise the end time of `device` to `time` if it is later
    pub fn update_end_time(&mut self, device: &str, time: Timestamp) {
        match self {
            TimeIndex::Device(index) => {
                let i = index.slot(device);
                index.end_times[i] = index.end_times[i].max(time);
            }
            TimeIndex::File(index) => {
                index.devices.insert(device.to_string());
                index.end_time = index.end_time.max(time);
            }
        }
    }

    pub fn update(&mut self, device: &str, time: Timestamp) {
        self.update_start_time(device, time);
        self.update_end_time(device, time);
    }

    pub fn start_time(&self, device: &str) -> Option<Timestamp> {
        match self {
            TimeIndex::Device(index) => index.devices.get(device).map(|&i| index.start_times[i]),
            TimeIndex::File(index) => index.devices.contains(device).then_some(index.start_time),
        }
    }

    pub fn end_time(&self, device: &str) -> Option<Timestamp> {
        match self {
            TimeIndex::Device(index) => index.devices.get(device).map(|&i| index.end_times[i]),
            TimeIndex::File(index) => index.devices.contains(device).then_some(index.end_time),
        }
    }

    pub fn contains_device(&self, device: &str) -> bool {
        match self {
            TimeIndex::Device(index) => index.devices.contains_key(device),
            TimeIndex::File(index) => index.devices.contains(device),
        }
    }

    /// Devices, sorted
    pub fn devices(&self) -> Vec<String> {
        match self {
            TimeIndex::Device(index) => {
                let mut devices: Vec<String> = index.devices.keys().cloned().collect();
                devices.sort();
                devices
            }
            TimeIndex::File(index) => index.devices.iter().cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            TimeIndex::Device(index) => index.devices.is_empty(),
            TimeIndex::File(index) => index.devices.is_empty(),
        }
    }

    /// Earliest start time over all devices
    pub fn min_start_time(&self) -> Option<Timestamp> {
        match self {
            TimeIndex::Device(index) => index.start_times.iter().copied().min(),
            TimeIndex::File(index) => (!index.devices.is_empty()).then_some(index.start_time),
        }
    }

    /// Latest end time over all devices
    pub fn max_end_time(&self) -> Option<Timestamp> {
        match self {
            TimeIndex::Device(index) => index.end_times.iter().copied().max(),
            TimeIndex::File(index) => (!index.devices.is_empty()).then_some(index.end_time),
        }
    }

    /// True if any data of the file ends at or after `lower_bound`
    pub fn still_lives(&self, lower_bound: Timestamp) -> bool {
        if lower_bound == Timestamp::MIN {
            return true;
        }
        self.max_end_time().map_or(false, |end| end >= lower_bound)
    }

    /// The time partition of every range in the index. Ranges spanning
    /// more than one partition are an error; an empty index has none.
    pub fn time_partition_with_check(&self, partition_interval: i64) -> Result<Option<i64>> {
        let mut partition = None;
        for device in self.devices() {
            let (start, end) = match (self.start_time(&device), self.end_time(&device)) {
                (Some(start), Some(end)) if start <= end => (start, end),
                _ => continue,
            };
            for time in [start, end] {
                let p = time_partition(time, partition_interval);
                match partition {
                    None => partition = Some(p),
                    Some(existing) if existing != p => {
                        return Err(StrataError::PartitionViolation(format!(
                            "device {} spans partitions {} and {} ({}..{})",
                            device, existing, p, start, end
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(partition)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = vec![self.level() as u8];
        match self {
            TimeIndex::Device(index) => buf.extend(bincode::serialize(index)?),
            TimeIndex::File(index) => buf.extend(bincode::serialize(index)?),
        }
        Ok(buf)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let (&level, payload) = data
            .split_first()
            .ok_or_else(|| StrataError::Corruption("Empty time index".into()))?;
        match level {
            l if l == TimeIndexLevel::Device as u8 => {
                Ok(TimeIndex::Device(bincode::deserialize(payload)?))
            }
            l if l == TimeIndexLevel::File as u8 => {
                Ok(TimeIndex::File(bincode::deserialize(payload)?))
            }
            other => Err(StrataError::InvalidFormat(format!(
                "Unknown time index type {}",
                other
            ))),
        }
    }
}

/// Partition holding `time`
pub fn time_partition(time: Timestamp, partition_interval: i64) -> i64 {
    time.div_euclid(partition_interval.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_index_is_exact() {
        let mut index = TimeIndex::new(TimeIndexLevel::Device);
        index.update("root.sg.d0", 10);
        index.update("root.sg.d0", 5);
        index.update("root.sg.d1", 100);

        assert_eq!(index.start_time("root.sg.d0"), Some(5));
        assert_eq!(index.end_time("root.sg.d0"), Some(10));
        assert_eq!(index.start_time("root.sg.d1"), Some(100));
        assert_eq!(index.end_time("root.sg.d9"), None);
        assert_eq!(index.max_end_time(), Some(100));
        assert!(index.still_lives(50));
        assert!(!index.still_lives(101));

        let restored = TimeIndex::deserialize(&index.serialize().unwrap()).unwrap();
        assert_eq!(restored, index);
    }

    #[test]
    fn test_file_index_is_coarse() {
        let mut index = TimeIndex::new(TimeIndexLevel::File);
        index.update("root.sg.d0", 10);
        index.update("root.sg.d1", 100);

        assert_eq!(index.start_time("root.sg.d1"), Some(10));
        assert_eq!(index.end_time("root.sg.d0"), Some(100));
        assert_eq!(index.devices(), vec!["root.sg.d0", "root.sg.d1"]);

        let restored = TimeIndex::deserialize(&index.serialize().unwrap()).unwrap();
        assert_eq!(restored.level(), TimeIndexLevel::File);
    }

    #[test]
    fn test_partition_check() {
        let mut index = TimeIndex::new(TimeIndexLevel::Device);
        assert_eq!(index.time_partition_with_check(100).unwrap(), None);

        index.update("root.sg.d0", 110);
        index.update("root.sg.d1", 199);
        assert_eq!(index.time_partition_with_check(100).unwrap(), Some(1));

        index.update("root.sg.d1", 200);
        assert!(matches!(
            index.time_partition_with_check(100),
            Err(StrataError::PartitionViolation(_))
        ));
        assert_eq!(time_partition(-1, 100), -1);
    }
}
