//! MemTable: the mutable in-memory write buffer
//!
//! Points are appended per series without ordering. Sorting happens once,
//! when the buffer is flushed or queried. A MemTable has no internal
//! locking; its owning processor serializes mutation.

use crate::pool::Poolable;
use crate::{Result, StrataError, TimeRange, TimeValuePair, Timestamp, TsDataType, TsValue};
use std::collections::BTreeMap;

/// Append-only time/value list of one series
#[derive(Debug, Clone, PartialEq)]
pub struct TvList {
    data_type: TsDataType,
    times: Vec<Timestamp>,
    values: Vec<TsValue>,
}

impl TvList {
    pub fn new(data_type: TsDataType) -> Self {
        Self {
            data_type,
            times: Vec::new(),
            values: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        data_type: TsDataType,
        times: Vec<Timestamp>,
        values: Vec<TsValue>,
    ) -> Self {
        Self {
            data_type,
            times,
            values,
        }
    }

    pub fn data_type(&self) -> TsDataType {
        self.data_type
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[Timestamp] {
        &self.times
    }

    pub fn values(&self) -> &[TsValue] {
        &self.values
    }

    fn push(&mut self, time: Timestamp, value: TsValue) {
        self.times.push(time);
        self.values.push(value);
    }

    /// Copy sorted by time. The sort is stable, so entries sharing a
    /// timestamp keep their insertion order and the last one is the newest.
    pub fn sorted(&self) -> TvList {
        let mut order: Vec<usize> = (0..self.times.len()).collect();
        order.sort_by_key(|&i| self.times[i]);
        TvList {
            data_type: self.data_type,
            times: order.iter().map(|&i| self.times[i]).collect(),
            values: order.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }

    /// Remove points in `[start, end]`; returns the count and the
    /// accounted size of the removed points
    fn delete(&mut self, start: Timestamp, end: Timestamp) -> (usize, usize) {
        let before = self.times.len();
        let mut kept_times = Vec::with_capacity(before);
        let mut kept_values = Vec::with_capacity(before);
        let mut removed_size = 0;
        for (time, value) in self.times.drain(..).zip(self.values.drain(..)) {
            if time < start || time > end {
                kept_times.push(time);
                kept_values.push(value);
            } else {
                removed_size += point_size(&value);
            }
        }
        self.times = kept_times;
        self.values = kept_values;
        (before - self.times.len(), removed_size)
    }
}

fn point_size(value: &TsValue) -> usize {
    8 + value.size()
}

/// In-memory buffer keyed by device, then measurement
#[derive(Debug)]
pub struct MemTable {
    series: BTreeMap<String, BTreeMap<String, TvList>>,
    version: u64,
    mem_size: usize,
    total_points: usize,
    closed: bool,
    size_threshold: usize,
}

impl MemTable {
    /// Create an empty MemTable that reports full at `size_threshold` bytes
    pub fn new(size_threshold: usize) -> Self {
        Self {
            series: BTreeMap::new(),
            version: 0,
            mem_size: 0,
            total_points: 0,
            closed: false,
            size_threshold,
        }
    }

    /// Append one point
    pub fn insert(
        &mut self,
        device: &str,
        measurement: &str,
        time: Timestamp,
        value: TsValue,
    ) -> Result<()> {
        if self.closed {
            return Err(StrataError::IllegalState(format!(
                "MemTable {} is closed to writes",
                self.version
            )));
        }

        let data_type = value.data_type();
        let list = self
            .series
            .entry(device.to_string())
            .or_default()
            .entry(measurement.to_string())
            .or_insert_with(|| TvList::new(data_type));
        if list.data_type != data_type {
            return Err(StrataError::TypeMismatch {
                series: format!("{}.{}", device, measurement),
                expected: list.data_type.to_string(),
                actual: data_type.to_string(),
            });
        }

        self.mem_size += point_size(&value);
        self.total_points += 1;
        list.push(time, value);
        Ok(())
    }

    /// Append one point per measurement of a device, all at `time`.
    /// Either every value is inserted or none is.
    pub fn insert_record(
        &mut self,
        device: &str,
        time: Timestamp,
        values: &[(String, TsValue)],
    ) -> Result<()> {
        self.check_record(device, values)?;
        for (measurement, value) in values {
            self.insert(device, measurement, time, value.clone())?;
        }
        Ok(())
    }

    /// Type-check a record against the buffered series and against itself
    fn check_record(&self, device: &str, values: &[(String, TsValue)]) -> Result<()> {
        if self.closed {
            return Err(StrataError::IllegalState(format!(
                "MemTable {} is closed to writes",
                self.version
            )));
        }
        let existing = self.series.get(device);
        let mut seen: BTreeMap<&str, TsDataType> = BTreeMap::new();
        for (measurement, value) in values {
            let actual = value.data_type();
            let expected = seen
                .get(measurement.as_str())
                .copied()
                .or_else(|| existing.and_then(|m| m.get(measurement)).map(|l| l.data_type));
            match expected {
                Some(expected) if expected != actual => {
                    return Err(StrataError::TypeMismatch {
                        series: format!("{}.{}", device, measurement),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    seen.insert(measurement.as_str(), actual);
                }
            }
        }
        Ok(())
    }

    /// Points of a series sorted by time, duplicates kept in insertion order
    pub fn sorted_tvlist(&self, device: &str, measurement: &str) -> Option<TvList> {
        self.series
            .get(device)
            .and_then(|m| m.get(measurement))
            .map(TvList::sorted)
    }

    /// Points of a series sorted by time; for a repeated timestamp only the
    /// last inserted value survives
    pub fn sorted_series(&self, device: &str, measurement: &str) -> Vec<TimeValuePair> {
        let list = match self.sorted_tvlist(device, measurement) {
            Some(list) => list,
            None => return Vec::new(),
        };
        let mut points: Vec<TimeValuePair> = Vec::with_capacity(list.len());
        for (time, value) in list.times.into_iter().zip(list.values) {
            match points.last_mut() {
                Some(last) if last.0 == time => last.1 = value,
                _ => points.push((time, value)),
            }
        }
        points
    }

    /// Deduplicated points of a series inside `range`
    pub fn query(
        &self,
        device: &str,
        measurement: &str,
        range: &TimeRange,
    ) -> Vec<TimeValuePair> {
        let mut points = self.sorted_series(device, measurement);
        points.retain(|(time, _)| range.contains(*time));
        points
    }

    /// Remove points of a series in `[start, end]`; returns how many were removed
    pub fn delete(
        &mut self,
        device: &str,
        measurement: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> usize {
        let (removed, removed_size) = self
            .series
            .get_mut(device)
            .and_then(|m| m.get_mut(measurement))
            .map_or((0, 0), |list| list.delete(start, end));
        self.total_points -= removed;
        self.mem_size -= removed_size;
        removed
    }

    pub fn devices(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    pub fn measurements(&self, device: &str) -> Vec<String> {
        self.series
            .get(device)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn data_type(&self, device: &str, measurement: &str) -> Option<TsDataType> {
        self.series
            .get(device)
            .and_then(|m| m.get(measurement))
            .map(|list| list.data_type)
    }

    pub fn series_count(&self) -> usize {
        self.series.values().map(|m| m.len()).sum()
    }

    /// Approximate memory held by buffered points
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn is_empty(&self) -> bool {
        self.total_points == 0
    }

    pub fn is_full(&self) -> bool {
        self.mem_size >= self.size_threshold
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Refuse further writes; the buffer is about to be flushed
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub fn set_size_threshold(&mut self, size_threshold: usize) {
        self.size_threshold = size_threshold;
    }

    /// Drop every point and reopen the buffer for writes
    pub fn clear(&mut self) {
        self.series.clear();
        self.version = 0;
        self.mem_size = 0;
        self.total_points = 0;
        self.closed = false;
    }
}

impl Poolable for MemTable {
    fn reset(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_inserted_value_wins() {
        let mut memtable = MemTable::new(1 << 20);
        memtable.insert("root.vehicle.d0", "s0", 100, TsValue::Int32(99)).unwrap();
        memtable.insert("root.vehicle.d0", "s0", 101, TsValue::Int32(99)).unwrap();
        memtable.insert("root.vehicle.d0", "s0", 2, TsValue::Int32(198)).unwrap();
        memtable.insert("root.vehicle.d0", "s0", 2, TsValue::Int32(10000)).unwrap();

        let points = memtable.sorted_series("root.vehicle.d0", "s0");
        assert_eq!(
            points,
            vec![
                (2, TsValue::Int32(10000)),
                (100, TsValue::Int32(99)),
                (101, TsValue::Int32(99)),
            ]
        );

        let sorted = memtable.sorted_tvlist("root.vehicle.d0", "s0").unwrap();
        assert_eq!(sorted.times(), &[2, 2, 100, 101]);
        assert_eq!(sorted.values()[1], TsValue::Int32(10000));
        assert_eq!(memtable.total_points(), 4);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut memtable = MemTable::new(1 << 20);
        memtable.insert("root.sg.d0", "s0", 1, TsValue::Double(1.0)).unwrap();
        let err = memtable
            .insert("root.sg.d0", "s0", 2, TsValue::Text("x".into()))
            .unwrap_err();
        assert!(matches!(err, StrataError::TypeMismatch { .. }));
        assert_eq!(memtable.total_points(), 1);
    }

    #[test]
    fn test_closed_memtable_rejects_writes() {
        let mut memtable = MemTable::new(1 << 20);
        memtable.mark_closed();
        assert!(memtable.insert("root.sg.d0", "s0", 1, TsValue::Int64(1)).is_err());
    }

    #[test]
    fn test_full_and_reset() {
        let mut memtable = MemTable::new(64);
        for t in 0..4 {
            memtable
                .insert_record(
                    "root.sg.d0",
                    t,
                    &[
                        ("s0".to_string(), TsValue::Int64(t)),
                        ("s1".to_string(), TsValue::Boolean(true)),
                    ],
                )
                .unwrap();
        }
        assert!(memtable.is_full());
        assert_eq!(memtable.series_count(), 2);
        assert_eq!(memtable.measurements("root.sg.d0"), vec!["s0", "s1"]);

        memtable.set_version(7);
        memtable.mark_closed();
        memtable.reset();
        assert!(memtable.is_empty());
        assert!(!memtable.is_closed());
        assert_eq!(memtable.version(), 0);
        assert!(memtable.devices().is_empty());
    }

    #[test]
    fn test_delete_range() {
        let mut memtable = MemTable::new(1 << 20);
        for t in 0..10 {
            memtable.insert("root.sg.d0", "s0", t, TsValue::Int64(t)).unwrap();
        }
        assert_eq!(memtable.delete("root.sg.d0", "s0", 3, 5), 3);
        assert_eq!(memtable.delete("root.sg.d0", "missing", 0, 100), 0);
        let times: Vec<_> = memtable
            .query("root.sg.d0", "s0", &TimeRange::all())
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(times, vec![0, 1, 2, 6, 7, 8, 9]);
        assert_eq!(memtable.total_points(), 7);
        assert_eq!(memtable.mem_size(), 7 * 16);

        memtable.delete("root.sg.d0", "s0", 0, 9);
        assert_eq!(memtable.mem_size(), 0);
        assert!(!memtable.is_full());
    }

    #[test]
    fn test_rejected_record_inserts_nothing() {
        let mut memtable = MemTable::new(1 << 20);
        memtable.insert("root.sg.d0", "s2", 1, TsValue::Int64(1)).unwrap();

        // Conflicts with a value earlier in the same record
        let err = memtable
            .insert_record(
                "root.sg.d1",
                10,
                &[
                    ("s0".to_string(), TsValue::Int32(7)),
                    ("s1".to_string(), TsValue::Int32(1)),
                    ("s0".to_string(), TsValue::Double(1.0)),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StrataError::TypeMismatch { .. }));

        // Conflicts with a buffered series
        assert!(memtable
            .insert_record(
                "root.sg.d0",
                2,
                &[
                    ("s0".to_string(), TsValue::Int64(2)),
                    ("s2".to_string(), TsValue::Text("x".into())),
                ],
            )
            .is_err());

        assert_eq!(memtable.total_points(), 1);
        assert_eq!(memtable.mem_size(), 16);
        assert_eq!(memtable.devices(), vec!["root.sg.d0".to_string()]);
        assert_eq!(memtable.measurements("root.sg.d0"), vec!["s2".to_string()]);
    }
}
