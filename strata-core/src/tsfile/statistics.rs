//! Per-page, per-chunk and per-series statistics

use super::{get_f64, get_i32, get_i64, get_string, get_u8, put_string, ensure};
use crate::{Result, Timestamp, TsDataType, TsValue};
use bytes::{Buf, BufMut};

#[derive(Debug, Clone, PartialEq)]
enum ValueStats {
    Boolean {
        first: bool,
        last: bool,
        sum: i64,
    },
    /// INT32 and INT64
    Integer {
        min: i64,
        max: i64,
        first: i64,
        last: i64,
        sum: f64,
    },
    /// FLOAT and DOUBLE
    Float {
        min: f64,
        max: f64,
        first: f64,
        last: f64,
        sum: f64,
    },
    Text {
        first: String,
        last: String,
    },
}

/// Count, time span and value summary of a set of points
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    data_type: TsDataType,
    count: u64,
    start_time: Timestamp,
    end_time: Timestamp,
    values: ValueStats,
}

impl Statistics {
    /// Empty statistics for `data_type`
    pub fn new(data_type: TsDataType) -> Self {
        let values = match data_type {
            TsDataType::Boolean => ValueStats::Boolean {
                first: false,
                last: false,
                sum: 0,
            },
            TsDataType::Int32 | TsDataType::Int64 => ValueStats::Integer {
                min: i64::MAX,
                max: i64::MIN,
                first: 0,
                last: 0,
                sum: 0.0,
            },
            TsDataType::Float | TsDataType::Double => ValueStats::Float {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                first: 0.0,
                last: 0.0,
                sum: 0.0,
            },
            TsDataType::Text => ValueStats::Text {
                first: String::new(),
                last: String::new(),
            },
        };
        Self {
            data_type,
            count: 0,
            start_time: Timestamp::MAX,
            end_time: Timestamp::MIN,
            values,
        }
    }

    /// Account for one point. The value type must match; callers check it.
    pub fn update(&mut self, time: Timestamp, value: &TsValue) {
        let is_first = self.count == 0 || time < self.start_time;
        let is_last = self.count == 0 || time >= self.end_time;

        match (&mut self.values, value) {
            (ValueStats::Boolean { first, last, sum }, TsValue::Boolean(v)) => {
                if is_first {
                    *first = *v;
                }
                if is_last {
                    *last = *v;
                }
                *sum += i64::from(*v);
            }
            (
                ValueStats::Integer { min, max, first, last, sum },
                TsValue::Int32(_) | TsValue::Int64(_),
            ) => {
                let v = match value {
                    TsValue::Int32(v) => i64::from(*v),
                    TsValue::Int64(v) => *v,
                    _ => 0,
                };
                *min = (*min).min(v);
                *max = (*max).max(v);
                if is_first {
                    *first = v;
                }
                if is_last {
                    *last = v;
                }
                *sum += v as f64;
            }
            (
                ValueStats::Float { min, max, first, last, sum },
                TsValue::Float(_) | TsValue::Double(_),
            ) => {
                let v = value.as_f64().unwrap_or_default();
                *min = min.min(v);
                *max = max.max(v);
                if is_first {
                    *first = v;
                }
                if is_last {
                    *last = v;
                }
                *sum += v;
            }
            (ValueStats::Text { first, last }, TsValue::Text(v)) => {
                if is_first {
                    *first = v.clone();
                }
                if is_last {
                    *last = v.clone();
                }
            }
            _ => return,
        }

        self.count += 1;
        self.start_time = self.start_time.min(time);
        self.end_time = self.end_time.max(time);
    }

    /// Fold another statistics of the same type into this one
    pub fn merge(&mut self, other: &Statistics) {
        if other.count == 0 || other.data_type != self.data_type {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let other_first = other.start_time < self.start_time;
        let other_last = other.end_time >= self.end_time;

        match (&mut self.values, &other.values) {
            (
                ValueStats::Boolean { first, last, sum },
                ValueStats::Boolean { first: of, last: ol, sum: os },
            ) => {
                if other_first {
                    *first = *of;
                }
                if other_last {
                    *last = *ol;
                }
                *sum += os;
            }
            (
                ValueStats::Integer { min, max, first, last, sum },
                ValueStats::Integer { min: omin, max: omax, first: of, last: ol, sum: os },
            ) => {
                *min = (*min).min(*omin);
                *max = (*max).max(*omax);
                if other_first {
                    *first = *of;
                }
                if other_last {
                    *last = *ol;
                }
                *sum += os;
            }
            (
                ValueStats::Float { min, max, first, last, sum },
                ValueStats::Float { min: omin, max: omax, first: of, last: ol, sum: os },
            ) => {
                *min = min.min(*omin);
                *max = max.max(*omax);
                if other_first {
                    *first = *of;
                }
                if other_last {
                    *last = *ol;
                }
                *sum += os;
            }
            (ValueStats::Text { first, last }, ValueStats::Text { first: of, last: ol }) => {
                if other_first {
                    *first = of.clone();
                }
                if other_last {
                    *last = ol.clone();
                }
            }
            _ => return,
        }

        self.count += other.count;
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);
    }

    pub fn data_type(&self) -> TsDataType {
        self.data_type
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn end_time(&self) -> Timestamp {
        self.end_time
    }

    pub fn min_value(&self) -> Option<TsValue> {
        if self.count == 0 {
            return None;
        }
        match &self.values {
            ValueStats::Integer { min, .. } => Some(self.int_value(*min)),
            ValueStats::Float { min, .. } => Some(self.float_value(*min)),
            _ => None,
        }
    }

    pub fn max_value(&self) -> Option<TsValue> {
        if self.count == 0 {
            return None;
        }
        match &self.values {
            ValueStats::Integer { max, .. } => Some(self.int_value(*max)),
            ValueStats::Float { max, .. } => Some(self.float_value(*max)),
            _ => None,
        }
    }

    pub fn first_value(&self) -> Option<TsValue> {
        if self.count == 0 {
            return None;
        }
        Some(match &self.values {
            ValueStats::Boolean { first, .. } => TsValue::Boolean(*first),
            ValueStats::Integer { first, .. } => self.int_value(*first),
            ValueStats::Float { first, .. } => self.float_value(*first),
            ValueStats::Text { first, .. } => TsValue::Text(first.clone()),
        })
    }

    pub fn last_value(&self) -> Option<TsValue> {
        if self.count == 0 {
            return None;
        }
        Some(match &self.values {
            ValueStats::Boolean { last, .. } => TsValue::Boolean(*last),
            ValueStats::Integer { last, .. } => self.int_value(*last),
            ValueStats::Float { last, .. } => self.float_value(*last),
            ValueStats::Text { last, .. } => TsValue::Text(last.clone()),
        })
    }

    /// Sum of numeric values (count of `true` for booleans)
    pub fn sum(&self) -> Option<f64> {
        match &self.values {
            ValueStats::Boolean { sum, .. } => Some(*sum as f64),
            ValueStats::Integer { sum, .. } | ValueStats::Float { sum, .. } => Some(*sum),
            ValueStats::Text { .. } => None,
        }
    }

    fn int_value(&self, v: i64) -> TsValue {
        if self.data_type == TsDataType::Int32 {
            TsValue::Int32(v as i32)
        } else {
            TsValue::Int64(v)
        }
    }

    fn float_value(&self, v: f64) -> TsValue {
        if self.data_type == TsDataType::Float {
            TsValue::Float(v as f32)
        } else {
            TsValue::Double(v)
        }
    }

    /// Serialize; the data type is not written and must be known to the reader
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64(self.count as i64);
        buf.put_i64(self.start_time);
        buf.put_i64(self.end_time);
        match (&self.values, self.data_type) {
            (ValueStats::Boolean { first, last, sum }, _) => {
                buf.put_u8(u8::from(*first));
                buf.put_u8(u8::from(*last));
                buf.put_i64(*sum);
            }
            (ValueStats::Integer { min, max, first, last, sum }, TsDataType::Int32) => {
                // Empty INT32 statistics carry out-of-range sentinels
                for v in [min, max, first, last] {
                    buf.put_i32((*v).clamp(i32::MIN as i64, i32::MAX as i64) as i32);
                }
                buf.put_f64(*sum);
            }
            (ValueStats::Integer { min, max, first, last, sum }, _) => {
                for v in [min, max, first, last] {
                    buf.put_i64(*v);
                }
                buf.put_f64(*sum);
            }
            (ValueStats::Float { min, max, first, last, sum }, _) => {
                for v in [min, max, first, last] {
                    buf.put_f64(*v);
                }
                buf.put_f64(*sum);
            }
            (ValueStats::Text { first, last }, _) => {
                put_string(buf, first);
                put_string(buf, last);
            }
        }
    }

    /// Deserialize statistics of `data_type`
    pub fn deserialize<B: Buf>(buf: &mut B, data_type: TsDataType) -> Result<Self> {
        let count = get_i64(buf)? as u64;
        let start_time = get_i64(buf)?;
        let end_time = get_i64(buf)?;
        let values = match data_type {
            TsDataType::Boolean => ValueStats::Boolean {
                first: get_u8(buf)? != 0,
                last: get_u8(buf)? != 0,
                sum: get_i64(buf)?,
            },
            TsDataType::Int32 => {
                ensure(buf, 16)?;
                let (min, max, first, last) = (
                    get_i32(buf)? as i64,
                    get_i32(buf)? as i64,
                    get_i32(buf)? as i64,
                    get_i32(buf)? as i64,
                );
                ValueStats::Integer {
                    min,
                    max,
                    first,
                    last,
                    sum: get_f64(buf)?,
                }
            }
            TsDataType::Int64 => ValueStats::Integer {
                min: get_i64(buf)?,
                max: get_i64(buf)?,
                first: get_i64(buf)?,
                last: get_i64(buf)?,
                sum: get_f64(buf)?,
            },
            TsDataType::Float | TsDataType::Double => ValueStats::Float {
                min: get_f64(buf)?,
                max: get_f64(buf)?,
                first: get_f64(buf)?,
                last: get_f64(buf)?,
                sum: get_f64(buf)?,
            },
            TsDataType::Text => ValueStats::Text {
                first: get_string(buf)?,
                last: get_string(buf)?,
            },
        };
        Ok(Self {
            data_type,
            count,
            start_time,
            end_time,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_out_of_order() {
        let mut stats = Statistics::new(TsDataType::Int64);
        stats.update(100, &TsValue::Int64(99));
        stats.update(2, &TsValue::Int64(10_000));
        stats.update(101, &TsValue::Int64(98));

        assert_eq!(stats.count(), 3);
        assert_eq!(stats.start_time(), 2);
        assert_eq!(stats.end_time(), 101);
        assert_eq!(stats.first_value(), Some(TsValue::Int64(10_000)));
        assert_eq!(stats.last_value(), Some(TsValue::Int64(98)));
        assert_eq!(stats.min_value(), Some(TsValue::Int64(98)));
        assert_eq!(stats.max_value(), Some(TsValue::Int64(10_000)));
        assert_eq!(stats.sum(), Some(10_197.0));
    }

    #[test]
    fn test_merge_keeps_first_and_last_by_time() {
        let mut early = Statistics::new(TsDataType::Double);
        early.update(1, &TsValue::Double(1.0));
        early.update(5, &TsValue::Double(-3.0));

        let mut late = Statistics::new(TsDataType::Double);
        late.update(10, &TsValue::Double(7.0));

        let mut merged = late.clone();
        merged.merge(&early);
        assert_eq!(merged.count(), 3);
        assert_eq!(merged.start_time(), 1);
        assert_eq!(merged.end_time(), 10);
        assert_eq!(merged.first_value(), Some(TsValue::Double(1.0)));
        assert_eq!(merged.last_value(), Some(TsValue::Double(7.0)));
        assert_eq!(merged.min_value(), Some(TsValue::Double(-3.0)));

        let mut empty = Statistics::new(TsDataType::Double);
        empty.merge(&merged);
        assert_eq!(empty, merged);
    }

    #[test]
    fn test_serialize_each_type() {
        let samples = [
            TsValue::Boolean(true),
            TsValue::Int32(-7),
            TsValue::Int64(1 << 40),
            TsValue::Float(2.5),
            TsValue::Double(-0.125),
            TsValue::Text("abc".into()),
        ];
        for value in samples {
            let mut stats = Statistics::new(value.data_type());
            stats.update(42, &value);
            let mut buf = Vec::new();
            stats.serialize(&mut buf);
            let restored = Statistics::deserialize(&mut buf.as_slice(), value.data_type()).unwrap();
            assert_eq!(restored, stats);
        }
    }

    #[test]
    fn test_mismatched_value_ignored() {
        let mut stats = Statistics::new(TsDataType::Int32);
        stats.update(1, &TsValue::Text("x".into()));
        assert!(stats.is_empty());
        assert_eq!(stats.first_value(), None);
    }
}
