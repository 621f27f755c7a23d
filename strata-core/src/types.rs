//! Core types for Strata

use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Data type of a series; fixed by the first value written to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TsDataType {
    Boolean = 0,
    Int32 = 1,
    Int64 = 2,
    Float = 3,
    Double = 4,
    Text = 5,
}

impl TsDataType {
    /// Encoding used for values of this type when nothing else is configured
    pub fn default_encoding(&self) -> TsEncoding {
        match self {
            TsDataType::Boolean => TsEncoding::BitPacked,
            TsDataType::Int32 | TsDataType::Int64 => TsEncoding::DeltaVarint,
            TsDataType::Float | TsDataType::Double => TsEncoding::Gorilla,
            TsDataType::Text => TsEncoding::Plain,
        }
    }
}

impl TryFrom<u8> for TsDataType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TsDataType::Boolean),
            1 => Ok(TsDataType::Int32),
            2 => Ok(TsDataType::Int64),
            3 => Ok(TsDataType::Float),
            4 => Ok(TsDataType::Double),
            5 => Ok(TsDataType::Text),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid data type: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for TsDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TsDataType::Boolean => "BOOLEAN",
            TsDataType::Int32 => "INT32",
            TsDataType::Int64 => "INT64",
            TsDataType::Float => "FLOAT",
            TsDataType::Double => "DOUBLE",
            TsDataType::Text => "TEXT",
        };
        f.write_str(name)
    }
}

/// Value encoding applied inside a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TsEncoding {
    /// Length-prefixed raw bytes
    Plain = 0,
    /// Gorilla XOR for floating point values
    Gorilla = 1,
    /// Zig-zag delta varints for integers
    DeltaVarint = 2,
    /// One bit per boolean
    BitPacked = 3,
}

impl TryFrom<u8> for TsEncoding {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TsEncoding::Plain),
            1 => Ok(TsEncoding::Gorilla),
            2 => Ok(TsEncoding::DeltaVarint),
            3 => Ok(TsEncoding::BitPacked),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid encoding: {}",
                value
            ))),
        }
    }
}

/// Page compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CompressionType {
    Uncompressed = 0,
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = StrataError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionType::Uncompressed),
            1 => Ok(CompressionType::Lz4),
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid compression type: {}",
                value
            ))),
        }
    }
}

/// A single typed value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TsValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Text(String),
}

impl TsValue {
    /// Data type of this value
    pub fn data_type(&self) -> TsDataType {
        match self {
            TsValue::Boolean(_) => TsDataType::Boolean,
            TsValue::Int32(_) => TsDataType::Int32,
            TsValue::Int64(_) => TsDataType::Int64,
            TsValue::Float(_) => TsDataType::Float,
            TsValue::Double(_) => TsDataType::Double,
            TsValue::Text(_) => TsDataType::Text,
        }
    }

    /// Approximate in-memory size in bytes
    pub fn size(&self) -> usize {
        match self {
            TsValue::Boolean(_) => 1,
            TsValue::Int32(_) | TsValue::Float(_) => 4,
            TsValue::Int64(_) | TsValue::Double(_) => 8,
            TsValue::Text(s) => s.len(),
        }
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TsValue::Int32(v) => Some(*v as f64),
            TsValue::Int64(v) => Some(*v as f64),
            TsValue::Float(v) => Some(*v as f64),
            TsValue::Double(v) => Some(*v),
            TsValue::Boolean(_) | TsValue::Text(_) => None,
        }
    }
}

impl fmt::Display for TsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TsValue::Boolean(v) => write!(f, "{}", v),
            TsValue::Int32(v) => write!(f, "{}", v),
            TsValue::Int64(v) => write!(f, "{}", v),
            TsValue::Float(v) => write!(f, "{}", v),
            TsValue::Double(v) => write!(f, "{}", v),
            TsValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for TsValue {
    fn from(v: bool) -> Self {
        TsValue::Boolean(v)
    }
}

impl From<i32> for TsValue {
    fn from(v: i32) -> Self {
        TsValue::Int32(v)
    }
}

impl From<i64> for TsValue {
    fn from(v: i64) -> Self {
        TsValue::Int64(v)
    }
}

impl From<f32> for TsValue {
    fn from(v: f32) -> Self {
        TsValue::Float(v)
    }
}

impl From<f64> for TsValue {
    fn from(v: f64) -> Self {
        TsValue::Double(v)
    }
}

impl From<&str> for TsValue {
    fn from(v: &str) -> Self {
        TsValue::Text(v.to_string())
    }
}

/// A timestamped value
pub type TimeValuePair = (Timestamp, TsValue);

/// Full path of a series: the device plus one measurement
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesPath {
    /// Device id (e.g., "root.vehicle.d0")
    pub device: String,
    /// Measurement id (e.g., "s0")
    pub measurement: String,
}

impl SeriesPath {
    /// Create a new series path
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// Split a full path on its last separator
    pub fn parse(full: &str) -> Result<Self> {
        match full.rsplit_once('.') {
            Some((device, measurement)) if !device.is_empty() && !measurement.is_empty() => {
                Ok(Self::new(device, measurement))
            }
            _ => Err(StrataError::InvalidFormat(format!(
                "Invalid series path: {}",
                full
            ))),
        }
    }
}

impl fmt::Display for SeriesPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

/// Time range for queries and deletions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The range covering every timestamp
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}
