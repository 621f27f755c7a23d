//! Page-level encodings
//!
//! Timestamps are always Gorilla delta-of-delta encoded. Values use the
//! encoding recorded in the chunk header:
//! - `Gorilla`: XOR of consecutive IEEE-754 bit patterns (FLOAT, DOUBLE)
//! - `DeltaVarint`: zig-zag varint of consecutive differences (INT32, INT64)
//! - `BitPacked`: one bit per value (BOOLEAN)
//! - `Plain`: fixed-width big-endian values, length-prefixed text

mod bitstream;
mod gorilla;

pub use bitstream::{BitReader, BitWriter};
pub use gorilla::{TimeDecoder, TimeEncoder, XorDecoder, XorEncoder};

use crate::{Result, StrataError, TsDataType, TsEncoding, TsValue};
use bytes::{Buf, BufMut};

/// Encode a timestamp column
pub fn encode_times(times: &[i64]) -> Vec<u8> {
    let mut encoder = TimeEncoder::new();
    for t in times {
        encoder.encode(*t);
    }
    encoder.finish()
}

/// Decode `count` timestamps
pub fn decode_times(data: &[u8], count: usize) -> Result<Vec<i64>> {
    TimeDecoder::new(data).decode_all(count)
}

/// Encode a value column; every value must have type `data_type`
pub fn encode_values(
    values: &[TsValue],
    data_type: TsDataType,
    encoding: TsEncoding,
) -> Result<Vec<u8>> {
    if let Some(bad) = values.iter().find(|v| v.data_type() != data_type) {
        return Err(StrataError::TypeMismatch {
            series: "page".into(),
            expected: data_type.to_string(),
            actual: bad.data_type().to_string(),
        });
    }

    match (encoding, data_type) {
        (TsEncoding::Gorilla, TsDataType::Float | TsDataType::Double) => {
            let mut encoder = XorEncoder::new();
            for v in values {
                encoder.encode(float_bits(v));
            }
            Ok(encoder.finish())
        }
        (TsEncoding::DeltaVarint, TsDataType::Int32 | TsDataType::Int64) => {
            let mut out = Vec::with_capacity(values.len() * 2);
            let mut prev = 0i64;
            for v in values {
                let current = int_value(v);
                put_varint(&mut out, zigzag(current.wrapping_sub(prev)));
                prev = current;
            }
            Ok(out)
        }
        (TsEncoding::BitPacked, TsDataType::Boolean) => {
            let mut writer = BitWriter::with_capacity(values.len() / 8 + 1);
            for v in values {
                writer.write_bit(matches!(v, TsValue::Boolean(true)));
            }
            Ok(writer.finish())
        }
        (TsEncoding::Plain, _) => {
            let mut out = Vec::with_capacity(values.len() * 8);
            for v in values {
                match v {
                    TsValue::Boolean(b) => out.put_u8(u8::from(*b)),
                    TsValue::Int32(i) => out.put_i32(*i),
                    TsValue::Int64(i) => out.put_i64(*i),
                    TsValue::Float(f) => out.put_f32(*f),
                    TsValue::Double(d) => out.put_f64(*d),
                    TsValue::Text(s) => {
                        put_varint(&mut out, s.len() as u64);
                        out.put_slice(s.as_bytes());
                    }
                }
            }
            Ok(out)
        }
        _ => Err(StrataError::InvalidFormat(format!(
            "Encoding {:?} does not support {}",
            encoding, data_type
        ))),
    }
}

/// Decode `count` values of `data_type`
pub fn decode_values(
    data: &[u8],
    data_type: TsDataType,
    encoding: TsEncoding,
    count: usize,
) -> Result<Vec<TsValue>> {
    match (encoding, data_type) {
        (TsEncoding::Gorilla, TsDataType::Float) => Ok(XorDecoder::new(data)
            .decode_all(count)?
            .into_iter()
            .map(|bits| TsValue::Float(f32::from_bits(bits as u32)))
            .collect()),
        (TsEncoding::Gorilla, TsDataType::Double) => Ok(XorDecoder::new(data)
            .decode_all(count)?
            .into_iter()
            .map(|bits| TsValue::Double(f64::from_bits(bits)))
            .collect()),
        (TsEncoding::DeltaVarint, TsDataType::Int32 | TsDataType::Int64) => {
            let mut cursor = data;
            let mut values = Vec::with_capacity(count);
            let mut prev = 0i64;
            for _ in 0..count {
                prev = prev.wrapping_add(unzigzag(get_varint(&mut cursor)?));
                values.push(if data_type == TsDataType::Int32 {
                    TsValue::Int32(prev as i32)
                } else {
                    TsValue::Int64(prev)
                });
            }
            Ok(values)
        }
        (TsEncoding::BitPacked, TsDataType::Boolean) => {
            let mut reader = BitReader::new(data);
            (0..count)
                .map(|_| reader.read_bit().map(TsValue::Boolean))
                .collect()
        }
        (TsEncoding::Plain, _) => {
            let mut cursor = data;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(read_plain(&mut cursor, data_type)?);
            }
            Ok(values)
        }
        _ => Err(StrataError::InvalidFormat(format!(
            "Encoding {:?} does not support {}",
            encoding, data_type
        ))),
    }
}

fn read_plain(cursor: &mut &[u8], data_type: TsDataType) -> Result<TsValue> {
    let width = match data_type {
        TsDataType::Boolean => 1,
        TsDataType::Int32 | TsDataType::Float => 4,
        TsDataType::Int64 | TsDataType::Double => 8,
        TsDataType::Text => 0,
    };
    if cursor.remaining() < width {
        return Err(StrataError::Corruption("Truncated plain page".into()));
    }
    Ok(match data_type {
        TsDataType::Boolean => TsValue::Boolean(cursor.get_u8() != 0),
        TsDataType::Int32 => TsValue::Int32(cursor.get_i32()),
        TsDataType::Int64 => TsValue::Int64(cursor.get_i64()),
        TsDataType::Float => TsValue::Float(cursor.get_f32()),
        TsDataType::Double => TsValue::Double(cursor.get_f64()),
        TsDataType::Text => {
            let len = get_varint(cursor)? as usize;
            if cursor.remaining() < len {
                return Err(StrataError::Corruption("Truncated text value".into()));
            }
            let text = String::from_utf8(cursor[..len].to_vec())
                .map_err(|e| StrataError::Corruption(e.to_string()))?;
            cursor.advance(len);
            TsValue::Text(text)
        }
    })
}

fn float_bits(value: &TsValue) -> u64 {
    match value {
        TsValue::Float(f) => u64::from(f.to_bits()),
        TsValue::Double(d) => d.to_bits(),
        _ => 0,
    }
}

fn int_value(value: &TsValue) -> i64 {
    match value {
        TsValue::Int32(i) => i64::from(*i),
        TsValue::Int64(i) => *i,
        _ => 0,
    }
}

#[inline]
fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Append an unsigned LEB128 varint
pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Read an unsigned LEB128 varint, advancing the cursor
pub fn get_varint(cursor: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !cursor.has_remaining() {
            return Err(StrataError::Corruption("Truncated varint".into()));
        }
        let byte = cursor.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(StrataError::Corruption("Varint too long".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(values: Vec<TsValue>, data_type: TsDataType, encoding: TsEncoding) {
        let data = encode_values(&values, data_type, encoding).unwrap();
        let decoded = decode_values(&data, data_type, encoding, values.len()).unwrap();
        assert_eq!(decoded, values, "{:?} {}", encoding, data_type);
    }

    #[test]
    fn test_default_encodings() {
        check(
            vec![true, false, false, true, true].into_iter().map(TsValue::from).collect(),
            TsDataType::Boolean,
            TsEncoding::BitPacked,
        );
        check(
            vec![i32::MIN, -1, 0, 7, i32::MAX].into_iter().map(TsValue::from).collect(),
            TsDataType::Int32,
            TsEncoding::DeltaVarint,
        );
        check(
            vec![i64::MIN, 10_000, 99, 99, i64::MAX].into_iter().map(TsValue::from).collect(),
            TsDataType::Int64,
            TsEncoding::DeltaVarint,
        );
        check(
            vec![1.5f32, -2.25, 1.5, f32::MAX].into_iter().map(TsValue::from).collect(),
            TsDataType::Float,
            TsEncoding::Gorilla,
        );
        check(
            vec!["", "abc", "ünïcødé"].into_iter().map(TsValue::from).collect(),
            TsDataType::Text,
            TsEncoding::Plain,
        );
    }

    #[test]
    fn test_plain_numeric() {
        check(
            vec![1.0f64, 2.0, -3.5].into_iter().map(TsValue::from).collect(),
            TsDataType::Double,
            TsEncoding::Plain,
        );
    }

    #[test]
    fn test_mixed_types_rejected() {
        let values = vec![TsValue::Int64(1), TsValue::Double(2.0)];
        let err = encode_values(&values, TsDataType::Int64, TsEncoding::DeltaVarint).unwrap_err();
        assert!(matches!(err, StrataError::TypeMismatch { .. }));
        assert!(encode_values(&[], TsDataType::Text, TsEncoding::Gorilla).is_err());
    }

    #[test]
    fn test_truncated_varint() {
        let mut cursor: &[u8] = &[0x80, 0x80];
        assert!(get_varint(&mut cursor).is_err());
    }
}
