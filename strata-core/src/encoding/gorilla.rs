//! Gorilla codecs: delta-of-delta timestamps and XOR floating point values

use super::bitstream::{BitReader, BitWriter};
use crate::Result;

/// Delta-of-delta timestamp encoder
pub struct TimeEncoder {
    writer: BitWriter,
    count: usize,
    prev_timestamp: i64,
    prev_delta: i64,
}

impl TimeEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            prev_timestamp: 0,
            prev_delta: 0,
        }
    }

    pub fn encode(&mut self, timestamp: i64) {
        if self.count == 0 {
            self.writer.write_bits(timestamp as u64, 64);
        } else {
            let delta = timestamp.wrapping_sub(self.prev_timestamp);
            let dod = delta.wrapping_sub(self.prev_delta);

            // Regular intervals make the delta-of-delta zero: a single bit
            if dod == 0 {
                self.writer.write_bit(false);
            } else if (-63..=64).contains(&dod) {
                self.writer.write_bits(0b10, 2);
                self.writer.write_bits((dod + 63) as u64, 7);
            } else if (-255..=256).contains(&dod) {
                self.writer.write_bits(0b110, 3);
                self.writer.write_bits((dod + 255) as u64, 9);
            } else if (-2047..=2048).contains(&dod) {
                self.writer.write_bits(0b1110, 4);
                self.writer.write_bits((dod + 2047) as u64, 12);
            } else {
                self.writer.write_bits(0b1111, 4);
                self.writer.write_bits(dod as u64, 64);
            }
            self.prev_delta = delta;
        }
        self.prev_timestamp = timestamp;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

impl Default for TimeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder matching [`TimeEncoder`]
pub struct TimeDecoder<'a> {
    reader: BitReader<'a>,
    decoded: usize,
    prev_timestamp: i64,
    prev_delta: i64,
}

impl<'a> TimeDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            decoded: 0,
            prev_timestamp: 0,
            prev_delta: 0,
        }
    }

    pub fn decode_all(mut self, count: usize) -> Result<Vec<i64>> {
        let mut times = Vec::with_capacity(count);
        for _ in 0..count {
            times.push(self.next()?);
        }
        Ok(times)
    }

    fn next(&mut self) -> Result<i64> {
        if self.decoded == 0 {
            self.prev_timestamp = self.reader.read_bits(64)? as i64;
            self.decoded = 1;
            return Ok(self.prev_timestamp);
        }

        let dod = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            self.reader.read_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(dod);
        self.prev_timestamp = self.prev_timestamp.wrapping_add(delta);
        self.prev_delta = delta;
        self.decoded += 1;
        Ok(self.prev_timestamp)
    }
}

/// XOR encoder over raw IEEE-754 bits; `f32` values are widened bit-wise
pub struct XorEncoder {
    writer: BitWriter,
    count: usize,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl XorEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            prev_bits: 0,
            prev_leading: u32::MAX,
            prev_trailing: 0,
        }
    }

    pub fn encode(&mut self, bits: u64) {
        if self.count == 0 {
            self.writer.write_bits(bits, 64);
            self.prev_bits = bits;
            self.count = 1;
            return;
        }

        let xor = bits ^ self.prev_bits;
        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);
            // The leading count is stored in 5 bits
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            if self.prev_leading != u32::MAX
                && leading >= self.prev_leading
                && trailing >= self.prev_trailing
            {
                self.writer.write_bit(false);
                let meaningful = 64 - self.prev_leading - self.prev_trailing;
                self.writer
                    .write_bits(xor >> self.prev_trailing, meaningful as usize);
            } else {
                self.writer.write_bit(true);
                let meaningful = 64 - leading - trailing;
                self.writer.write_bits(leading as u64, 5);
                // 1..=64 stored as 0..=63
                self.writer.write_bits((meaningful - 1) as u64, 6);
                self.writer.write_bits(xor >> trailing, meaningful as usize);
                self.prev_leading = leading;
                self.prev_trailing = trailing;
            }
        }
        self.prev_bits = bits;
        self.count += 1;
    }

    pub fn finish(self) -> Vec<u8> {
        self.writer.finish()
    }
}

impl Default for XorEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder matching [`XorEncoder`]
pub struct XorDecoder<'a> {
    reader: BitReader<'a>,
    decoded: usize,
    prev_bits: u64,
    prev_leading: u32,
    prev_trailing: u32,
}

impl<'a> XorDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: BitReader::new(data),
            decoded: 0,
            prev_bits: 0,
            prev_leading: 0,
            prev_trailing: 0,
        }
    }

    pub fn decode_all(mut self, count: usize) -> Result<Vec<u64>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.next()?);
        }
        Ok(values)
    }

    fn next(&mut self) -> Result<u64> {
        if self.decoded == 0 {
            self.prev_bits = self.reader.read_bits(64)?;
            self.decoded = 1;
            return Ok(self.prev_bits);
        }

        if self.reader.read_bit()? {
            if self.reader.read_bit()? {
                self.prev_leading = self.reader.read_bits(5)? as u32;
                let meaningful = self.reader.read_bits(6)? as u32 + 1;
                self.prev_trailing = 64 - self.prev_leading - meaningful;
            }
            let meaningful = 64 - self.prev_leading - self.prev_trailing;
            let xor = self.reader.read_bits(meaningful as usize)? << self.prev_trailing;
            self.prev_bits ^= xor;
        }
        self.decoded += 1;
        Ok(self.prev_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_timestamps_compress_to_one_bit() {
        let mut encoder = TimeEncoder::new();
        for i in 0..1000 {
            encoder.encode(1_600_000_000_000 + i * 1000);
        }
        let data = encoder.finish();
        // 8 bytes for the first timestamp, a few for the first delta, then one bit each
        assert!(data.len() < 8 + 12 + 1000 / 8 + 2, "got {} bytes", data.len());

        let times = TimeDecoder::new(&data).decode_all(1000).unwrap();
        assert_eq!(times[0], 1_600_000_000_000);
        assert_eq!(times[999], 1_600_000_000_000 + 999_000);
    }

    #[test]
    fn test_irregular_timestamps() {
        let times = vec![i64::MIN, -5, 0, 3, 70, 71, 400, 5000, 5001, i64::MAX];
        let mut encoder = TimeEncoder::new();
        for t in &times {
            encoder.encode(*t);
        }
        let data = encoder.finish();
        assert_eq!(TimeDecoder::new(&data).decode_all(times.len()).unwrap(), times);
    }

    #[test]
    fn test_xor_values() {
        let values: Vec<f64> = (0..500)
            .map(|i| 20.0 + (i as f64 * 0.1).sin() * 5.0)
            .chain([0.0, -0.0, f64::MAX, f64::MIN_POSITIVE, 1.0, 1.0])
            .collect();
        let mut encoder = XorEncoder::new();
        for v in &values {
            encoder.encode(v.to_bits());
        }
        let data = encoder.finish();
        let decoded = XorDecoder::new(&data).decode_all(values.len()).unwrap();
        let decoded: Vec<f64> = decoded.into_iter().map(f64::from_bits).collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_xor_single_bit_difference() {
        // xor with 63 leading zeros exercises the clamped leading count
        let values = [2u64, 3, 1, u64::MAX, 0];
        let mut encoder = XorEncoder::new();
        for v in values {
            encoder.encode(v);
        }
        let data = encoder.finish();
        assert_eq!(XorDecoder::new(&data).decode_all(5).unwrap(), values);
    }
}
