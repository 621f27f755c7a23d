//! Bit-level I/O for the page encoders

use crate::{Result, StrataError};

/// Bit writer, most significant bit first
#[derive(Debug, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    bit_position: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with capacity hint
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Write a single bit
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1 << (7 - self.bit_position);
        }
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.buffer.push(self.current_byte);
            self.current_byte = 0;
            self.bit_position = 0;
        }
    }

    /// Write the low `num_bits` bits of `value`
    #[inline]
    pub fn write_bits(&mut self, value: u64, num_bits: usize) {
        debug_assert!(num_bits <= 64);

        let mut remaining = num_bits;
        // Whole bytes take the fast path once the writer is byte aligned
        while remaining >= 8 && self.bit_position == 0 {
            remaining -= 8;
            self.buffer.push((value >> remaining) as u8);
        }
        for i in (0..remaining).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Finish writing and return the buffer, zero-padded to a byte
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_position > 0 {
            self.buffer.push(self.current_byte);
        }
        self.buffer
    }

    /// Current size in bytes
    pub fn len(&self) -> usize {
        self.buffer.len() + usize::from(self.bit_position > 0)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.bit_position == 0
    }
}

/// Bit reader matching [`BitWriter`]
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_position: 0,
            bit_position: 0,
        }
    }

    /// Read a single bit
    #[inline]
    pub fn read_bit(&mut self) -> Result<bool> {
        let byte = self
            .data
            .get(self.byte_position)
            .ok_or_else(|| StrataError::Corruption("Unexpected end of bit stream".into()))?;

        let bit = (byte >> (7 - self.bit_position)) & 1 == 1;
        self.bit_position += 1;
        if self.bit_position == 8 {
            self.byte_position += 1;
            self.bit_position = 0;
        }
        Ok(bit)
    }

    /// Read `num_bits` bits as an unsigned value
    #[inline]
    pub fn read_bits(&mut self, num_bits: usize) -> Result<u64> {
        debug_assert!(num_bits <= 64);

        let mut value = 0u64;
        let mut remaining = num_bits;
        while remaining >= 8 && self.bit_position == 0 {
            let byte = self
                .data
                .get(self.byte_position)
                .ok_or_else(|| StrataError::Corruption("Unexpected end of bit stream".into()))?;
            value = (value << 8) | u64::from(*byte);
            self.byte_position += 1;
            remaining -= 8;
        }
        for _ in 0..remaining {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Bits consumed so far
    pub fn position(&self) -> usize {
        self.byte_position * 8 + self.bit_position as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_and_aligned_writes() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bits(0b10101, 5);
        writer.write_bits(0xDEAD_BEEF, 32);
        writer.write_bits(0b11, 2);
        // byte aligned here: 1 + 5 + 32 + 2 = 40 bits
        writer.write_bits(0xABCD, 16);
        assert_eq!(writer.len(), 7);

        let data = writer.finish();
        let mut reader = BitReader::new(&data);
        assert!(reader.read_bit().unwrap());
        assert_eq!(reader.read_bits(5).unwrap(), 0b10101);
        assert_eq!(reader.read_bits(32).unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_bits(2).unwrap(), 0b11);
        assert_eq!(reader.read_bits(16).unwrap(), 0xABCD);
        assert_eq!(reader.position(), 56);
    }

    #[test]
    fn test_read_past_end_is_corruption() {
        let mut reader = BitReader::new(&[0xFF]);
        assert_eq!(reader.read_bits(8).unwrap(), 0xFF);
        assert!(reader.read_bit().unwrap_err().is_corruption());
    }
}
