//! Modification files: delete markers kept next to a data file
//!
//! Record format:
//! - 4 bytes: record length (excluding this field)
//! - N bytes: bincode-encoded [`Deletion`]
//! - 4 bytes: CRC32 of the payload

use crate::{Result, SeriesPath, StrataError, TimeRange, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Deletes points of one series inside an inclusive time range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub path: SeriesPath,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Only chunks starting before this offset are affected; chunks
    /// written later already reflect the delete
    pub file_offset: u64,
}

impl Deletion {
    pub fn new(path: SeriesPath, range: TimeRange, file_offset: u64) -> Self {
        Self {
            path,
            start: range.start,
            end: range.end,
            file_offset,
        }
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    /// True if the point `(path, time)` in the chunk at `chunk_offset` is deleted
    pub fn covers(&self, path: &SeriesPath, time: Timestamp, chunk_offset: u64) -> bool {
        &self.path == path && chunk_offset < self.file_offset && self.range().contains(time)
    }

    /// Copy applying to every chunk of whichever file it is moved to
    pub fn for_any_offset(&self) -> Self {
        Self {
            file_offset: u64::MAX,
            ..self.clone()
        }
    }

    fn serialize_with_checksum(&self) -> Result<BytesMut> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        buf.put_u32_le((payload.len() + 4) as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));
        Ok(buf)
    }
}

/// Append-only file of [`Deletion`] records
#[derive(Debug)]
pub struct ModificationFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ModificationFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn append(&self, deletion: &Deletion) -> Result<()> {
        self.append_all(std::slice::from_ref(deletion))
    }

    /// Append records with a single write and sync
    pub fn append_all(&self, deletions: &[Deletion]) -> Result<()> {
        if deletions.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        for deletion in deletions {
            buf.extend_from_slice(&deletion.serialize_with_checksum()?);
        }

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Every record in append order. A torn record at the tail is
    /// ignored; a checksum mismatch before the tail is corruption.
    pub fn read_all(&self) -> Result<Vec<Deletion>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut deletions = Vec::new();
        let mut cursor = &data[..];
        while cursor.has_remaining() {
            if cursor.remaining() < 4 {
                warn!("Ignoring torn record at the end of {:?}", self.path);
                break;
            }
            let len = (&cursor[..4]).get_u32_le() as usize;
            if len < 4 || cursor.remaining() < 4 + len {
                warn!("Ignoring torn record at the end of {:?}", self.path);
                break;
            }
            let payload = &cursor[4..len];
            let expected = (&cursor[len..len + 4]).get_u32_le();
            let actual = crc32fast::hash(payload);
            if expected != actual {
                return Err(StrataError::ChecksumMismatch { expected, actual });
            }
            deletions.push(bincode::deserialize(payload)?);
            cursor.advance(4 + len);
        }
        Ok(deletions)
    }

    pub fn remove(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn deletion(start: i64, end: i64, offset: u64) -> Deletion {
        Deletion::new(SeriesPath::new("root.sg.d0", "s0"), TimeRange::new(start, end), offset)
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mods = ModificationFile::new(dir.path().join("1-1-0-0.tsfile.mods"));
        assert!(mods.read_all().unwrap().is_empty());

        mods.append(&deletion(0, 10, 100)).unwrap();
        mods.append_all(&[deletion(20, 30, u64::MAX), deletion(5, 5, 7)]).unwrap();

        let read = mods.read_all().unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read[1], deletion(20, 30, u64::MAX));

        mods.remove().unwrap();
        assert!(!mods.exists());
        mods.remove().unwrap();
    }

    #[test]
    fn test_torn_tail_and_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.mods");
        let mods = ModificationFile::new(&path);
        mods.append(&deletion(0, 10, 100)).unwrap();

        let mut data = fs::read(&path).unwrap();
        let whole = data.clone();
        data.extend_from_slice(&whole[..whole.len() - 3]);
        fs::write(&path, &data).unwrap();
        assert_eq!(mods.read_all().unwrap().len(), 1);

        let mut corrupt = whole;
        corrupt[6] ^= 0xff;
        fs::write(&path, &corrupt).unwrap();
        assert!(mods.read_all().unwrap_err().is_corruption());
    }

    #[test]
    fn test_covers_respects_offset() {
        let d = deletion(0, 10, 100);
        let path = SeriesPath::new("root.sg.d0", "s0");
        assert!(d.covers(&path, 5, 50));
        assert!(!d.covers(&path, 5, 100));
        assert!(!d.covers(&path, 11, 50));
        assert!(!d.covers(&SeriesPath::new("root.sg.d0", "s1"), 5, 50));
        assert!(d.for_any_offset().covers(&path, 5, 1 << 40));
    }
}
