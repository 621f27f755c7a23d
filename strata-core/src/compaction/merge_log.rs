//! Operation log of a running cross-space merge
//!
//! One line per event, flushed as written:
//!
//! ```text
//! seqFiles
//! <seq path>...
//! unseqFiles
//! <unseq path>...
//! merge start
//! <seq path> start
//! <seq path> end
//! all ts end
//! merge end
//! ```

use crate::resource::TsFileResource;
use crate::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STR_SEQ_FILES: &str = "seqFiles";
pub const STR_UNSEQ_FILES: &str = "unseqFiles";
pub const STR_MERGE_START: &str = "merge start";
pub const STR_START: &str = "start";
pub const STR_END: &str = "end";
pub const STR_ALL_TS_END: &str = "all ts end";
pub const STR_MERGE_END: &str = "merge end";

pub struct MergeLogger {
    path: PathBuf,
    out: BufWriter<File>,
}

impl MergeLogger {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_files(
        &mut self,
        seq: &[Arc<TsFileResource>],
        unseq: &[Arc<TsFileResource>],
    ) -> Result<()> {
        writeln!(self.out, "{}", STR_SEQ_FILES)?;
        for file in seq {
            writeln!(self.out, "{}", file.path().display())?;
        }
        writeln!(self.out, "{}", STR_UNSEQ_FILES)?;
        for file in unseq {
            writeln!(self.out, "{}", file.path().display())?;
        }
        self.flush()
    }

    pub fn log_merge_start(&mut self) -> Result<()> {
        self.line(STR_MERGE_START)
    }

    pub fn log_file_merge_start(&mut self, file: &Path) -> Result<()> {
        self.line(&format!("{} {}", file.display(), STR_START))
    }

    pub fn log_file_merge_end(&mut self, file: &Path) -> Result<()> {
        self.line(&format!("{} {}", file.display(), STR_END))
    }

    pub fn log_all_ts_end(&mut self) -> Result<()> {
        self.line(STR_ALL_TS_END)
    }

    pub fn log_merge_end(&mut self) -> Result<()> {
        self.line(STR_MERGE_END)
    }

    fn line(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{}", text)?;
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeIndexLevel;
    use tempfile::TempDir;

    #[test]
    fn test_log_lines() {
        let dir = TempDir::new().unwrap();
        let seq_path = dir.path().join("1-1-0-0.tsfile");
        let seq = Arc::new(TsFileResource::new(seq_path, true, TimeIndexLevel::Device).unwrap());
        let unseq_path = dir.path().join("2-2-0-0.tsfile");
        let unseq =
            Arc::new(TsFileResource::new(unseq_path, false, TimeIndexLevel::Device).unwrap());

        let mut logger = MergeLogger::create(dir.path().join("merge.log")).unwrap();
        logger.log_files(&[seq.clone()], &[unseq]).unwrap();
        logger.log_merge_start().unwrap();
        logger.log_file_merge_start(seq.path()).unwrap();
        logger.log_file_merge_end(seq.path()).unwrap();
        logger.log_all_ts_end().unwrap();
        logger.log_merge_end().unwrap();

        let text = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], "seqFiles");
        assert_eq!(lines[2], "unseqFiles");
        assert!(lines[5].ends_with("1-1-0-0.tsfile start"));
        assert_eq!(lines[8], "merge end");
    }
}
