//! The streamed results file: one JSON line per test, written when the test starts and
//! rewritten when it ends, so that a crash mid-run leaves evidence of what was running.

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::result::TestResult;

pub const STREAMED_RESULTS_FILENAME: &str = "streamed_results.jsonl";

#[derive(Debug)]
pub struct StreamedResultsWriter {
    path: PathBuf,
    file: File,
    last_offset: u64,
    last_name: Option<String>,
}

impl StreamedResultsWriter {
    /// Opens the file for appending, creating it if needed. Existing records are kept.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file,
            last_offset: 0,
            last_name: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record.
    pub fn write(&mut self, result: &TestResult) -> io::Result<()> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        self.write_line(result)?;
        self.last_offset = offset;
        self.last_name = Some(result.test.name.clone());
        Ok(())
    }

    /// Replaces the record of `result`'s test if it is the last one written, and appends a
    /// new record otherwise.
    pub fn update(&mut self, result: &TestResult) -> io::Result<()> {
        if self.last_name.as_deref() != Some(result.test.name.as_str()) {
            return self.write(result);
        }
        self.file.set_len(self.last_offset)?;
        self.file.seek(SeekFrom::Start(self.last_offset))?;
        self.write_line(result)
    }

    fn write_line(&mut self, result: &TestResult) -> io::Result<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()
    }
}

/// Reads back every record of a streamed results file.
pub fn read_streamed_results(path: &Path) -> io::Result<Vec<TestResult>> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(io::Error::from))
        .collect()
}
