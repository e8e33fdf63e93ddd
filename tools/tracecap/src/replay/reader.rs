use crate::errors::TracecapError;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

pub const DEFAULT_RECORD_FILE_EXTENSION: &str = ".dat";

/// One opaque record as written by the agent. The payload is never decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub directory: PathBuf,
    pub file: PathBuf,
    /// 1-based line within `file`.
    pub line: usize,
    pub payload: String,
}

pub type RecordIter = Box<dyn Iterator<Item = Result<TraceRecord, TracecapError>> + Send>;

pub trait RecordReader: Send + Sync {
    /// Records of one record directory, in file order.
    fn open(&self, dir: &Path) -> Result<RecordIter, TracecapError>;
}

/// Reads every file ending in `extension`, sorted by name, treating each
/// non-empty line as one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecordReader {
    extension: String,
}

impl LineRecordReader {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    fn record_files(&self, dir: &Path) -> Result<Vec<PathBuf>, TracecapError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| TracecapError::Replay(format!("reading {}: {e}", dir.display())))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| TracecapError::Replay(format!("reading {}: {e}", dir.display())))?;
            let path = entry.path();
            let matches = path.is_file()
                && path
                    .file_name()
                    .map(|name| name.to_string_lossy().ends_with(&self.extension))
                    .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Default for LineRecordReader {
    fn default() -> Self {
        Self::new(DEFAULT_RECORD_FILE_EXTENSION)
    }
}

impl RecordReader for LineRecordReader {
    fn open(&self, dir: &Path) -> Result<RecordIter, TracecapError> {
        Ok(Box::new(LineRecords {
            directory: dir.to_path_buf(),
            pending: self.record_files(dir)?.into(),
            current: None,
        }))
    }
}

struct OpenFile {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line: usize,
}

struct LineRecords {
    directory: PathBuf,
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
}

impl Iterator for LineRecords {
    type Item = Result<TraceRecord, TracecapError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Some(current) = self.current.as_mut() else {
                let path = self.pending.pop_front()?;
                match File::open(&path) {
                    Ok(file) => {
                        self.current = Some(OpenFile {
                            path,
                            lines: BufReader::new(file).lines(),
                            line: 0,
                        });
                        continue;
                    }
                    Err(e) => {
                        return Some(Err(TracecapError::Replay(format!(
                            "opening {}: {e}",
                            path.display()
                        ))))
                    }
                }
            };

            match current.lines.next() {
                Some(Ok(payload)) => {
                    current.line += 1;
                    if payload.trim().is_empty() {
                        continue;
                    }
                    return Some(Ok(TraceRecord {
                        directory: self.directory.clone(),
                        file: current.path.clone(),
                        line: current.line,
                        payload,
                    }));
                }
                Some(Err(e)) => {
                    // The rest of a broken file is unreadable; skip to the next one.
                    let err = TracecapError::Replay(format!(
                        "{} line {}: {e}",
                        current.path.display(),
                        current.line + 1
                    ));
                    self.current = None;
                    return Some(Err(err));
                }
                None => self.current = None,
            }
        }
    }
}
