use crate::errors::TracecapError;
use crate::runtime::FileSystem;
use crate::types::{EXIT_CODE_KILLED, EXIT_CODE_SUCCESS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const RESULTS_DIR: &str = ".tracecap";
pub const RESULTS_FILE: &str = "instrumentations.jsonl";

/// What the host keeps about a finished instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationRecord {
    pub run_id: String,
    pub run_name: Option<String>,
    pub record_directory_name: String,
    pub application_exit_code: i32,
}

impl InstrumentationRecord {
    pub fn new(
        run_id: impl Into<String>,
        run_name: Option<&str>,
        record_directory_name: impl Into<String>,
        application_exit_code: i32,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            run_name: run_name
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
            record_directory_name: record_directory_name.into(),
            application_exit_code,
        }
    }

    /// 0 and 130 (killed at the deadline) are both expected endings.
    pub fn is_abnormal_exit(&self) -> bool {
        self.application_exit_code != EXIT_CODE_SUCCESS
            && self.application_exit_code != EXIT_CODE_KILLED
    }

    pub fn display_name(&self) -> String {
        match &self.run_name {
            Some(name) => format!("{name} ({})", self.run_id),
            None => self.run_id.clone(),
        }
    }
}

pub trait ResultSink: Send + Sync {
    fn attach(&self, record: &InstrumentationRecord) -> Result<(), TracecapError>;
}

/// Appends records as JSON lines below the workspace.
pub struct JsonlResultStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl JsonlResultStore {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn for_workspace(fs: Arc<dyn FileSystem>, workspace: &Path) -> Self {
        Self::new(fs, workspace.join(RESULTS_DIR).join(RESULTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<InstrumentationRecord>, TracecapError> {
        if !self.fs.exists(&self.path) {
            return Ok(Vec::new());
        }
        let raw = self.fs.read_to_string(&self.path)?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|e| {
                    TracecapError::Io(format!(
                        "{} line {}: {e}",
                        self.path.display(),
                        idx + 1
                    ))
                })
            })
            .collect()
    }
}

impl ResultSink for JsonlResultStore {
    fn attach(&self, record: &InstrumentationRecord) -> Result<(), TracecapError> {
        if let Some(parent) = self.path.parent() {
            self.fs.create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record).map_err(|e| TracecapError::Io(e.to_string()))?;
        self.fs.append_line(&self.path, &line)
    }
}

#[derive(Default, Clone)]
pub struct MemoryResultSink {
    records: Arc<Mutex<Vec<InstrumentationRecord>>>,
}

impl MemoryResultSink {
    pub fn records(&self) -> Vec<InstrumentationRecord> {
        self.records.lock().expect("records lock").clone()
    }
}

impl ResultSink for MemoryResultSink {
    fn attach(&self, record: &InstrumentationRecord) -> Result<(), TracecapError> {
        self.records
            .lock()
            .expect("records lock")
            .push(record.clone());
        Ok(())
    }
}
