//! Locates the directory the monitoring agent wrote its records into.
//!
//! Kieker creates one timestamped subdirectory per monitoring controller
//! below its storage path and drops a `kieker.map` file into it. A directory
//! is considered a finished record output as soon as it contains one file
//! with the marker extension.

use crate::errors::TracecapError;
use crate::logging::append_run_log;
use crate::runtime::FileSystem;
use crate::types::RecordDirectory;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;

pub const KIEKER_MAP_FILE_EXTENSION: &str = ".map";

/// Suffix predicate for marker files. Pure data, so a filesystem backend on
/// another host can receive it serialized and evaluate it locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerFilter {
    suffix: String,
}

impl MarkerFilter {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn matches(&self, file_name: &str) -> bool {
        file_name.ends_with(&self.suffix)
    }
}

impl Default for MarkerFilter {
    fn default() -> Self {
        Self::new(KIEKER_MAP_FILE_EXTENSION)
    }
}

/// Return the first qualifying subdirectory of `root`, by name.
pub fn scan(
    fs: &dyn FileSystem,
    root: &Path,
    filter: &MarkerFilter,
) -> Result<Option<RecordDirectory>, TracecapError> {
    let mut candidates = scan_all(fs, root, filter)?;
    if candidates.len() > 1 {
        append_run_log(
            "warn",
            "scanner.multiple_candidates",
            json!({
                "root": root.display().to_string(),
                "candidates": candidates.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
                "selected": candidates[0].name,
            }),
        );
    }
    if candidates.is_empty() {
        return Ok(None);
    }
    Ok(Some(candidates.swap_remove(0)))
}

/// Every immediate subdirectory of `root` holding a marker file, sorted by
/// directory name.
pub fn scan_all(
    fs: &dyn FileSystem,
    root: &Path,
    filter: &MarkerFilter,
) -> Result<Vec<RecordDirectory>, TracecapError> {
    let mut dirs = fs.list_dirs(root).map_err(|e| scan_io(root, e))?;
    dirs.sort();

    let mut found = Vec::new();
    for dir in dirs {
        let mut marker_files = fs.list_matching(&dir, filter).map_err(|e| scan_io(&dir, e))?;
        if marker_files.is_empty() {
            continue;
        }
        marker_files.sort();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        found.push(RecordDirectory {
            path: dir,
            name,
            marker_files,
        });
    }
    Ok(found)
}

fn scan_io(path: &Path, err: TracecapError) -> TracecapError {
    let detail = match err {
        TracecapError::Io(msg) | TracecapError::ScanIo(msg) => msg,
        other => other.to_string(),
    };
    TracecapError::ScanIo(format!("listing {}: {detail}", path.display()))
}
