//! The three replay stages. Each one is a plain loop over its input that
//! checks the cancel token between items; the session wires them together
//! with bounded channels.

use super::reader::{RecordReader, TraceRecord};
use super::sink::RecordSink;
use crate::errors::TracecapError;
use crate::logging::append_run_log;
use crate::scanner::MarkerFilter;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStage {
    Scan,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayFailure {
    pub stage: ReplayStage,
    pub path: Option<PathBuf>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub directories_scanned: u64,
    pub records_read: u64,
    pub records_forwarded: u64,
    pub failures: Vec<ReplayFailure>,
    /// Set when the session stopped because the sink could not be opened or
    /// lost its connection.
    pub aborted: Option<String>,
}

/// State shared by every stage of one session.
#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub cancel: CancelToken,
    pub stats: Arc<Mutex<ReplayStats>>,
}

impl StageContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> ReplayStats {
        self.stats.lock().expect("stats lock").clone()
    }

    fn update(&self, f: impl FnOnce(&mut ReplayStats)) {
        f(&mut self.stats.lock().expect("stats lock"));
    }

    pub fn fail(&self, stage: ReplayStage, path: Option<&Path>, message: impl Into<String>) {
        let failure = ReplayFailure {
            stage,
            path: path.map(Path::to_path_buf),
            message: message.into(),
        };
        append_run_log(
            "warn",
            "replay.failure",
            json!({
                "stage": failure.stage,
                "path": failure.path.as_ref().map(|p| p.display().to_string()),
                "message": failure.message,
            }),
        );
        self.update(|stats| stats.failures.push(failure));
    }

    /// Record a write failure the sink cannot recover from and stop every
    /// stage.
    pub fn abort(&self, path: Option<&Path>, message: impl Into<String>) {
        let message = message.into();
        self.cancel.cancel();
        self.fail(ReplayStage::Write, path, message.clone());
        self.update(|stats| stats.aborted = Some(message));
    }
}

/// Walk `roots` and emit every directory holding at least one marker file.
/// Entries are visited in name order. Traversal errors are recorded and the
/// walk continues. `emit` returning false stops the stage.
pub fn scan_stage(
    ctx: &StageContext,
    roots: &[PathBuf],
    marker: &MarkerFilter,
    emit: &mut dyn FnMut(PathBuf) -> bool,
) {
    for root in roots {
        for entry in WalkDir::new(root).sort_by_file_name() {
            if ctx.cancelled() {
                return;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    ctx.fail(ReplayStage::Scan, err.path(), err.to_string());
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            match contains_marker(entry.path(), marker) {
                Ok(true) => {
                    ctx.update(|stats| stats.directories_scanned += 1);
                    if !emit(entry.into_path()) {
                        return;
                    }
                }
                Ok(false) => {}
                Err(err) => ctx.fail(ReplayStage::Scan, Some(entry.path()), err.to_string()),
            }
        }
    }
}

fn contains_marker(dir: &Path, marker: &MarkerFilter) -> Result<bool, TracecapError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TracecapError::ScanIo(format!("listing {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| TracecapError::ScanIo(format!("listing {}: {e}", dir.display())))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file && marker.matches(&entry.file_name().to_string_lossy()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Read every record of every incoming directory, in order.
pub fn read_stage(
    ctx: &StageContext,
    reader: &dyn RecordReader,
    dirs: &mut dyn Iterator<Item = PathBuf>,
    emit: &mut dyn FnMut(TraceRecord) -> bool,
) {
    for dir in dirs {
        if ctx.cancelled() {
            return;
        }
        let records = match reader.open(&dir) {
            Ok(records) => records,
            Err(err) => {
                ctx.fail(ReplayStage::Read, Some(&dir), err.to_string());
                continue;
            }
        };
        for record in records {
            if ctx.cancelled() {
                return;
            }
            match record {
                Ok(record) => {
                    ctx.update(|stats| stats.records_read += 1);
                    if !emit(record) {
                        return;
                    }
                }
                Err(err) => ctx.fail(ReplayStage::Read, Some(&dir), err.to_string()),
            }
        }
    }
}

/// Forward records to `sink`. A write error is recorded for its record and
/// the stream goes on, unless the sink has lost its destination: that, or a
/// sink that cannot be opened, aborts the session.
pub fn sink_stage(
    ctx: &StageContext,
    sink: &mut dyn RecordSink,
    records: &mut dyn Iterator<Item = TraceRecord>,
) {
    if let Err(err) = sink.open(&ctx.cancel) {
        ctx.abort(None, err.to_string());
        return;
    }
    for record in records {
        if ctx.cancelled() {
            break;
        }
        match sink.write(&record) {
            Ok(()) => ctx.update(|stats| stats.records_forwarded += 1),
            Err(_) if ctx.cancelled() => break,
            Err(err) if !sink.is_connected() => {
                ctx.abort(Some(&record.file), format!("line {}: {err}", record.line));
                return;
            }
            Err(err) => ctx.fail(
                ReplayStage::Write,
                Some(&record.file),
                format!("line {}: {err}", record.line),
            ),
        }
    }
    if let Err(err) = sink.flush() {
        ctx.fail(ReplayStage::Write, None, err.to_string());
    }
}
