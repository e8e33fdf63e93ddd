use super::reader::{LineRecordReader, RecordReader, TraceRecord};
use super::sink::{sink_for_backend, RecordSink};
use super::stages::{
    read_stage, scan_stage, sink_stage, ReplayStage, ReplayStats, StageContext,
};
use crate::errors::TracecapError;
use crate::logging::append_run_log;
use crate::monitoring::WriterBackend;
use crate::scanner::MarkerFilter;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Created,
    Running,
    Aborting,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySettings {
    pub roots: Vec<PathBuf>,
    pub marker: MarkerFilter,
    pub queue_capacity: usize,
}

impl ReplaySettings {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            marker: MarkerFilter::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct Lifecycle {
    state: Mutex<ReplayState>,
    changed: Condvar,
}

impl Lifecycle {
    fn set(&self, next: ReplayState) {
        *self.state.lock().expect("state lock") = next;
        self.changed.notify_all();
    }
}

/// Streams previously captured records from a set of directories into a
/// sink. `run` and `kill` return immediately; the work happens on stage
/// threads owned by the session.
pub struct ReplaySession {
    settings: ReplaySettings,
    reader: Arc<dyn RecordReader>,
    sink: Mutex<Option<Box<dyn RecordSink>>>,
    lifecycle: Arc<Lifecycle>,
    ctx: StageContext,
    coordinator: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReplaySession {
    pub fn new(
        settings: ReplaySettings,
        reader: Arc<dyn RecordReader>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self, TracecapError> {
        if settings.queue_capacity == 0 {
            return Err(TracecapError::InvalidConfig(
                "replay queue capacity must be positive".to_string(),
            ));
        }
        if settings.roots.is_empty() {
            return Err(TracecapError::Validation(
                "replay needs at least one record directory".to_string(),
            ));
        }
        Ok(Self {
            settings,
            reader,
            sink: Mutex::new(Some(sink)),
            lifecycle: Arc::new(Lifecycle {
                state: Mutex::new(ReplayState::Created),
                changed: Condvar::new(),
            }),
            ctx: StageContext::default(),
            coordinator: Mutex::new(None),
        })
    }

    /// Line reader for `record_extension` feeding the sink that matches
    /// `backend`.
    pub fn for_backend(
        settings: ReplaySettings,
        backend: &WriterBackend,
        record_extension: &str,
    ) -> Result<Self, TracecapError> {
        Self::new(
            settings,
            Arc::new(LineRecordReader::new(record_extension)),
            sink_for_backend(backend),
        )
    }

    pub fn state(&self) -> ReplayState {
        *self.lifecycle.state.lock().expect("state lock")
    }

    pub fn stats(&self) -> ReplayStats {
        self.ctx.snapshot()
    }

    pub fn run(&self) -> Result<(), TracecapError> {
        {
            let mut state = self.lifecycle.state.lock().expect("state lock");
            if *state != ReplayState::Created {
                return Err(TracecapError::Replay(
                    "replay session has already been started".to_string(),
                ));
            }
            *state = ReplayState::Running;
        }
        let sink = self
            .sink
            .lock()
            .expect("sink lock")
            .take()
            .ok_or_else(|| TracecapError::Replay("replay sink already consumed".to_string()))?;
        append_run_log(
            "info",
            "replay.session.started",
            json!({
                "roots": self.settings.roots.iter().map(|r| r.display().to_string()).collect::<Vec<_>>(),
                "sink": sink.describe(),
                "queue_capacity": self.settings.queue_capacity,
            }),
        );

        let settings = self.settings.clone();
        let reader = self.reader.clone();
        let ctx = self.ctx.clone();
        let lifecycle = self.lifecycle.clone();
        let handle = thread::spawn(move || {
            run_pipeline(settings, reader, sink, &ctx);
            let stats = ctx.snapshot();
            append_run_log(
                if stats.aborted.is_some() { "error" } else { "info" },
                "replay.session.stopped",
                json!({
                    "directories_scanned": stats.directories_scanned,
                    "records_read": stats.records_read,
                    "records_forwarded": stats.records_forwarded,
                    "failures": stats.failures.len(),
                    "aborted": stats.aborted,
                }),
            );
            lifecycle.set(ReplayState::Stopped);
        });
        *self.coordinator.lock().expect("coordinator lock") = Some(handle);
        Ok(())
    }

    /// Request a stop. Stages finish their current item and exit.
    pub fn kill(&self) -> Result<(), TracecapError> {
        let mut state = self.lifecycle.state.lock().expect("state lock");
        match *state {
            ReplayState::Created => Err(TracecapError::Replay(
                "replay session cannot be killed before it runs".to_string(),
            )),
            ReplayState::Running => {
                *state = ReplayState::Aborting;
                self.ctx.cancel.cancel();
                self.lifecycle.changed.notify_all();
                append_run_log("info", "replay.session.aborting", json!({}));
                Ok(())
            }
            ReplayState::Aborting | ReplayState::Stopped => Ok(()),
        }
    }

    /// Block until the session has stopped and return its final stats.
    pub fn wait(&self) -> Result<ReplayStats, TracecapError> {
        let mut state = self.lifecycle.state.lock().expect("state lock");
        if *state == ReplayState::Created {
            return Err(TracecapError::Replay(
                "replay session has not been started".to_string(),
            ));
        }
        while *state != ReplayState::Stopped {
            state = self.lifecycle.changed.wait(state).expect("state lock");
        }
        drop(state);
        self.join_coordinator();
        Ok(self.stats())
    }

    /// Like `wait`, but gives up after `timeout`. Returns whether the session
    /// stopped in time.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, TracecapError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lifecycle.state.lock().expect("state lock");
        if *state == ReplayState::Created {
            return Err(TracecapError::Replay(
                "replay session has not been started".to_string(),
            ));
        }
        while *state != ReplayState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            state = self
                .lifecycle
                .changed
                .wait_timeout(state, deadline - now)
                .expect("state lock")
                .0;
        }
        drop(state);
        self.join_coordinator();
        Ok(true)
    }

    fn join_coordinator(&self) {
        let handle = self.coordinator.lock().expect("coordinator lock").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplaySession {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
        self.join_coordinator();
    }
}

fn run_pipeline(
    settings: ReplaySettings,
    reader: Arc<dyn RecordReader>,
    mut sink: Box<dyn RecordSink>,
    ctx: &StageContext,
) {
    let (dir_tx, mut dir_rx) = mpsc::channel::<PathBuf>(settings.queue_capacity);
    let (record_tx, mut record_rx) = mpsc::channel::<TraceRecord>(settings.queue_capacity);

    let scan_ctx = ctx.clone();
    let scanner = thread::spawn(move || {
        scan_stage(&scan_ctx, &settings.roots, &settings.marker, &mut |dir| {
            dir_tx.blocking_send(dir).is_ok()
        });
    });

    let read_ctx = ctx.clone();
    let reader_thread = thread::spawn(move || {
        read_stage(
            &read_ctx,
            reader.as_ref(),
            &mut std::iter::from_fn(|| dir_rx.blocking_recv()),
            &mut |record| record_tx.blocking_send(record).is_ok(),
        );
    });

    let sink_ctx = ctx.clone();
    let writer = thread::spawn(move || {
        sink_stage(
            &sink_ctx,
            sink.as_mut(),
            &mut std::iter::from_fn(|| record_rx.blocking_recv()),
        );
    });

    for (stage, handle) in [
        (ReplayStage::Scan, scanner),
        (ReplayStage::Read, reader_thread),
        (ReplayStage::Write, writer),
    ] {
        if handle.join().is_err() {
            ctx.fail(stage, None, "stage thread panicked");
        }
    }
}
