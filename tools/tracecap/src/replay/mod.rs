//! Replay of captured records to a live collector.
//!
//! A session runs three stages on their own threads, connected by bounded
//! queues:
//! 1. **scan** – walk the given roots for directories holding marker files
//! 2. **read** – turn each directory into a stream of opaque records
//! 3. **sink** – forward records to a TCP collector or a file
//!
//! Records keep the order in which the agent wrote them; a failing record is
//! counted and skipped, a sink that cannot be opened stops everything.

pub mod reader;
pub mod session;
pub mod sink;
pub mod stages;

pub use reader::{LineRecordReader, RecordReader, TraceRecord};
pub use session::{ReplaySession, ReplaySettings, ReplayState};
pub use sink::{sink_for_backend, FileRecordSink, RecordSink, TcpRecordSink};
pub use stages::{CancelToken, ReplayFailure, ReplayStage, ReplayStats};
