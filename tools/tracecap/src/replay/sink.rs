use super::reader::TraceRecord;
use super::stages::CancelToken;
use crate::errors::TracecapError;
use crate::monitoring::WriterBackend;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const REPLAY_FILE_NAME: &str = "replay.dat";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a single blocked socket write waits before the cancel token is
/// checked again.
pub const WRITE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Destination of replayed records. `open` runs once before the first write;
/// a failure there aborts the whole replay. Writes that can block must give
/// up once `cancel` fires.
pub trait RecordSink: Send {
    fn open(&mut self, _cancel: &CancelToken) -> Result<(), TracecapError> {
        Ok(())
    }
    fn write(&mut self, record: &TraceRecord) -> Result<(), TracecapError>;
    fn flush(&mut self) -> Result<(), TracecapError>;
    /// False once the destination is gone for good and later writes could
    /// only fail the same way.
    fn is_connected(&self) -> bool {
        true
    }
    fn describe(&self) -> String;
}

/// Streams payloads to a collector, one record per line.
pub struct TcpRecordSink {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    cancel: CancelToken,
}

impl TcpRecordSink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            cancel: CancelToken::default(),
        }
    }

    fn connect(&self) -> Result<TcpStream, TracecapError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| TracecapError::Replay(format!("resolving {}: {e}", self.describe())))?;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(TracecapError::Replay(format!(
            "connecting to {}: {}",
            self.describe(),
            last_error.map_or_else(|| "no address resolved".to_string(), |e| e.to_string())
        )))
    }
}

enum SendError {
    Cancelled,
    Io(std::io::Error),
}

/// Write all of `bytes`, retrying after each write timeout until `cancel`
/// fires.
fn send_all(stream: &mut TcpStream, mut bytes: &[u8], cancel: &CancelToken) -> Result<(), SendError> {
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(SendError::Io(ErrorKind::WriteZero.into())),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                if cancel.is_cancelled() {
                    return Err(SendError::Cancelled);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(SendError::Io(e)),
        }
    }
    Ok(())
}

impl RecordSink for TcpRecordSink {
    fn open(&mut self, cancel: &CancelToken) -> Result<(), TracecapError> {
        let stream = self.connect()?;
        stream.set_write_timeout(Some(WRITE_POLL_INTERVAL)).map_err(io_err)?;
        self.stream = Some(stream);
        self.cancel = cancel.clone();
        Ok(())
    }

    fn write(&mut self, record: &TraceRecord) -> Result<(), TracecapError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TracecapError::Replay("tcp sink is not connected".to_string()))?;
        let mut line = String::with_capacity(record.payload.len() + 1);
        line.push_str(&record.payload);
        line.push('\n');
        match send_all(stream, line.as_bytes(), &self.cancel) {
            Ok(()) => Ok(()),
            Err(SendError::Cancelled) => {
                // A record may be half written; the framing cannot be trusted.
                self.stream = None;
                Err(TracecapError::Replay(format!(
                    "cancelled while {} was not reading",
                    self.describe()
                )))
            }
            Err(SendError::Io(e)) => {
                self.stream = None;
                Err(TracecapError::Replay(format!("{}: {e}", self.describe())))
            }
        }
    }

    fn flush(&mut self) -> Result<(), TracecapError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Appends payloads to `<storage_path>/replay.dat`.
pub struct FileRecordSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileRecordSink {
    pub fn new(storage_path: &Path) -> Self {
        Self {
            path: storage_path.join(REPLAY_FILE_NAME),
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for FileRecordSink {
    fn open(&mut self, _cancel: &CancelToken) -> Result<(), TracecapError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TracecapError::Replay(format!("opening {}: {e}", self.path.display())))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(&mut self, record: &TraceRecord) -> Result<(), TracecapError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TracecapError::Replay("file sink is not open".to_string()))?;
        writeln!(writer, "{}", record.payload).map_err(io_err)
    }

    fn flush(&mut self) -> Result<(), TracecapError> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(io_err),
            None => Ok(()),
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub fn sink_for_backend(backend: &WriterBackend) -> Box<dyn RecordSink> {
    match backend {
        WriterBackend::FileWriter { storage_path } => Box::new(FileRecordSink::new(storage_path)),
        WriterBackend::TcpWriter { host, port } => Box::new(TcpRecordSink::new(host.clone(), *port)),
    }
}

fn io_err(e: std::io::Error) -> TracecapError {
    TracecapError::Replay(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn record(payload: &str) -> TraceRecord {
        TraceRecord {
            directory: PathBuf::from("/records"),
            file: PathBuf::from("/records/kieker.dat"),
            line: 1,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = sink_for_backend(&WriterBackend::file(dir.path().join("out")));
        sink.open(&CancelToken::default()).expect("open");
        sink.write(&record("$1;a")).expect("write a");
        sink.write(&record("$1;b")).expect("write b");
        sink.flush().expect("flush");

        let text = std::fs::read_to_string(dir.path().join("out").join(REPLAY_FILE_NAME))
            .expect("replay file");
        assert_eq!(text, "$1;a\n$1;b\n");
    }

    #[test]
    fn tcp_sink_streams_line_framed_payloads() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let collector = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            BufReader::new(stream)
                .lines()
                .collect::<Result<Vec<_>, _>>()
                .expect("lines")
        });

        let mut sink = TcpRecordSink::new("127.0.0.1", port);
        sink.open(&CancelToken::default()).expect("connect");
        sink.write(&record("$1;a")).expect("write");
        sink.write(&record("$1;b")).expect("write");
        sink.flush().expect("flush");
        drop(sink);

        assert_eq!(collector.join().expect("collector"), vec!["$1;a", "$1;b"]);
    }

    #[test]
    fn blocked_write_gives_up_once_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        // Accepts and then never reads.
        let collector = std::thread::spawn(move || listener.accept().expect("accept"));

        let cancel = CancelToken::default();
        let mut sink = TcpRecordSink::new("127.0.0.1", port);
        sink.open(&cancel).expect("connect");
        let _held = collector.join().expect("collector");

        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                cancel.cancel();
            })
        };
        let payload = "x".repeat(64 * 1024);
        let started = std::time::Instant::now();
        let err = loop {
            if let Err(err) = sink.write(&record(&payload)) {
                break err;
            }
            assert!(started.elapsed() < Duration::from_secs(30), "collector never stalled");
        };
        canceller.join().expect("canceller");

        assert!(err.to_string().contains("was not reading"), "{err}");
        assert!(!sink.is_connected());
    }

    #[test]
    fn closed_collector_disconnects_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let collector = std::thread::spawn(move || drop(listener.accept().expect("accept")));

        let mut sink = TcpRecordSink::new("127.0.0.1", port);
        sink.open(&CancelToken::default()).expect("connect");
        collector.join().expect("collector");

        let payload = "y".repeat(1024);
        let mut writes = 0;
        while sink.write(&record(&payload)).is_ok() {
            writes += 1;
            assert!(writes < 100_000, "peer close never surfaced");
        }
        assert!(!sink.is_connected());
        assert!(sink.write(&record("after")).is_err());
    }

    #[test]
    fn writing_before_open_fails() {
        let mut sink = TcpRecordSink::new("127.0.0.1", 1);
        assert!(matches!(
            sink.write(&record("x")),
            Err(TracecapError::Replay(_))
        ));
        assert_eq!(sink.describe(), "tcp://127.0.0.1:1");
    }
}
