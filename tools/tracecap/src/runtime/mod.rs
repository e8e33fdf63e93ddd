use crate::errors::TracecapError;
use crate::scanner::MarkerFilter;
use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Result of a bounded wait. `TimedOut` means the runner killed the process
/// itself once the deadline passed; the output holds whatever was captured
/// up to that point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(ProcessOutput),
    TimedOut(ProcessOutput),
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, TracecapError>;
    fn kill(&self, handle: u64) -> Result<(), TracecapError>;

    /// Wait at most `timeout` for the process to exit, forwarding each
    /// stdout/stderr line as it arrives. On expiry the process is killed and
    /// `WaitOutcome::TimedOut` returned. When an error is returned the
    /// process has already been killed and reaped.
    fn wait_with_timeout(
        &self,
        handle: u64,
        timeout: Duration,
        on_stdout_line: &mut dyn FnMut(&str),
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<WaitOutcome, TracecapError>;
}

/// Workspace access used by the supervisor and the scanner. Implementations
/// may live on the other side of a process or host boundary, so every
/// argument is plain data.
pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, TracecapError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, TracecapError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TracecapError>;
    fn append_line(&self, path: &Path, line: &str) -> Result<(), TracecapError>;
    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), TracecapError>;
    /// Create exactly one directory. Fails if the path already exists.
    fn create_dir(&self, path: &Path) -> Result<(), TracecapError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), TracecapError>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Immediate subdirectories of `dir`, in the order the backend reports them.
    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>, TracecapError>;
    /// Files directly inside `dir` whose name satisfies `filter`.
    fn list_matching(&self, dir: &Path, filter: &MarkerFilter)
        -> Result<Vec<PathBuf>, TracecapError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), TracecapError>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

fn io_err(e: std::io::Error) -> TracecapError {
    TracecapError::Io(e.to_string())
}

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TracecapError> {
        std::fs::read_to_string(path).map_err(io_err)
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, TracecapError> {
        std::fs::read(path).map_err(io_err)
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TracecapError> {
        std::fs::write(path, contents).map_err(io_err)
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), TracecapError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        writeln!(file, "{line}").map_err(io_err)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), TracecapError> {
        std::fs::copy(from, to).map(|_| ()).map_err(io_err)
    }

    fn create_dir(&self, path: &Path) -> Result<(), TracecapError> {
        std::fs::create_dir(path).map_err(io_err)
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TracecapError> {
        std::fs::create_dir_all(path).map_err(io_err)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>, TracecapError> {
        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if entry.file_type().map_err(io_err)?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn list_matching(
        &self,
        dir: &Path,
        filter: &MarkerFilter,
    ) -> Result<Vec<PathBuf>, TracecapError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            if !entry.file_type().map_err(io_err)?.is_file() {
                continue;
            }
            if filter.matches(&entry.file_name().to_string_lossy()) {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
    poll_interval: Duration,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(50))
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
            poll_interval,
        }
    }

    fn take_child(&self, handle: u64) -> Result<std::process::Child, TracecapError> {
        let mut state = self.state.lock().expect("process lock poisoned");
        state
            .children
            .remove(&handle)
            .ok_or_else(|| TracecapError::Process(format!("unknown handle {handle}")))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

fn forward_lines(
    reader: impl Read + Send + 'static,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.split(b'\n') {
            let Ok(bytes) = line else { break };
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string();
            if tx.send((stream, text)).is_err() {
                break;
            }
        }
    });
}

/// The parts of `std::process::Child` the bounded wait relies on.
trait ChildControl {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>>;
    fn kill(&mut self) -> std::io::Result<()>;
    fn wait(&mut self) -> std::io::Result<ExitStatus>;
}

impl ChildControl for std::process::Child {
    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        std::process::Child::try_wait(self)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        std::process::Child::kill(self)
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        std::process::Child::wait(self)
    }
}

fn process_err(e: std::io::Error) -> TracecapError {
    TracecapError::Process(e.to_string())
}

/// Poll `child` until it exits or `deadline` passes, feeding `collector`
/// in between. On error the child is killed and reaped before returning,
/// so it never outlives a failed wait.
fn supervise_child(
    child: &mut dyn ChildControl,
    rx: &mpsc::Receiver<(Stream, String)>,
    deadline: Instant,
    poll_interval: Duration,
    collector: &mut LineCollector<'_>,
) -> Result<WaitOutcome, TracecapError> {
    let result = poll_child(child, rx, deadline, poll_interval, collector);
    if result.is_err() {
        // Already gone is fine here; the poll error is the one to report.
        let _ = child.kill();
        let _ = child.wait();
    }
    result
}

fn poll_child(
    child: &mut dyn ChildControl,
    rx: &mpsc::Receiver<(Stream, String)>,
    deadline: Instant,
    poll_interval: Duration,
    collector: &mut LineCollector<'_>,
) -> Result<WaitOutcome, TracecapError> {
    loop {
        if let Some(status) = child.try_wait().map_err(process_err)? {
            collector.drain(rx, Duration::from_millis(500));
            collector.output.exit_code = exit_code_of(status);
            return Ok(WaitOutcome::Exited(collector.take_output()));
        }

        let now = Instant::now();
        if now >= deadline {
            child.kill().map_err(process_err)?;
            let status = child.wait().map_err(process_err)?;
            collector.drain(rx, Duration::from_millis(100));
            collector.output.exit_code = exit_code_of(status);
            return Ok(WaitOutcome::TimedOut(collector.take_output()));
        }

        let step = poll_interval.min(deadline - now);
        match rx.recv_timeout(step) {
            Ok((stream, line)) => collector.accept(stream, line),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // Both pipes closed; keep polling the child without a busy loop.
            Err(mpsc::RecvTimeoutError::Disconnected) => std::thread::sleep(step),
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

struct LineCollector<'a> {
    output: ProcessOutput,
    on_stdout_line: &'a mut dyn FnMut(&str),
    on_stderr_line: &'a mut dyn FnMut(&str),
}

impl LineCollector<'_> {
    fn take_output(&mut self) -> ProcessOutput {
        std::mem::take(&mut self.output)
    }

    fn accept(&mut self, stream: Stream, line: String) {
        match stream {
            Stream::Stdout => {
                (self.on_stdout_line)(&line);
                self.output.stdout.push_str(&line);
                self.output.stdout.push('\n');
            }
            Stream::Stderr => {
                (self.on_stderr_line)(&line);
                self.output.stderr.push_str(&line);
                self.output.stderr.push('\n');
            }
        }
    }

    /// Pull remaining lines until both pipes close or `grace` runs out.
    /// Grandchildren that inherited the pipes could otherwise keep us here.
    fn drain(&mut self, rx: &mpsc::Receiver<(Stream, String)>, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((stream, line)) => self.accept(stream, line),
                Err(_) => break,
            }
        }
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, TracecapError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| TracecapError::Launch(format!("{}: {e}", request.program)))?;
        let mut state = self.state.lock().expect("process lock poisoned");
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn kill(&self, handle: u64) -> Result<(), TracecapError> {
        let mut child = self.take_child(handle)?;
        let killed = child.kill().map_err(process_err);
        child.wait().map_err(process_err)?;
        killed
    }

    fn wait_with_timeout(
        &self,
        handle: u64,
        timeout: Duration,
        on_stdout_line: &mut dyn FnMut(&str),
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<WaitOutcome, TracecapError> {
        let mut child = self.take_child(handle)?;
        let deadline = Instant::now() + timeout;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let mut collector = LineCollector {
            output: ProcessOutput::default(),
            on_stdout_line,
            on_stderr_line,
        };
        supervise_child(&mut child, &rx, deadline, self.poll_interval, &mut collector)
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), TracecapError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| TracecapError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }
}

/// In-memory filesystem. Directories are tracked explicitly; writing a file
/// does not create its parents.
#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    dirs: Arc<Mutex<BTreeSet<PathBuf>>>,
    fail_next: Arc<Mutex<Option<TracecapError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }

    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let fs = Self::default();
        fs.dirs
            .lock()
            .expect("dirs lock")
            .extend(dirs.into_iter().map(Into::into));
        fs
    }

    pub fn set_fail_next(&self, error: TracecapError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().expect("files lock").get(path).cloned()
    }

    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut paths = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        paths.sort();
        paths
    }

    fn maybe_fail(&self) -> Result<(), TracecapError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, TracecapError> {
        self.maybe_fail()?;
        self.file(path)
            .ok_or_else(|| TracecapError::Io(format!("missing file {}", path.display())))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, TracecapError> {
        self.read_to_string(path).map(String::into_bytes)
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), TracecapError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<(), TracecapError> {
        self.maybe_fail()?;
        let mut files = self.files.lock().expect("files lock");
        let entry = files.entry(path.to_path_buf()).or_default();
        entry.push_str(line);
        entry.push('\n');
        Ok(())
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), TracecapError> {
        let contents = self.read_to_string(from)?;
        self.write_string(to, &contents)
    }

    fn create_dir(&self, path: &Path) -> Result<(), TracecapError> {
        self.maybe_fail()?;
        if self.exists(path) {
            return Err(TracecapError::Io(format!(
                "{} already exists",
                path.display()
            )));
        }
        self.dirs
            .lock()
            .expect("dirs lock")
            .insert(path.to_path_buf());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), TracecapError> {
        self.maybe_fail()?;
        let mut dirs = self.dirs.lock().expect("dirs lock");
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path) || self.is_dir(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.lock().expect("dirs lock").contains(path)
    }

    fn list_dirs(&self, dir: &Path) -> Result<Vec<PathBuf>, TracecapError> {
        self.maybe_fail()?;
        if !self.is_dir(dir) {
            return Err(TracecapError::Io(format!(
                "not a directory: {}",
                dir.display()
            )));
        }
        Ok(self
            .dirs
            .lock()
            .expect("dirs lock")
            .iter()
            .filter(|candidate| candidate.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn list_matching(
        &self,
        dir: &Path,
        filter: &MarkerFilter,
    ) -> Result<Vec<PathBuf>, TracecapError> {
        self.maybe_fail()?;
        let mut matches = self
            .files
            .lock()
            .expect("files lock")
            .keys()
            .filter(|path| path.parent() == Some(dir))
            .filter(|path| {
                path.file_name()
                    .map(|name| filter.matches(&name.to_string_lossy()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect::<Vec<_>>();
        matches.sort();
        Ok(matches)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), TracecapError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

pub type SpawnHook = Arc<dyn Fn(&ProcessRequest) + Send + Sync>;

enum FakeResponse {
    Output(Result<ProcessOutput, TracecapError>),
    Timeout,
}

/// Scripted process runner. Responses are consumed in FIFO order by
/// `wait_with_timeout`; an optional spawn hook lets tests emulate side
/// effects of the child (like writing record files). A queued wait error
/// is recorded as a kill, as the production runner stops the child then.
#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<FakeResponse>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    spawn_error: Arc<Mutex<Option<TracecapError>>>,
    spawn_hook: Arc<Mutex<Option<SpawnHook>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    timeouts: Arc<Mutex<Vec<Duration>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, TracecapError>) {
        self.responses
            .lock()
            .expect("responses lock")
            .push(FakeResponse::Output(output));
    }

    /// Queue a wait that runs into its deadline.
    pub fn push_timeout(&self) {
        self.responses
            .lock()
            .expect("responses lock")
            .push(FakeResponse::Timeout);
    }

    pub fn fail_next_spawn(&self, error: TracecapError) {
        *self.spawn_error.lock().expect("spawn error lock") = Some(error);
    }

    pub fn set_spawn_hook(&self, hook: SpawnHook) {
        *self.spawn_hook.lock().expect("spawn hook lock") = Some(hook);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().expect("timeouts lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }

    fn next_response(&self) -> Result<FakeResponse, TracecapError> {
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(TracecapError::Process(
                "no fake response queued".to_string(),
            ));
        }
        Ok(responses.remove(0))
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, TracecapError> {
        if let Some(err) = self.spawn_error.lock().expect("spawn error lock").take() {
            return Err(err);
        }
        let hook = self.spawn_hook.lock().expect("spawn hook lock").clone();
        if let Some(hook) = hook {
            hook(&request);
        }
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn kill(&self, handle: u64) -> Result<(), TracecapError> {
        self.kills.lock().expect("kills lock").push(handle);
        Ok(())
    }

    fn wait_with_timeout(
        &self,
        handle: u64,
        timeout: Duration,
        on_stdout_line: &mut dyn FnMut(&str),
        on_stderr_line: &mut dyn FnMut(&str),
    ) -> Result<WaitOutcome, TracecapError> {
        self.waits.lock().expect("waits lock").push(handle);
        self.timeouts.lock().expect("timeouts lock").push(timeout);
        match self.next_response()? {
            FakeResponse::Output(output) => {
                let output = output.inspect_err(|_| {
                    self.kills.lock().expect("kills lock").push(handle);
                })?;
                output.stdout.lines().for_each(|line| on_stdout_line(line));
                output.stderr.lines().for_each(|line| on_stderr_line(line));
                Ok(WaitOutcome::Exited(output))
            }
            FakeResponse::Timeout => {
                self.kills.lock().expect("kills lock").push(handle);
                Ok(WaitOutcome::TimedOut(ProcessOutput {
                    exit_code: 137,
                    ..ProcessOutput::default()
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessRequest {
        ProcessRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
        }
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_streams_lines_and_reports_exit_code() {
        let runner = ProductionProcessRunner::new();
        let handle = runner
            .spawn(sh("echo one; echo two 1>&2; exit 3"))
            .expect("spawn");
        let mut out = Vec::new();
        let mut err = Vec::new();
        let outcome = runner
            .wait_with_timeout(
                handle,
                Duration::from_secs(10),
                &mut |line| out.push(line.to_string()),
                &mut |line| err.push(line.to_string()),
            )
            .expect("wait");
        let WaitOutcome::Exited(output) = outcome else {
            panic!("expected exit, got {outcome:?}");
        };
        assert_eq!(output.exit_code, 3);
        assert_eq!(out, vec!["one".to_string()]);
        assert_eq!(err, vec!["two".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn production_runner_kills_process_at_deadline() {
        let runner = ProductionProcessRunner::new();
        let handle = runner.spawn(sh("exec sleep 30")).expect("spawn");
        let started = Instant::now();
        let outcome = runner
            .wait_with_timeout(handle, Duration::from_millis(500), &mut |_| {}, &mut |_| {})
            .expect("wait");
        assert!(matches!(outcome, WaitOutcome::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    struct FailingChild {
        try_wait_fails: bool,
        kill_failures: usize,
        kills: usize,
        waits: usize,
    }

    impl ChildControl for FailingChild {
        fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
            if self.try_wait_fails {
                return Err(std::io::Error::other("waitpid interrupted"));
            }
            Ok(None)
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.kills += 1;
            if self.kill_failures > 0 {
                self.kill_failures -= 1;
                return Err(std::io::Error::other("kill refused"));
            }
            Ok(())
        }

        fn wait(&mut self) -> std::io::Result<ExitStatus> {
            self.waits += 1;
            Err(std::io::Error::other("no status"))
        }
    }

    fn supervise(child: &mut FailingChild, deadline: Instant) -> Result<WaitOutcome, TracecapError> {
        let (tx, rx) = mpsc::channel();
        drop(tx);
        let mut collector = LineCollector {
            output: ProcessOutput::default(),
            on_stdout_line: &mut |_| {},
            on_stderr_line: &mut |_| {},
        };
        supervise_child(child, &rx, deadline, Duration::from_millis(10), &mut collector)
    }

    #[test]
    fn failed_poll_kills_and_reaps_the_child() {
        let mut child = FailingChild {
            try_wait_fails: true,
            kill_failures: 0,
            kills: 0,
            waits: 0,
        };
        let err = supervise(&mut child, Instant::now() + Duration::from_secs(60))
            .expect_err("poll error");
        assert!(matches!(err, TracecapError::Process(msg) if msg.contains("waitpid")));
        assert_eq!(child.kills, 1);
        assert_eq!(child.waits, 1);
    }

    #[test]
    fn failed_deadline_kill_is_retried_before_returning() {
        let mut child = FailingChild {
            try_wait_fails: false,
            kill_failures: 1,
            kills: 0,
            waits: 0,
        };
        let err = supervise(&mut child, Instant::now()).expect_err("kill error");
        assert!(matches!(err, TracecapError::Process(msg) if msg.contains("kill refused")));
        assert_eq!(child.kills, 2);
        assert_eq!(child.waits, 1);
    }

    #[test]
    fn fake_file_system_create_dir_rejects_existing_path() {
        let fs = FakeFileSystem::with_dirs(["/ws"]);
        fs.create_dir(Path::new("/ws/run")).expect("first create");
        let err = fs.create_dir(Path::new("/ws/run")).expect_err("collision");
        assert!(format!("{err}").contains("already exists"));
        assert_eq!(fs.list_dirs(Path::new("/ws")).expect("list").len(), 1);
    }

    #[test]
    fn fake_runner_replays_lines_and_timeouts() {
        let runner = FakeProcessRunner::default();
        runner.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: "a\nb\n".to_string(),
            stderr: String::new(),
        }));
        runner.push_timeout();

        let first = runner.spawn(sh("true")).expect("spawn");
        let mut lines = Vec::new();
        let outcome = runner
            .wait_with_timeout(
                first,
                Duration::from_secs(1),
                &mut |l| lines.push(l.to_string()),
                &mut |_| {},
            )
            .expect("wait");
        assert!(matches!(outcome, WaitOutcome::Exited(_)));
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);

        let second = runner.spawn(sh("true")).expect("spawn");
        let outcome = runner
            .wait_with_timeout(second, Duration::from_secs(1), &mut |_| {}, &mut |_| {})
            .expect("wait");
        assert!(matches!(outcome, WaitOutcome::TimedOut(_)));
        assert_eq!(runner.kills(), vec![second]);
    }
}
