//! Runs one instrumented process for a bounded time and collects its records.
//!
//! Every check that only reads the workspace happens before the working
//! directory is created, so a rejected request leaves no trace behind.

use crate::command_line::{lint_vm_options, LaunchCommand};
use crate::config::AppConfig;
use crate::errors::TracecapError;
use crate::logging::append_run_log;
use crate::monitoring::{ConfigurationBuilder, WriterBackend, APPLICATION_NAME_KEY};
use crate::results::{InstrumentationRecord, ResultSink};
use crate::runtime::{ProductionRuntime, WaitOutcome};
use crate::scanner::{scan, MarkerFilter};
use crate::tokenize::tokenize;
use crate::types::{
    validate_duration, InstrumentationRequest, RecordDirectory, RunId, RunOutcome,
    EXIT_CODE_KILLED, EXIT_CODE_SUCCESS,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

pub const BUILTIN_AGENT_JAR: &str = "kieker-1.14-SNAPSHOT-aspectj.jar";
pub const MONITORING_CONFIG_FILE: &str = "kieker.monitoring.properties";
pub const DEFAULT_WORKING_DIR_PREFIX: &str = "tracecap-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub java_binary: String,
    pub bundled_agent: PathBuf,
    pub marker: MarkerFilter,
    pub working_dir_prefix: String,
    pub capture_profile: Option<String>,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            java_binary: cfg.runtime.java_binary.clone(),
            bundled_agent: cfg
                .agent
                .bundled_jar
                .clone()
                .unwrap_or_else(default_bundled_agent),
            marker: MarkerFilter::new(cfg.agent.record_marker_extension.clone()),
            working_dir_prefix: cfg.supervisor.working_dir_prefix.clone(),
            capture_profile: cfg.agent.capture_profile.clone(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// The built-in agent ships next to the executable.
pub fn default_bundled_agent() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join(BUILTIN_AGENT_JAR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub working_directory: Option<PathBuf>,
    pub outcome: RunOutcome,
    /// Exit code of the process, kept even when the outcome is
    /// `RecordsMissing`. Killed runs report 130.
    pub exit_code: Option<i32>,
    pub record_directory: Option<RecordDirectory>,
    pub records_missing: bool,
    pub scan_error: Option<TracecapError>,
    pub warnings: Vec<String>,
    /// Failures this core decides on its own: pre-flight, launch, scan I/O
    /// and, when requested, missing records.
    pub build_failed: bool,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            working_directory: None,
            outcome: RunOutcome::Completed(EXIT_CODE_SUCCESS),
            exit_code: None,
            record_directory: None,
            records_missing: false,
            scan_error: None,
            warnings: Vec::new(),
            build_failed: false,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_abnormal_exit(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != EXIT_CODE_SUCCESS && code != EXIT_CODE_KILLED)
    }

    /// Whether the host should mark the build failed, given its policy on
    /// nonzero exit codes.
    pub fn fails_build(&self, fail_on_abnormal_exit: bool) -> bool {
        self.build_failed || self.failure(fail_on_abnormal_exit).is_some()
    }

    /// The error that fails the build under the given exit-code policy.
    pub fn failure(&self, fail_on_abnormal_exit: bool) -> Option<TracecapError> {
        if let RunOutcome::LaunchFailed(err) = &self.outcome {
            return Some(err.clone());
        }
        if let Some(err) = &self.scan_error {
            return Some(err.clone());
        }
        if self.outcome == RunOutcome::RecordsMissing {
            let dir = self
                .working_directory
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            return Some(TracecapError::RecordsMissing(format!(
                "no record directory was written under {dir}"
            )));
        }
        match self.exit_code {
            Some(code) if fail_on_abnormal_exit && self.is_abnormal_exit() => Some(
                TracecapError::AbnormalExit(format!("process exited with code {code}")),
            ),
            _ => None,
        }
    }
}

struct PreparedRun {
    run_id: RunId,
    working_dir: PathBuf,
    command: LaunchCommand,
    timeout: Duration,
}

pub struct ProcessSupervisor<'a> {
    runtime: &'a ProductionRuntime,
    builder: &'a ConfigurationBuilder,
    results: &'a dyn ResultSink,
    settings: SupervisorSettings,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(
        runtime: &'a ProductionRuntime,
        builder: &'a ConfigurationBuilder,
        results: &'a dyn ResultSink,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            runtime,
            builder,
            results,
            settings,
        }
    }

    pub fn working_dir_for(&self, workspace: &Path, run_id: &RunId) -> PathBuf {
        workspace.join(format!("{}{}", self.settings.working_dir_prefix, run_id))
    }

    /// Run without forwarding process output anywhere but the run log.
    pub fn run(&self, request: &InstrumentationRequest, workspace: &Path) -> RunReport {
        self.run_with_output(request, workspace, &mut |_| {})
    }

    pub fn run_with_output(
        &self,
        request: &InstrumentationRequest,
        workspace: &Path,
        on_line: &mut dyn FnMut(&str),
    ) -> RunReport {
        let started = self.runtime.clock.now();
        let mut report = RunReport::new(&request.run_id);
        append_run_log(
            "info",
            "supervisor.run.started",
            json!({
                "run_id": request.run_id,
                "workspace": workspace.display().to_string(),
                "duration_seconds": request.execute_duration_seconds,
            }),
        );

        let prepared = match self.prepare(request, workspace, &mut report) {
            Ok(prepared) => prepared,
            Err(err) => {
                append_run_log(
                    "error",
                    "supervisor.preflight.failed",
                    json!({ "run_id": request.run_id, "error": err.to_string() }),
                );
                return self.finish(report.launch_failed(err), started);
            }
        };

        let process_request = match prepared.command.to_request(workspace) {
            Ok(process_request) => process_request,
            Err(err) => return self.finish(report.launch_failed(err), started),
        };
        append_run_log(
            "info",
            "supervisor.process.starting",
            json!({
                "run_id": prepared.run_id.as_str(),
                "program": process_request.program,
                "args": process_request.args,
            }),
        );
        let handle = match self.runtime.process_runner.spawn(process_request) {
            Ok(handle) => handle,
            Err(err) => {
                let err = match err {
                    TracecapError::Launch(_) => err,
                    other => TracecapError::Launch(other.to_string()),
                };
                append_run_log(
                    "error",
                    "supervisor.process.launch_failed",
                    json!({ "run_id": prepared.run_id.as_str(), "error": err.to_string() }),
                );
                return self.finish(report.launch_failed(err), started);
            }
        };

        report.outcome = self.wait(&prepared, handle, started, on_line);
        report.exit_code = report.outcome.exit_code();
        if let RunOutcome::LaunchFailed(_) = report.outcome {
            report.build_failed = true;
        }

        self.collect_records(request, &prepared, &mut report);
        self.finish(report, started)
    }

    fn prepare(
        &self,
        request: &InstrumentationRequest,
        workspace: &Path,
        report: &mut RunReport,
    ) -> Result<PreparedRun, TracecapError> {
        let fs = self.runtime.file_system.as_ref();

        let run_id = RunId::parse(&request.run_id)?;
        validate_duration(request.execute_duration_seconds)?;
        if let Some(vm_options) = request.extra_vm_options.as_deref() {
            report.warnings.extend(lint_vm_options(vm_options)?);
            tokenize(vm_options)?;
        }
        if let Some(args) = request.extra_process_args.as_deref() {
            tokenize(args)?;
        }

        if !fs.is_dir(workspace) {
            return Err(TracecapError::Preflight(format!(
                "workspace {} does not exist",
                workspace.display()
            )));
        }
        let working_dir = self.working_dir_for(workspace, &run_id);
        if fs.exists(&working_dir) {
            return Err(TracecapError::Preflight(format!(
                "working directory {} already exists",
                working_dir.display()
            )));
        }

        let agent_source = match blank_to_none(request.custom_agent_binary_path.as_deref()) {
            Some(custom) => {
                let resolved = workspace.join(custom);
                if !fs.exists(&resolved) {
                    return Err(TracecapError::Preflight(format!(
                        "specified agent binary '{}' does not exist",
                        custom.display()
                    )));
                }
                AgentSource::Custom(resolved)
            }
            None => {
                if !fs.exists(&self.settings.bundled_agent) {
                    return Err(TracecapError::Preflight(format!(
                        "built-in agent '{}' not accessible",
                        self.settings.bundled_agent.display()
                    )));
                }
                AgentSource::Bundled(self.settings.bundled_agent.clone())
            }
        };

        let weaving_config = match blank_to_none(request.agent_weaving_config_path.as_deref()) {
            Some(path) if fs.exists(&workspace.join(path)) => Some(path.to_path_buf()),
            Some(path) => {
                self.warn(report, &run_id, format!(
                    "weaving configuration '{}' does not exist; continuing without it",
                    path.display()
                ));
                None
            }
            None => {
                self.warn(
                    report,
                    &run_id,
                    "no weaving configuration given; continuing without it".to_string(),
                );
                None
            }
        };

        let artifact = workspace.join(&request.target_artifact_path);
        if !fs.exists(&artifact) {
            return Err(TracecapError::Preflight(format!(
                "target artifact '{}' does not exist",
                request.target_artifact_path.display()
            )));
        }

        let built = self.builder.build_with_profile(
            &WriterBackend::file(&working_dir),
            self.settings.capture_profile.as_deref(),
            request.agent_overrides.as_deref(),
        )?;
        for warning in &built.warnings {
            self.warn(report, &run_id, format!("monitoring configuration {warning}"));
        }
        let mut configuration = built.configuration;
        if configuration.get(APPLICATION_NAME_KEY).is_none() {
            configuration.set(APPLICATION_NAME_KEY, request.application_name());
        }

        fs.create_dir(&working_dir).map_err(|e| {
            TracecapError::Preflight(format!(
                "cannot create working directory {}: {e}",
                working_dir.display()
            ))
        })?;
        report.working_directory = Some(working_dir.clone());

        let agent_path = match agent_source {
            AgentSource::Custom(path) => path,
            AgentSource::Bundled(source) => {
                let file_name = source
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| BUILTIN_AGENT_JAR.into());
                let target = working_dir.join(file_name);
                fs.copy_file(&source, &target).map_err(|e| {
                    TracecapError::Preflight(format!("built-in agent could not be copied: {e}"))
                })?;
                target
            }
        };
        self.log_agent_digest(&run_id, &agent_path);

        let monitoring_config = working_dir.join(MONITORING_CONFIG_FILE);
        configuration.write_to(fs, &monitoring_config)?;

        Ok(PreparedRun {
            run_id,
            working_dir,
            command: LaunchCommand {
                java_binary: self.settings.java_binary.clone(),
                agent_path,
                weaving_config,
                monitoring_config,
                skip_default_weaving: request.skip_default_weaving,
                vm_options: request.extra_vm_options.clone(),
                artifact: request.target_artifact_path.clone(),
                program_args: request.extra_process_args.clone(),
            },
            timeout: Duration::from_secs(request.execute_duration_seconds),
        })
    }

    fn wait(
        &self,
        prepared: &PreparedRun,
        handle: u64,
        started: SystemTime,
        on_line: &mut dyn FnMut(&str),
    ) -> RunOutcome {
        let sink = RefCell::new(on_line);
        let run_id = prepared.run_id.as_str();
        let forward = |stream: &str, line: &str| {
            append_run_log(
                "debug",
                "supervisor.process.output",
                json!({ "run_id": run_id, "stream": stream, "line": line }),
            );
            let mut on_line = sink.borrow_mut();
            (*on_line)(line);
        };
        let waited = self.runtime.process_runner.wait_with_timeout(
            handle,
            prepared.timeout,
            &mut |line| forward("stdout", line),
            &mut |line| forward("stderr", line),
        );

        match waited {
            Ok(WaitOutcome::Exited(output)) => {
                let elapsed = self.elapsed_since(started).as_secs();
                let outcome = RunOutcome::from_exit(output.exit_code, elapsed);
                append_run_log(
                    if outcome.is_abnormal_exit() { "warn" } else { "info" },
                    "supervisor.process.exited",
                    json!({
                        "run_id": run_id,
                        "exit_code": output.exit_code,
                        "outcome": outcome.as_str(),
                    }),
                );
                outcome
            }
            Ok(WaitOutcome::TimedOut(_)) => {
                let seconds = prepared.timeout.as_secs();
                append_run_log(
                    "info",
                    "supervisor.process.timeout",
                    json!({ "run_id": run_id, "after_seconds": seconds }),
                );
                RunOutcome::Killed(seconds)
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "supervisor.process.wait_failed",
                    json!({ "run_id": run_id, "error": err.to_string() }),
                );
                RunOutcome::LaunchFailed(err)
            }
        }
    }

    fn collect_records(
        &self,
        request: &InstrumentationRequest,
        prepared: &PreparedRun,
        report: &mut RunReport,
    ) {
        let fs = self.runtime.file_system.as_ref();
        let run_id = prepared.run_id.as_str();
        match scan(fs, &prepared.working_dir, &self.settings.marker) {
            Ok(Some(dir)) => {
                append_run_log(
                    "info",
                    "supervisor.records.found",
                    json!({ "run_id": run_id, "record_directory": dir.path.display().to_string() }),
                );
                let record = InstrumentationRecord::new(
                    run_id,
                    request.run_name.as_deref(),
                    dir.name.clone(),
                    report.exit_code.unwrap_or(-1),
                );
                if let Err(err) = self.results.attach(&record) {
                    self.warn(report, &prepared.run_id, format!("result could not be attached: {err}"));
                }
                report.record_directory = Some(dir);
            }
            Ok(None) => {
                report.records_missing = true;
                if request.fail_if_no_records {
                    append_run_log(
                        "error",
                        "supervisor.records.missing",
                        json!({ "run_id": run_id, "fatal": true }),
                    );
                    report.warnings.push(
                        "no records have been written; failing the run as requested".to_string(),
                    );
                    if !matches!(report.outcome, RunOutcome::LaunchFailed(_)) {
                        report.outcome = RunOutcome::RecordsMissing;
                    }
                    report.build_failed = true;
                } else {
                    append_run_log(
                        "info",
                        "supervisor.records.missing",
                        json!({ "run_id": run_id, "fatal": false }),
                    );
                    report.warnings.push("no records have been written".to_string());
                }
            }
            Err(err) => {
                append_run_log(
                    "error",
                    "supervisor.scan.failed",
                    json!({ "run_id": run_id, "error": err.to_string() }),
                );
                report.scan_error = Some(err);
                report.build_failed = true;
            }
        }
    }

    fn log_agent_digest(&self, run_id: &RunId, agent_path: &Path) {
        let digest = self
            .runtime
            .file_system
            .read_bytes(agent_path)
            .map(|bytes| hex_bytes(&Sha256::digest(&bytes)))
            .unwrap_or_else(|e| format!("unavailable: {e}"));
        append_run_log(
            "info",
            "supervisor.agent.resolved",
            json!({
                "run_id": run_id.as_str(),
                "agent": agent_path.display().to_string(),
                "sha256": digest,
            }),
        );
    }

    fn warn(&self, report: &mut RunReport, run_id: &RunId, message: String) {
        append_run_log(
            "warn",
            "supervisor.warning",
            json!({ "run_id": run_id.as_str(), "message": message }),
        );
        report.warnings.push(message);
    }

    fn elapsed_since(&self, started: SystemTime) -> Duration {
        self.runtime
            .clock
            .now()
            .duration_since(started)
            .unwrap_or_default()
    }

    fn finish(&self, mut report: RunReport, started: SystemTime) -> RunReport {
        report.elapsed = self.elapsed_since(started);
        append_run_log(
            if report.build_failed { "error" } else { "info" },
            "supervisor.run.finished",
            json!({
                "run_id": report.run_id,
                "outcome": report.outcome.as_str(),
                "exit_code": report.exit_code,
                "record_directory": report.record_directory.as_ref().map(|d| d.name.clone()),
                "build_failed": report.build_failed,
                "elapsed_ms": report.elapsed.as_millis() as u64,
            }),
        );
        report
    }
}

enum AgentSource {
    Bundled(PathBuf),
    Custom(PathBuf),
}

impl RunReport {
    fn launch_failed(mut self, err: TracecapError) -> Self {
        self.outcome = RunOutcome::LaunchFailed(err);
        self.build_failed = true;
        self
    }
}

fn blank_to_none(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty() && !p.to_string_lossy().trim().is_empty())
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::MemoryResultSink;
    use crate::runtime::{
        FakeClock, FakeFileSystem, FakeProcessRunner, FakeTerminal, FileSystem, ProcessOutput,
    };
    use std::sync::Arc;

    struct Harness {
        fs: FakeFileSystem,
        clock: FakeClock,
        runner: FakeProcessRunner,
        runtime: ProductionRuntime,
        builder: ConfigurationBuilder,
        results: MemoryResultSink,
    }

    fn harness() -> Harness {
        let fs = FakeFileSystem::with_dirs(["/ws"]);
        fs.write_string(Path::new("/ws/app.jar"), "jar").expect("artifact");
        fs.write_string(Path::new("/ws/aop.xml"), "<aspectj/>").expect("aop");
        fs.write_string(Path::new("/opt/tracecap/kieker.jar"), "agent").expect("agent");
        let runner = FakeProcessRunner::default();
        let clock = FakeClock::default();
        let runtime = ProductionRuntime {
            clock: Arc::new(clock.clone()),
            file_system: Arc::new(fs.clone()),
            process_runner: Arc::new(runner.clone()),
            terminal: Arc::new(FakeTerminal::default()),
        };
        Harness {
            fs,
            clock,
            runner,
            runtime,
            builder: ConfigurationBuilder::default(),
            results: MemoryResultSink::default(),
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            java_binary: "java".to_string(),
            bundled_agent: PathBuf::from("/opt/tracecap/kieker.jar"),
            marker: MarkerFilter::default(),
            working_dir_prefix: DEFAULT_WORKING_DIR_PREFIX.to_string(),
            capture_profile: None,
        }
    }

    fn request() -> InstrumentationRequest {
        let mut request = InstrumentationRequest::new("build-42", "app.jar", 5);
        request.agent_weaving_config_path = Some(PathBuf::from("aop.xml"));
        request
    }

    fn exit(code: i32) -> ProcessOutput {
        ProcessOutput {
            exit_code: code,
            ..ProcessOutput::default()
        }
    }

    fn write_records_on_spawn(h: &Harness) {
        let fs = h.fs.clone();
        h.runner.set_spawn_hook(Arc::new(move |_| {
            let dir = Path::new("/ws/tracecap-build-42/kieker-20240101-000000");
            fs.create_dir(dir).expect("record dir");
            fs.write_string(&dir.join("kieker.map"), "$0=kieker.common.record.misc.KiekerMetadataRecord")
                .expect("map file");
        }));
    }

    #[test]
    fn successful_run_attaches_record_directory() {
        let h = harness();
        write_records_on_spawn(&h);
        h.runner.push_response(Ok(exit(0)));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert_eq!(report.outcome, RunOutcome::Completed(0));
        assert!(!report.build_failed);
        let dir = report.record_directory.expect("record dir");
        assert_eq!(dir.name, "kieker-20240101-000000");
        assert_eq!(
            h.results.records(),
            vec![InstrumentationRecord::new("build-42", None, "kieker-20240101-000000", 0)]
        );
        assert_eq!(h.runner.timeouts(), vec![Duration::from_secs(5)]);
        let spawned = &h.runner.spawned()[0];
        assert_eq!(spawned.cwd, Some(PathBuf::from("/ws")));
        assert_eq!(
            spawned.args[0],
            "-javaagent:/ws/tracecap-build-42/kieker.jar"
        );
        assert!(h.fs.exists(Path::new("/ws/tracecap-build-42/kieker.jar")));
    }

    #[test]
    fn monitoring_configuration_targets_working_directory() {
        let h = harness();
        h.runner.push_response(Ok(exit(0)));
        let mut req = request();
        req.job_name = Some("nightly".to_string());
        req.fail_if_no_records = false;
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());
        supervisor.run(&req, Path::new("/ws"));

        let text = h
            .fs
            .file(Path::new("/ws/tracecap-build-42/kieker.monitoring.properties"))
            .expect("config written");
        let cfg = crate::monitoring::MonitoringConfiguration::parse(&text).expect("parse");
        assert_eq!(cfg.storage_path(), Some("/ws/tracecap-build-42"));
        assert_eq!(cfg.get(APPLICATION_NAME_KEY), Some("nightly_build-42"));
    }

    #[test]
    fn invalid_run_id_fails_before_any_mutation() {
        let h = harness();
        let before = h.fs.file_paths();
        let mut req = request();
        req.run_id = "Build 42".to_string();
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        assert!(matches!(
            report.outcome,
            RunOutcome::LaunchFailed(TracecapError::Validation(_))
        ));
        assert!(report.build_failed);
        assert_eq!(h.fs.file_paths(), before);
        assert!(h.fs.list_dirs(Path::new("/ws")).expect("list").is_empty());
        assert!(h.runner.spawned().is_empty());
    }

    #[test]
    fn existing_working_directory_is_left_untouched() {
        let h = harness();
        h.fs.create_dir(Path::new("/ws/tracecap-build-42")).expect("existing");
        h.fs.write_string(Path::new("/ws/tracecap-build-42/keep.txt"), "mine")
            .expect("existing file");
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        let RunOutcome::LaunchFailed(TracecapError::Preflight(msg)) = &report.outcome else {
            panic!("expected preflight failure, got {:?}", report.outcome);
        };
        assert!(msg.contains("already exists"));
        assert_eq!(
            h.fs.file(Path::new("/ws/tracecap-build-42/keep.txt")).as_deref(),
            Some("mine")
        );
        assert!(!h.fs.exists(Path::new("/ws/tracecap-build-42/kieker.monitoring.properties")));
        assert!(h.runner.spawned().is_empty());
    }

    #[test]
    fn missing_artifact_prevents_launch() {
        let h = harness();
        let mut req = request();
        req.target_artifact_path = PathBuf::from("missing.jar");
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        assert!(matches!(
            report.outcome,
            RunOutcome::LaunchFailed(TracecapError::Preflight(_))
        ));
        assert!(h.runner.spawned().is_empty());
        assert!(!h.fs.is_dir(Path::new("/ws/tracecap-build-42")));
    }

    #[test]
    fn missing_custom_agent_prevents_launch() {
        let h = harness();
        let mut req = request();
        req.custom_agent_binary_path = Some(PathBuf::from("lib/kieker-custom.jar"));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        let RunOutcome::LaunchFailed(TracecapError::Preflight(msg)) = &report.outcome else {
            panic!("expected preflight failure");
        };
        assert!(msg.contains("lib/kieker-custom.jar"));
        assert!(h.runner.spawned().is_empty());
    }

    #[test]
    fn custom_agent_is_used_in_place() {
        let h = harness();
        h.fs.write_string(Path::new("/ws/lib/kieker-custom.jar"), "custom")
            .expect("custom agent");
        h.runner.push_response(Ok(exit(0)));
        let mut req = request();
        req.custom_agent_binary_path = Some(PathBuf::from("lib/kieker-custom.jar"));
        req.fail_if_no_records = false;
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        supervisor.run(&req, Path::new("/ws"));

        assert_eq!(
            h.runner.spawned()[0].args[0],
            "-javaagent:/ws/lib/kieker-custom.jar"
        );
        assert!(!h.fs.exists(Path::new("/ws/tracecap-build-42/kieker.jar")));
    }

    #[test]
    fn missing_weaving_config_is_only_a_warning() {
        let h = harness();
        h.runner.push_response(Ok(exit(0)));
        let mut req = request();
        req.agent_weaving_config_path = Some(PathBuf::from("missing-aop.xml"));
        req.fail_if_no_records = false;
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        assert_eq!(report.outcome, RunOutcome::Completed(0));
        assert!(report.warnings.iter().any(|w| w.contains("missing-aop.xml")));
        assert!(!h.runner.spawned()[0]
            .args
            .iter()
            .any(|a| a.starts_with(crate::command_line::ARG_WEAVER_CONFIGURATION)));
    }

    #[test]
    fn timeout_is_reported_as_killed_not_failure() {
        let h = harness();
        write_records_on_spawn(&h);
        h.runner.push_timeout();
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert_eq!(report.outcome, RunOutcome::Killed(5));
        assert_eq!(report.exit_code, Some(130));
        assert!(!report.fails_build(true));
        assert_eq!(h.results.records()[0].application_exit_code, 130);
    }

    #[test]
    fn exit_130_is_killed_after_elapsed_time() {
        let h = harness();
        let fs = h.fs.clone();
        let clock = h.clock.clone();
        h.runner.set_spawn_hook(Arc::new(move |_| {
            clock.advance(Duration::from_secs(3));
            let dir = Path::new("/ws/tracecap-build-42/kieker-1");
            fs.create_dir(dir).expect("record dir");
            fs.write_string(&dir.join("kieker.map"), "$0=Meta").expect("map");
        }));
        h.runner.push_response(Ok(exit(130)));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert_eq!(report.outcome, RunOutcome::Killed(3));
        assert_eq!(report.elapsed, Duration::from_secs(3));
        assert!(!report.is_abnormal_exit());
    }

    #[test]
    fn nonzero_exit_is_abnormal_and_policy_decides() {
        let h = harness();
        write_records_on_spawn(&h);
        h.runner.push_response(Ok(exit(2)));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert_eq!(report.outcome, RunOutcome::Completed(2));
        assert!(report.is_abnormal_exit());
        assert!(!report.build_failed);
        assert!(report.fails_build(true));
        assert!(!report.fails_build(false));
        assert_eq!(
            report.failure(true),
            Some(TracecapError::AbnormalExit(
                "process exited with code 2".to_string()
            ))
        );
        assert_eq!(report.failure(false), None);
    }

    #[test]
    fn missing_records_fail_only_when_requested() {
        let h = harness();
        h.runner.push_response(Ok(exit(0)));
        h.runner.push_response(Ok(exit(0)));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let strict = supervisor.run(&request(), Path::new("/ws"));
        assert_eq!(strict.outcome, RunOutcome::RecordsMissing);
        assert_eq!(strict.exit_code, Some(0));
        assert!(strict.build_failed);
        assert!(matches!(
            strict.failure(false),
            Some(TracecapError::RecordsMissing(msg)) if msg.contains("tracecap-build-42")
        ));

        let mut lenient_req = request();
        lenient_req.run_id = "build-43".to_string();
        lenient_req.fail_if_no_records = false;
        let lenient = supervisor.run(&lenient_req, Path::new("/ws"));
        assert_eq!(lenient.outcome, RunOutcome::Completed(0));
        assert!(lenient.records_missing);
        assert!(!lenient.build_failed);
        assert_eq!(lenient.failure(true), None);
        assert!(h.results.records().is_empty());
    }

    #[test]
    fn wait_failure_is_a_launch_error_and_the_child_is_stopped() {
        let h = harness();
        h.runner
            .push_response(Err(TracecapError::Process("try_wait: EINTR".to_string())));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert!(matches!(
            report.outcome,
            RunOutcome::LaunchFailed(TracecapError::Process(_))
        ));
        assert!(report.build_failed);
        assert_eq!(h.runner.kills(), h.runner.waits());
        assert!(matches!(report.failure(false), Some(TracecapError::Process(_))));
    }

    #[test]
    fn spawn_failure_is_a_launch_error() {
        let h = harness();
        h.runner
            .fail_next_spawn(TracecapError::Process("exec format error".to_string()));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&request(), Path::new("/ws"));

        assert!(matches!(
            report.outcome,
            RunOutcome::LaunchFailed(TracecapError::Launch(_))
        ));
        assert!(report.build_failed);
    }

    #[test]
    fn malformed_overrides_fail_before_working_directory_exists() {
        let h = harness();
        let mut req = request();
        req.agent_overrides = Some("kieker.monitoring.debug".to_string());
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        assert!(matches!(
            report.outcome,
            RunOutcome::LaunchFailed(TracecapError::ConfigParse(_))
        ));
        assert!(!h.fs.is_dir(Path::new("/ws/tracecap-build-42")));
    }

    #[test]
    fn reserved_override_is_reported_as_warning() {
        let h = harness();
        h.runner.push_response(Ok(exit(0)));
        let mut req = request();
        req.fail_if_no_records = false;
        req.agent_overrides = Some(format!(
            "{}=/tmp/elsewhere",
            crate::monitoring::STORAGE_PATH_KEY
        ));
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());

        let report = supervisor.run(&req, Path::new("/ws"));

        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("cannot be overridden")));
        let text = h
            .fs
            .file(Path::new("/ws/tracecap-build-42/kieker.monitoring.properties"))
            .expect("config");
        assert!(!text.contains("/tmp/elsewhere"));
    }

    #[test]
    fn process_output_is_forwarded_to_caller() {
        let h = harness();
        h.runner.push_response(Ok(ProcessOutput {
            exit_code: 0,
            stdout: "started\nserving\n".to_string(),
            stderr: "warn: slow\n".to_string(),
        }));
        let mut req = request();
        req.fail_if_no_records = false;
        let supervisor = ProcessSupervisor::new(&h.runtime, &h.builder, &h.results, settings());
        let mut lines = Vec::new();

        supervisor.run_with_output(&req, Path::new("/ws"), &mut |line| {
            lines.push(line.to_string())
        });

        assert_eq!(lines, vec!["started", "serving", "warn: slow"]);
    }
}
