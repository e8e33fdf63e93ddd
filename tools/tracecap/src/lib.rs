pub mod command_line;
pub mod config;
pub mod errors;
pub mod log_retention;
pub mod logging;
pub mod monitoring;
pub mod replay;
pub mod results;
pub mod runtime;
pub mod scanner;
pub mod supervisor;
pub mod tokenize;
pub mod types;

use clap::{error::ErrorKind, Args, CommandFactory, Parser, Subcommand};
use config::{load_config, resolve_log_path, AppConfig, CliOverrides};
use errors::TracecapError;
use logging::{init_run_logger, structured_fallback_line, JsonlLogger};
use monitoring::{ConfigurationBuilder, WriterBackend};
use replay::{ReplaySession, ReplaySettings};
use results::{JsonlResultStore, ResultSink};
use runtime::ProductionRuntime;
use scanner::{scan, scan_all, MarkerFilter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use supervisor::{ProcessSupervisor, SupervisorSettings};
use types::{InstrumentationRequest, RunOutcome};

#[derive(Debug, Clone, Parser)]
#[command(name = "tracecap")]
#[command(about = "Capture and replay Kieker monitoring records of a Java application")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run a jar with the monitoring agent attached for a bounded time.
    Instrument(InstrumentArgs),
    /// Find the record directory below a working directory.
    Scan(ScanArgs),
    /// Stream captured records to a collector.
    Replay(ReplayArgs),
    /// List the instrumentations attached in this workspace.
    Results,
}

#[derive(Debug, Clone, Args)]
pub struct InstrumentArgs {
    #[arg(long)]
    pub run_id: String,
    #[arg(long)]
    pub run_name: Option<String>,
    #[arg(long)]
    pub job_name: Option<String>,
    #[arg(long)]
    pub jar: PathBuf,
    #[arg(long)]
    pub aop: Option<PathBuf>,
    #[arg(long = "args", allow_hyphen_values = true)]
    pub program_args: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub vm_options: Option<String>,
    #[arg(long)]
    pub duration: Option<u64>,
    /// Let the agent also load its bundled weaving configuration.
    #[arg(long, default_value_t = false)]
    pub include_default_aop: bool,
    #[arg(long, default_value_t = false)]
    pub allow_no_records: bool,
    #[arg(long, default_value_t = false)]
    pub allow_abnormal_exit: bool,
    /// Newline-delimited `key=value` agent properties.
    #[arg(long, conflicts_with = "overrides_file")]
    pub overrides: Option<String>,
    #[arg(long)]
    pub overrides_file: Option<PathBuf>,
    #[arg(long)]
    pub agent_jar: Option<PathBuf>,
    #[arg(long)]
    pub bundled_jar: Option<PathBuf>,
    #[arg(long)]
    pub java: Option<String>,
    #[arg(long)]
    pub profile: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ScanArgs {
    pub dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ReplayArgs {
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Write to `<dir>/replay.dat` instead of a TCP collector.
    #[arg(long, conflicts_with_all = ["host", "port"])]
    pub to_dir: Option<PathBuf>,
    /// Stop the replay if it has not drained by then.
    #[arg(long)]
    pub timeout_seconds: Option<u64>,
}

pub fn run() -> Result<i32, TracecapError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| TracecapError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &Path,
    runtime: &ProductionRuntime,
) -> Result<i32, TracecapError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                print!("{}", render_help());
                return Ok(0);
            }
            _ => return Err(TracecapError::Cli(error.to_string())),
        },
    };

    let mut overrides = CliOverrides {
        config_path: cli.config.clone(),
        workspace: cli.workspace.clone(),
        log_path: cli.log_file.clone(),
        ..CliOverrides::default()
    };
    if let Command::Instrument(instrument) = &cli.command {
        overrides.java_binary = instrument.java.clone();
        overrides.bundled_jar = instrument.bundled_jar.clone();
        overrides.capture_profile = instrument.profile.clone();
        overrides.allow_abnormal_exit = instrument.allow_abnormal_exit;
    }

    let (cfg, workspace) = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    let mut logger = JsonlLogger::new(resolve_log_path(&cfg, &workspace));
    logger.budget_bytes = cfg.logging.budget_bytes;
    init_run_logger(logger);

    match &cli.command {
        Command::Instrument(instrument) => run_instrument(runtime, &cfg, &workspace, instrument),
        Command::Scan(scan_args) => run_scan(runtime, &cfg, cwd, scan_args),
        Command::Replay(replay_args) => run_replay(runtime, &cfg, cwd, replay_args),
        Command::Results => run_results(runtime, &workspace),
    }
}

fn run_instrument(
    runtime: &ProductionRuntime,
    cfg: &AppConfig,
    workspace: &Path,
    args: &InstrumentArgs,
) -> Result<i32, TracecapError> {
    let overrides = match &args.overrides_file {
        Some(path) => Some(
            runtime
                .file_system
                .read_to_string(&workspace.join(path))?,
        ),
        None => args.overrides.clone(),
    };
    let request = InstrumentationRequest {
        run_name: args.run_name.clone(),
        job_name: args.job_name.clone(),
        agent_weaving_config_path: args.aop.clone(),
        extra_process_args: args.program_args.clone(),
        extra_vm_options: args.vm_options.clone(),
        skip_default_weaving: !args.include_default_aop,
        fail_if_no_records: !args.allow_no_records,
        agent_overrides: overrides,
        custom_agent_binary_path: args.agent_jar.clone(),
        ..InstrumentationRequest::new(
            args.run_id.clone(),
            args.jar.clone(),
            args.duration
                .unwrap_or(cfg.supervisor.default_duration_seconds),
        )
    };

    let builder = ConfigurationBuilder::new(cfg.profile_registry());
    let store = JsonlResultStore::for_workspace(runtime.file_system.clone(), workspace);
    let supervisor = ProcessSupervisor::new(
        runtime,
        &builder,
        &store as &dyn ResultSink,
        SupervisorSettings::from_config(cfg),
    );
    let terminal = runtime.terminal.clone();
    let report = supervisor.run_with_output(&request, workspace, &mut |line| {
        let _ = terminal.write_line(line);
    });

    for warning in &report.warnings {
        runtime.terminal.write_line(&format!("warning: {warning}"))?;
    }
    match &report.outcome {
        RunOutcome::LaunchFailed(err) => {
            eprintln!(
                "{}",
                structured_fallback_line(&report.run_id, "launch", &err.to_string())
            );
        }
        outcome => {
            runtime.terminal.write_line(&format!(
                "run {} {} (exit code {})",
                report.run_id,
                outcome.as_str(),
                report
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "n/a".to_string())
            ))?;
        }
    }
    if let Some(dir) = &report.record_directory {
        runtime
            .terminal
            .write_line(&format!("records saved to {}", dir.path.display()))?;
    }
    match report.failure(cfg.supervisor.fail_on_abnormal_exit) {
        // Launch failures were reported above.
        Some(_) if matches!(report.outcome, RunOutcome::LaunchFailed(_)) => Ok(1),
        Some(err) => {
            eprintln!(
                "{}",
                structured_fallback_line(&report.run_id, failure_stage(&err), &err.to_string())
            );
            Ok(1)
        }
        None if report.build_failed => Ok(1),
        None => Ok(0),
    }
}

fn failure_stage(err: &TracecapError) -> &'static str {
    match err {
        TracecapError::ScanIo(_) => "scan",
        TracecapError::RecordsMissing(_) => "records",
        TracecapError::AbnormalExit(_) => "exit",
        _ => "run",
    }
}

fn run_scan(
    runtime: &ProductionRuntime,
    cfg: &AppConfig,
    cwd: &Path,
    args: &ScanArgs,
) -> Result<i32, TracecapError> {
    let root = cwd.join(&args.dir);
    let filter = MarkerFilter::new(cfg.agent.record_marker_extension.clone());
    let fs = runtime.file_system.as_ref();
    let found = if args.all {
        scan_all(fs, &root, &filter)?
    } else {
        scan(fs, &root, &filter)?.into_iter().collect()
    };
    if found.is_empty() {
        runtime
            .terminal
            .write_line(&format!("no record directory below {}", root.display()))?;
        return Ok(1);
    }
    for dir in found {
        runtime.terminal.write_line(&dir.path.display().to_string())?;
    }
    Ok(0)
}

fn run_replay(
    runtime: &ProductionRuntime,
    cfg: &AppConfig,
    cwd: &Path,
    args: &ReplayArgs,
) -> Result<i32, TracecapError> {
    let backend = match &args.to_dir {
        Some(dir) => WriterBackend::file(cwd.join(dir)),
        None => WriterBackend::tcp(
            args.host.clone().unwrap_or_else(|| cfg.replay.host.clone()),
            args.port.unwrap_or(cfg.replay.port),
        ),
    };
    let settings = ReplaySettings {
        roots: args.dirs.iter().map(|dir| cwd.join(dir)).collect(),
        marker: MarkerFilter::new(cfg.agent.record_marker_extension.clone()),
        queue_capacity: cfg.replay.queue_capacity,
    };
    let session =
        ReplaySession::for_backend(settings, &backend, &cfg.replay.record_file_extension)?;
    session.run()?;

    if let Some(seconds) = args.timeout_seconds {
        if !session.wait_timeout(Duration::from_secs(seconds))? {
            runtime
                .terminal
                .write_line(&format!("replay did not drain within {seconds}s; stopping"))?;
            session.kill()?;
        }
    }
    let stats = session.wait()?;

    runtime.terminal.write_line(&format!(
        "replayed {} of {} records from {} directories",
        stats.records_forwarded, stats.records_read, stats.directories_scanned
    ))?;
    for failure in &stats.failures {
        let path = failure
            .path
            .as_ref()
            .map(|p| format!(" {}", p.display()))
            .unwrap_or_default();
        runtime
            .terminal
            .write_line(&format!("failed ({:?}){path}: {}", failure.stage, failure.message))?;
    }
    if stats.aborted.is_some() || !stats.failures.is_empty() {
        Ok(1)
    } else {
        Ok(0)
    }
}

fn run_results(runtime: &ProductionRuntime, workspace: &Path) -> Result<i32, TracecapError> {
    let store = JsonlResultStore::for_workspace(runtime.file_system.clone(), workspace);
    for record in store.load()? {
        let marker = if record.is_abnormal_exit() { " (abnormal exit)" } else { "" };
        runtime.terminal.write_line(&format!(
            "{}\t{}\texit {}{marker}",
            record.display_name(),
            record.record_directory_name,
            record.application_exit_code
        ))?;
    }
    Ok(0)
}

pub fn render_help() -> String {
    let mut cmd = Cli::command();
    cmd.render_help().to_string()
}
