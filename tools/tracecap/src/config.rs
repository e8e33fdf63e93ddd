use crate::errors::TracecapError;
use crate::logging::DEFAULT_DISK_BUDGET_BYTES;
use crate::monitoring::{CaptureProfile, ProfileRegistry, DEFAULT_TCP_HOST, DEFAULT_TCP_PORT};
use crate::replay::reader::DEFAULT_RECORD_FILE_EXTENSION;
use crate::replay::session::DEFAULT_QUEUE_CAPACITY;
use crate::runtime::FileSystem;
use crate::scanner::KIEKER_MAP_FILE_EXTENSION;
use crate::supervisor::DEFAULT_WORKING_DIR_PREFIX;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Picked up from the process cwd when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "tracecap.toml";

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub java_binary: Option<String>,
    pub bundled_jar: Option<PathBuf>,
    pub capture_profile: Option<String>,
    pub log_path: Option<PathBuf>,
    pub allow_abnormal_exit: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub agent: AgentConfig,
    pub supervisor: SupervisorConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub java_binary: String,
    pub workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Defaults to the jar shipped next to the executable.
    pub bundled_jar: Option<PathBuf>,
    pub record_marker_extension: String,
    pub capture_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub default_duration_seconds: u64,
    pub fail_on_abnormal_exit: bool,
    pub working_dir_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayConfig {
    pub queue_capacity: usize,
    pub record_file_extension: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Defaults to `<workspace>/.tracecap/logs/tracecap.jsonl`.
    pub path: Option<PathBuf>,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig {
                java_binary: "java".to_string(),
                workspace: None,
            },
            agent: AgentConfig {
                bundled_jar: None,
                record_marker_extension: KIEKER_MAP_FILE_EXTENSION.to_string(),
                capture_profile: None,
            },
            supervisor: SupervisorConfig {
                default_duration_seconds: 60,
                fail_on_abnormal_exit: true,
                working_dir_prefix: DEFAULT_WORKING_DIR_PREFIX.to_string(),
            },
            replay: ReplayConfig {
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                record_file_extension: DEFAULT_RECORD_FILE_EXTENSION.to_string(),
                host: DEFAULT_TCP_HOST.to_string(),
                port: DEFAULT_TCP_PORT,
            },
            logging: LoggingConfig {
                path: None,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            profiles: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Built-in profiles plus the ones declared under `[profiles.<name>]`.
    /// A declared profile replaces a built-in one of the same name.
    pub fn profile_registry(&self) -> ProfileRegistry {
        let mut registry = ProfileRegistry::builtin();
        for (name, profile) in &self.profiles {
            registry.register(CaptureProfile {
                name: name.clone(),
                description: profile.description.clone(),
                properties: profile.properties.clone(),
            });
        }
        registry
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    runtime: Option<PartialRuntimeConfig>,
    agent: Option<PartialAgentConfig>,
    supervisor: Option<PartialSupervisorConfig>,
    replay: Option<PartialReplayConfig>,
    logging: Option<PartialLoggingConfig>,
    profiles: Option<BTreeMap<String, ProfileConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRuntimeConfig {
    java_binary: Option<String>,
    workspace: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAgentConfig {
    bundled_jar: Option<PathBuf>,
    record_marker_extension: Option<String>,
    capture_profile: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSupervisorConfig {
    default_duration_seconds: Option<u64>,
    fail_on_abnormal_exit: Option<bool>,
    working_dir_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialReplayConfig {
    queue_capacity: Option<usize>,
    record_file_extension: Option<String>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    budget_bytes: Option<u64>,
}

/// Defaults, then the TOML file, then CLI flags. Returns the validated
/// config and the absolute workspace directory.
pub fn load_config(
    overrides: &CliOverrides,
    process_cwd: &Path,
    fs: &dyn FileSystem,
) -> Result<(AppConfig, PathBuf), TracecapError> {
    let mut cfg = AppConfig::default();

    let config_path = match &overrides.config_path {
        Some(path) => Some(absolutize_path(process_cwd, path)),
        None => Some(process_cwd.join(DEFAULT_CONFIG_FILE)).filter(|p| fs.exists(p)),
    };
    if let Some(path) = config_path {
        let file_contents = fs.read_to_string(&path)?;
        cfg = parse_config(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);

    let workspace = resolve_workspace(process_cwd, &cfg, overrides);
    validate_config(&cfg)?;
    Ok((cfg, workspace))
}

pub fn parse_config(text: &str) -> Result<AppConfig, TracecapError> {
    let partial: PartialAppConfig =
        toml::from_str(text).map_err(|e| TracecapError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(runtime) = partial.runtime {
        if let Some(java_binary) = runtime.java_binary {
            cfg.runtime.java_binary = java_binary;
        }
        if let Some(workspace) = runtime.workspace {
            cfg.runtime.workspace = Some(workspace);
        }
    }

    if let Some(agent) = partial.agent {
        if let Some(bundled_jar) = agent.bundled_jar {
            cfg.agent.bundled_jar = Some(bundled_jar);
        }
        if let Some(value) = agent.record_marker_extension {
            cfg.agent.record_marker_extension = value;
        }
        if let Some(value) = agent.capture_profile {
            cfg.agent.capture_profile = Some(value);
        }
    }

    if let Some(supervisor) = partial.supervisor {
        if let Some(value) = supervisor.default_duration_seconds {
            cfg.supervisor.default_duration_seconds = value;
        }
        if let Some(value) = supervisor.fail_on_abnormal_exit {
            cfg.supervisor.fail_on_abnormal_exit = value;
        }
        if let Some(value) = supervisor.working_dir_prefix {
            cfg.supervisor.working_dir_prefix = value;
        }
    }

    if let Some(replay) = partial.replay {
        if let Some(value) = replay.queue_capacity {
            cfg.replay.queue_capacity = value;
        }
        if let Some(value) = replay.record_file_extension {
            cfg.replay.record_file_extension = value;
        }
        if let Some(value) = replay.host {
            cfg.replay.host = value;
        }
        if let Some(value) = replay.port {
            cfg.replay.port = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(profiles) = partial.profiles {
        cfg.profiles = profiles;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(java_binary) = &overrides.java_binary {
        cfg.runtime.java_binary = java_binary.clone();
    }
    if let Some(bundled_jar) = &overrides.bundled_jar {
        cfg.agent.bundled_jar = Some(bundled_jar.clone());
    }
    if let Some(profile) = &overrides.capture_profile {
        cfg.agent.capture_profile = Some(profile.clone());
    }
    if let Some(log_path) = &overrides.log_path {
        cfg.logging.path = Some(log_path.clone());
    }
    if overrides.allow_abnormal_exit {
        cfg.supervisor.fail_on_abnormal_exit = false;
    }
}

pub fn resolve_workspace(process_cwd: &Path, cfg: &AppConfig, overrides: &CliOverrides) -> PathBuf {
    if let Some(path) = &overrides.workspace {
        absolutize_path(process_cwd, path)
    } else if let Some(path) = &cfg.runtime.workspace {
        absolutize_path(process_cwd, path)
    } else {
        process_cwd.to_path_buf()
    }
}

pub fn resolve_log_path(cfg: &AppConfig, workspace: &Path) -> PathBuf {
    match &cfg.logging.path {
        Some(path) => absolutize_path(workspace, path),
        None => workspace
            .join(crate::results::RESULTS_DIR)
            .join("logs")
            .join("tracecap.jsonl"),
    }
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), TracecapError> {
    if cfg.runtime.java_binary.trim().is_empty() {
        return Err(TracecapError::InvalidConfig(
            "runtime.java_binary may not be empty".to_string(),
        ));
    }
    if cfg.agent.record_marker_extension.trim().is_empty() {
        return Err(TracecapError::InvalidConfig(
            "agent.record_marker_extension may not be empty".to_string(),
        ));
    }
    if cfg.supervisor.default_duration_seconds == 0 {
        return Err(TracecapError::InvalidConfig(
            "supervisor.default_duration_seconds must be greater than zero".to_string(),
        ));
    }
    if cfg.supervisor.working_dir_prefix.contains('/') {
        return Err(TracecapError::InvalidConfig(
            "supervisor.working_dir_prefix may not contain '/'".to_string(),
        ));
    }
    if cfg.replay.queue_capacity == 0 {
        return Err(TracecapError::InvalidConfig(
            "replay.queue_capacity must be greater than zero".to_string(),
        ));
    }
    if cfg.replay.record_file_extension.trim().is_empty() {
        return Err(TracecapError::InvalidConfig(
            "replay.record_file_extension may not be empty".to_string(),
        ));
    }
    if cfg.replay.host.trim().is_empty() {
        return Err(TracecapError::InvalidConfig(
            "replay.host may not be empty".to_string(),
        ));
    }
    if cfg.replay.port == 0 {
        return Err(TracecapError::InvalidConfig(
            "replay.port must be in range 1..=65535".to_string(),
        ));
    }
    if let Some(profile) = &cfg.agent.capture_profile {
        let registry = cfg.profile_registry();
        if registry.get(profile).is_none() {
            return Err(TracecapError::InvalidConfig(format!(
                "agent.capture_profile '{profile}' is not defined; available: {}",
                registry.names().join(", ")
            )));
        }
    }
    Ok(())
}
