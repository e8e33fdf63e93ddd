use crate::errors::TracecapError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const EXIT_CODE_SUCCESS: i32 = 0;
/// Exit code of a process ended by SIGINT, or by the supervisor at its
/// deadline. Not an abnormal exit.
pub const EXIT_CODE_KILLED: i32 = 130;

pub const RUN_ID_MAX_LEN: usize = 64;

/// Identifier of one instrumentation run, `[a-z0-9_-]{1,64}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn parse(value: &str) -> Result<Self, TracecapError> {
        if value.is_empty() {
            return Err(TracecapError::Validation("run id may not be empty".to_string()));
        }
        if value.len() > RUN_ID_MAX_LEN {
            return Err(TracecapError::Validation(format!(
                "run id '{value}' is longer than {RUN_ID_MAX_LEN} characters"
            )));
        }
        if let Some(bad) = value.chars().find(|c| !is_run_id_char(*c)) {
            return Err(TracecapError::Validation(format!(
                "run id '{value}' contains '{bad}'; allowed are a-z, 0-9, '_' and '-'"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_run_id_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
}

impl TryFrom<String> for RunId {
    type Error = TracecapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inputs of one supervised run. Paths are relative to the workspace unless
/// absolute. `agent_overrides` is the newline-delimited `key=value` block the
/// monitoring configuration is amended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationRequest {
    pub run_id: String,
    pub run_name: Option<String>,
    pub job_name: Option<String>,
    pub target_artifact_path: PathBuf,
    pub agent_weaving_config_path: Option<PathBuf>,
    pub extra_process_args: Option<String>,
    pub extra_vm_options: Option<String>,
    pub execute_duration_seconds: u64,
    pub skip_default_weaving: bool,
    pub fail_if_no_records: bool,
    pub agent_overrides: Option<String>,
    pub custom_agent_binary_path: Option<PathBuf>,
}

impl InstrumentationRequest {
    pub fn new(
        run_id: impl Into<String>,
        target_artifact_path: impl Into<PathBuf>,
        execute_duration_seconds: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            run_name: None,
            job_name: None,
            target_artifact_path: target_artifact_path.into(),
            agent_weaving_config_path: None,
            extra_process_args: None,
            extra_vm_options: None,
            execute_duration_seconds,
            skip_default_weaving: true,
            fail_if_no_records: true,
            agent_overrides: None,
            custom_agent_binary_path: None,
        }
    }

    /// Application name handed to the agent: `<job>_<runId>` when a job name
    /// is known, the bare run id otherwise.
    pub fn application_name(&self) -> String {
        match self.job_name.as_deref().map(str::trim) {
            Some(job) if !job.is_empty() => format!("{job}_{}", self.run_id),
            _ => self.run_id.clone(),
        }
    }
}

pub fn validate_duration(seconds: u64) -> Result<(), TracecapError> {
    if seconds == 0 {
        return Err(TracecapError::Validation(
            "execute duration must be a positive number of seconds".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(i32),
    Killed(u64),
    LaunchFailed(TracecapError),
    RecordsMissing,
}

impl RunOutcome {
    /// Classify a normal process exit. 130 counts as killed.
    pub fn from_exit(exit_code: i32, elapsed_seconds: u64) -> Self {
        if exit_code == EXIT_CODE_KILLED {
            Self::Killed(elapsed_seconds)
        } else {
            Self::Completed(exit_code)
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed(code) => Some(*code),
            Self::Killed(_) => Some(EXIT_CODE_KILLED),
            Self::LaunchFailed(_) | Self::RecordsMissing => None,
        }
    }

    pub fn is_abnormal_exit(&self) -> bool {
        matches!(self, Self::Completed(code) if *code != EXIT_CODE_SUCCESS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Killed(_) => "killed",
            Self::LaunchFailed(_) => "launch_failed",
            Self::RecordsMissing => "records_missing",
        }
    }
}

/// A subdirectory of a working directory holding at least one marker file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDirectory {
    pub path: PathBuf,
    pub name: String,
    pub marker_files: Vec<PathBuf>,
}
