use crate::errors::TracecapError;
use crate::runtime::ProcessRequest;
use crate::tokenize::tokenize;
use std::path::{Path, PathBuf};

pub const ARG_JAVA_AGENT: &str = "-javaagent:";
pub const ARG_JAR: &str = "-jar";
pub const ARG_MONITORING_CONFIGURATION: &str = "-Dkieker.monitoring.configuration=";
pub const ARG_WEAVER_CONFIGURATION: &str = "-Dorg.aspectj.weaver.loadtime.configuration=";
pub const ARG_SKIP_DEFAULT_AOP: &str = "-Dkieker.monitoring.skipDefaultAOPConfiguration=true";
pub const ARG_SEPARATOR: &str = "--";

/// Everything needed to start the target JVM with the agent attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub java_binary: String,
    pub agent_path: PathBuf,
    /// Passed through verbatim; the weaver ignores absolute paths.
    pub weaving_config: Option<PathBuf>,
    pub monitoring_config: PathBuf,
    pub skip_default_weaving: bool,
    pub vm_options: Option<String>,
    pub artifact: PathBuf,
    pub program_args: Option<String>,
}

impl LaunchCommand {
    pub fn args(&self) -> Result<Vec<String>, TracecapError> {
        let mut args = vec![format!("{ARG_JAVA_AGENT}{}", self.agent_path.display())];
        if let Some(weaving) = &self.weaving_config {
            args.push(format!("{ARG_WEAVER_CONFIGURATION}{}", weaving.display()));
        }
        args.push(format!(
            "{ARG_MONITORING_CONFIGURATION}{}",
            self.monitoring_config.display()
        ));
        if self.skip_default_weaving {
            args.push(ARG_SKIP_DEFAULT_AOP.to_string());
        }
        if let Some(vm_options) = non_blank(self.vm_options.as_deref()) {
            args.extend(tokenize(vm_options)?);
        }
        args.push(ARG_JAR.to_string());
        args.push(self.artifact.display().to_string());
        if let Some(program_args) = non_blank(self.program_args.as_deref()) {
            args.push(ARG_SEPARATOR.to_string());
            args.extend(tokenize(program_args)?);
        }
        Ok(args)
    }

    pub fn to_request(&self, cwd: &Path) -> Result<ProcessRequest, TracecapError> {
        Ok(ProcessRequest {
            program: self.java_binary.clone(),
            args: self.args()?,
            cwd: Some(cwd.to_path_buf()),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Check user VM options for flags the supervisor sets itself. Returns
/// warnings; overriding the monitoring configuration is an error because the
/// generated one would silently stop applying.
pub fn lint_vm_options(vm_options: &str) -> Result<Vec<String>, TracecapError> {
    if vm_options.contains(ARG_MONITORING_CONFIGURATION) {
        return Err(TracecapError::Validation(
            "do not specify the kieker monitoring configuration in the VM options; it is generated for every run"
                .to_string(),
        ));
    }
    let mut warnings = Vec::new();
    if vm_options.contains(ARG_JAVA_AGENT) {
        warnings.push(format!(
            "do not specify {ARG_JAVA_AGENT} in the VM options; the agent is attached automatically"
        ));
    }
    if tokenize(vm_options)?.iter().any(|arg| arg == ARG_JAR) {
        warnings.push(format!(
            "do not specify {ARG_JAR} in the VM options; it is set automatically"
        ));
    }
    if vm_options.contains(ARG_WEAVER_CONFIGURATION) {
        warnings.push(
            "do not specify the AspectJ weaver configuration in the VM options; use the weaving config path instead"
                .to_string(),
        );
    }
    Ok(warnings)
}
