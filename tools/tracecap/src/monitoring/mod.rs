//! Generation of the monitoring-agent configuration file.
//!
//! A configuration always selects exactly one writer backend and one output
//! location. Callers may amend it with a `key=value` override block; keys
//! that would change the writer selection or the storage path are refused
//! with a warning.

pub mod properties;

use crate::errors::TracecapError;
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const PROPERTY_PREFIX: &str = "kieker.monitoring.";
pub const WRITER_KEY: &str = "kieker.monitoring.writer";
pub const APPLICATION_NAME_KEY: &str = "kieker.monitoring.applicationName";

pub const FILE_WRITER_CLASS: &str = "kieker.monitoring.writer.filesystem.FileWriter";
pub const STORAGE_PATH_KEY: &str = "kieker.monitoring.writer.filesystem.FileWriter.customStoragePath";

pub const TCP_WRITER_CLASS: &str = "kieker.monitoring.writer.tcp.SingleSocketTcpWriter";
pub const TCP_HOSTNAME_KEY: &str = "kieker.monitoring.writer.tcp.SingleSocketTcpWriter.hostname";
pub const TCP_PORT_KEY: &str = "kieker.monitoring.writer.tcp.SingleSocketTcpWriter.port";
pub const DEFAULT_TCP_HOST: &str = "localhost";
pub const DEFAULT_TCP_PORT: u16 = 10133;

const WRITER_NAMESPACE: &str = "kieker.monitoring.writer.";
const RESERVED_KEYS: [&str; 2] = [WRITER_KEY, STORAGE_PATH_KEY];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriterBackend {
    /// Records go to files below `storage_path`. An empty path leaves the
    /// location to the agent.
    FileWriter { storage_path: PathBuf },
    /// Records are streamed to a single TCP collector.
    TcpWriter { host: String, port: u16 },
}

impl WriterBackend {
    pub fn file(storage_path: impl Into<PathBuf>) -> Self {
        Self::FileWriter {
            storage_path: storage_path.into(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::TcpWriter {
            host: host.into(),
            port,
        }
    }

    pub fn writer_class(&self) -> &'static str {
        match self {
            Self::FileWriter { .. } => FILE_WRITER_CLASS,
            Self::TcpWriter { .. } => TCP_WRITER_CLASS,
        }
    }

    /// Namespace of this writer's own keys, including the trailing dot.
    pub fn property_prefix(&self) -> String {
        format!("{}.", self.writer_class())
    }

    pub fn default_config(&self) -> Result<MonitoringConfiguration, TracecapError> {
        let mut config = MonitoringConfiguration::default();
        config.set(WRITER_KEY, self.writer_class());
        match self {
            Self::FileWriter { storage_path } => {
                config.set(STORAGE_PATH_KEY, storage_path.display().to_string());
            }
            Self::TcpWriter { host, port } => {
                if host.trim().is_empty() {
                    return Err(TracecapError::InvalidConfig(
                        "tcp writer hostname may not be empty".to_string(),
                    ));
                }
                if *port == 0 {
                    return Err(TracecapError::InvalidConfig(
                        "tcp writer port must be in range (0,65535]".to_string(),
                    ));
                }
                config.set(TCP_HOSTNAME_KEY, host.trim());
                config.set_number(TCP_PORT_KEY, i64::from(*port));
            }
        }
        Ok(config)
    }

    /// Split overrides into the accepted ones and warnings for the rest.
    pub fn validate(
        &self,
        overrides: Vec<properties::PropertyLine>,
    ) -> (Vec<properties::PropertyLine>, Vec<ConfigWarning>) {
        let own_prefix = self.property_prefix();
        let mut accepted = Vec::new();
        let mut warnings = Vec::new();
        for line in overrides {
            let kind = if RESERVED_KEYS.contains(&line.key.as_str()) {
                Some(WarningKind::ReservedKey)
            } else if !line.key.starts_with(PROPERTY_PREFIX) {
                Some(WarningKind::ForeignNamespace)
            } else if line.key.starts_with(WRITER_NAMESPACE) && !line.key.starts_with(&own_prefix)
            {
                Some(WarningKind::InactiveWriter)
            } else {
                None
            };
            match kind {
                Some(kind) => warnings.push(ConfigWarning::new(kind, &line, self)),
                None => accepted.push(line),
            }
        }
        (accepted, warnings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ReservedKey,
    ForeignNamespace,
    InactiveWriter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub kind: WarningKind,
    pub line: usize,
    pub key: String,
    pub message: String,
}

impl ConfigWarning {
    fn new(kind: WarningKind, line: &properties::PropertyLine, backend: &WriterBackend) -> Self {
        let message = match kind {
            WarningKind::ReservedKey => format!(
                "'{}' is set by the run and cannot be overridden; ignored",
                line.key
            ),
            WarningKind::ForeignNamespace => format!(
                "'{}' does not start with '{PROPERTY_PREFIX}'; ignored",
                line.key
            ),
            WarningKind::InactiveWriter => format!(
                "'{}' configures a writer other than the active {}; ignored",
                line.key,
                backend.writer_class()
            ),
        };
        Self {
            kind,
            line: line.line,
            key: line.key.clone(),
            message,
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Agent properties keyed by fully-qualified name. Numbers are stored in
/// their decimal rendering; that is what ends up in the file anyway.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MonitoringConfiguration {
    properties: BTreeMap<String, String>,
}

impl MonitoringConfiguration {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn set_number(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn get_number(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn writer_class(&self) -> Option<&str> {
        self.get(WRITER_KEY)
    }

    pub fn storage_path(&self) -> Option<&str> {
        self.get(STORAGE_PATH_KEY)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Deterministic, key-sorted file contents.
    pub fn serialize(&self) -> String {
        properties::render(&self.properties)
    }

    pub fn parse(text: &str) -> Result<Self, TracecapError> {
        Ok(Self {
            properties: properties::parse_map(text)?,
        })
    }

    pub fn write_to(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), TracecapError> {
        fs.write_string(path, &self.serialize())
    }
}

/// Named set of extra agent properties layered between writer defaults and
/// caller overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, CaptureProfile>,
    default_profile: String,
}

impl ProfileRegistry {
    pub fn empty(default_profile: impl Into<String>) -> Self {
        Self {
            profiles: BTreeMap::new(),
            default_profile: default_profile.into(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty("default");
        registry.register(CaptureProfile {
            name: "default".to_string(),
            description: "Built-in Kieker 1.14 defaults".to_string(),
            properties: BTreeMap::from([(
                "kieker.monitoring.enabled".to_string(),
                "true".to_string(),
            )]),
        });
        registry.register(CaptureProfile {
            name: "debug".to_string(),
            description: "Kieker defaults with agent debug output".to_string(),
            properties: BTreeMap::from([
                ("kieker.monitoring.enabled".to_string(), "true".to_string()),
                ("kieker.monitoring.debug".to_string(), "true".to_string()),
            ]),
        });
        registry
    }

    pub fn register(&mut self, profile: CaptureProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&CaptureProfile> {
        self.profiles.get(name)
    }

    pub fn default_profile(&self) -> &str {
        &self.default_profile
    }

    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltConfiguration {
    pub configuration: MonitoringConfiguration,
    pub warnings: Vec<ConfigWarning>,
}

pub struct ConfigurationBuilder {
    registry: ProfileRegistry,
}

impl ConfigurationBuilder {
    pub fn new(registry: ProfileRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn build(
        &self,
        backend: &WriterBackend,
        overrides: Option<&str>,
    ) -> Result<BuiltConfiguration, TracecapError> {
        self.build_with_profile(backend, None, overrides)
    }

    /// Writer defaults, then the profile's properties, then the caller's
    /// override block. A malformed block fails the whole build.
    pub fn build_with_profile(
        &self,
        backend: &WriterBackend,
        profile: Option<&str>,
        overrides: Option<&str>,
    ) -> Result<BuiltConfiguration, TracecapError> {
        let profile_name = profile.unwrap_or(self.registry.default_profile());
        let mut configuration = backend.default_config()?;
        let mut warnings = Vec::new();

        if let Some(profile) = self.registry.get(profile_name) {
            let lines = profile
                .properties
                .iter()
                .map(|(key, value)| properties::PropertyLine {
                    line: 0,
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect();
            let (accepted, refused) = backend.validate(lines);
            warnings.extend(refused);
            for line in accepted {
                configuration.set(line.key, line.value);
            }
        } else if profile.is_some() || !self.registry.names().is_empty() {
            return Err(TracecapError::InvalidConfig(format!(
                "unknown capture profile '{profile_name}'; available: {}",
                self.registry.names().join(", ")
            )));
        }

        if let Some(text) = overrides {
            let parsed = properties::parse_lines(text)?;
            let (accepted, refused) = backend.validate(parsed);
            warnings.extend(refused);
            for line in accepted {
                configuration.set(line.key, line.value);
            }
        }

        Ok(BuiltConfiguration {
            configuration,
            warnings,
        })
    }
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new(ProfileRegistry::builtin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeFileSystem, FileSystem};

    #[test]
    fn file_writer_defaults_point_at_storage_path() {
        let built = ConfigurationBuilder::default()
            .build(&WriterBackend::file("/ws/tracecap-build-42"), None)
            .expect("build");
        let cfg = built.configuration;
        assert_eq!(cfg.writer_class(), Some(FILE_WRITER_CLASS));
        assert_eq!(cfg.storage_path(), Some("/ws/tracecap-build-42"));
        assert!(built.warnings.is_empty());
    }

    #[test]
    fn tcp_writer_defaults_to_localhost_10133() {
        let cfg = WriterBackend::tcp(DEFAULT_TCP_HOST, DEFAULT_TCP_PORT)
            .default_config()
            .expect("defaults");
        assert_eq!(cfg.get(TCP_HOSTNAME_KEY), Some("localhost"));
        assert_eq!(cfg.get_number(TCP_PORT_KEY), Some(10133));
        assert_eq!(cfg.storage_path(), None);
    }

    #[test]
    fn tcp_writer_rejects_bad_endpoint() {
        assert!(WriterBackend::tcp("", 10133).default_config().is_err());
        assert!(WriterBackend::tcp("localhost", 0).default_config().is_err());
    }

    #[test]
    fn reserved_keys_are_refused_and_keep_their_values() {
        let overrides = format!(
            "{WRITER_KEY}={TCP_WRITER_CLASS}\n{STORAGE_PATH_KEY}=/elsewhere\nkieker.monitoring.debug=true\n"
        );
        let built = ConfigurationBuilder::default()
            .build(&WriterBackend::file("/ws/run"), Some(&overrides))
            .expect("build");
        assert_eq!(built.warnings.len(), 2);
        assert!(built
            .warnings
            .iter()
            .all(|w| w.kind == WarningKind::ReservedKey));
        assert_eq!(built.configuration.writer_class(), Some(FILE_WRITER_CLASS));
        assert_eq!(built.configuration.storage_path(), Some("/ws/run"));
        assert_eq!(built.configuration.get("kieker.monitoring.debug"), Some("true"));
    }

    #[test]
    fn foreign_and_inactive_writer_keys_warn() {
        let overrides = "java.io.tmpdir=/tmp\nkieker.monitoring.writer.tcp.SingleSocketTcpWriter.port=1\nkieker.monitoring.writer.filesystem.FileWriter.maxEntriesInFile=5000\n";
        let built = ConfigurationBuilder::default()
            .build(&WriterBackend::file("/ws/run"), Some(overrides))
            .expect("build");
        let kinds = built.warnings.iter().map(|w| w.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![WarningKind::ForeignNamespace, WarningKind::InactiveWriter]
        );
        assert_eq!(built.warnings[0].line, 1);
        assert_eq!(
            built
                .configuration
                .get("kieker.monitoring.writer.filesystem.FileWriter.maxEntriesInFile"),
            Some("5000")
        );
        assert_eq!(built.configuration.get("java.io.tmpdir"), None);
    }

    #[test]
    fn malformed_override_fails_with_line() {
        let err = ConfigurationBuilder::default()
            .build(&WriterBackend::file("/ws/run"), Some("kieker.monitoring.debug=true\noops"))
            .expect_err("malformed");
        assert!(matches!(err, TracecapError::ConfigParse(ref msg) if msg.contains("line 2")));
    }

    #[test]
    fn profiles_layer_under_overrides() {
        let builder = ConfigurationBuilder::default();
        let built = builder
            .build_with_profile(
                &WriterBackend::file("/ws/run"),
                Some("debug"),
                Some("kieker.monitoring.debug=false"),
            )
            .expect("build");
        assert_eq!(built.configuration.get("kieker.monitoring.debug"), Some("false"));
        assert_eq!(built.configuration.get("kieker.monitoring.enabled"), Some("true"));

        let err = builder
            .build_with_profile(&WriterBackend::file("/ws/run"), Some("missing"), None)
            .expect_err("unknown profile");
        assert!(format!("{err}").contains("missing"));
    }

    #[test]
    fn injected_registry_replaces_builtin_profiles() {
        let mut registry = ProfileRegistry::empty("sampling");
        registry.register(CaptureProfile {
            name: "sampling".to_string(),
            description: "cpu sampling".to_string(),
            properties: BTreeMap::from([(
                "kieker.monitoring.periodicSensorsPoolSize".to_string(),
                "2".to_string(),
            )]),
        });
        let built = ConfigurationBuilder::new(registry)
            .build(&WriterBackend::file("/ws/run"), None)
            .expect("build");
        assert_eq!(
            built.configuration.get_number("kieker.monitoring.periodicSensorsPoolSize"),
            Some(2)
        );
        assert_eq!(built.configuration.get("kieker.monitoring.enabled"), None);
    }

    #[test]
    fn serialization_is_sorted_and_round_trips() {
        let mut a = MonitoringConfiguration::default();
        a.set("kieker.monitoring.z", "1");
        a.set("kieker.monitoring.a", "2");
        a.set_number("kieker.monitoring.m", 3);
        let mut b = MonitoringConfiguration::default();
        b.set_number("kieker.monitoring.m", 3);
        b.set("kieker.monitoring.a", "2");
        b.set("kieker.monitoring.z", "1");

        let text = a.serialize();
        assert_eq!(text, b.serialize());
        assert_eq!(
            text,
            "kieker.monitoring.a=2\nkieker.monitoring.m=3\nkieker.monitoring.z=1\n"
        );
        assert_eq!(MonitoringConfiguration::parse(&text).expect("parse"), a);
    }

    #[test]
    fn write_to_uses_file_system() {
        let fs = FakeFileSystem::default();
        let cfg = WriterBackend::file("/ws/run").default_config().expect("defaults");
        cfg.write_to(&fs, Path::new("/ws/run/kieker.monitoring.properties"))
            .expect("write");
        let text = fs
            .read_to_string(Path::new("/ws/run/kieker.monitoring.properties"))
            .expect("read");
        assert!(text.starts_with(&format!("{WRITER_KEY}={FILE_WRITER_CLASS}\n")));
    }
}
