use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TracecapError {
    #[error("io error: {0}")]
    Io(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("preflight check failed: {0}")]
    Preflight(String),
    #[error("launch error: {0}")]
    Launch(String),
    #[error("abnormal exit: {0}")]
    AbnormalExit(String),
    #[error("records missing: {0}")]
    RecordsMissing(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("scan io error: {0}")]
    ScanIo(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("replay error: {0}")]
    Replay(String),
}
