use thiserror::Error;

#[derive(Debug, Error)]
pub enum HindsightError {
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
    #[error("run is sealed: {0}")]
    Sealed(String),
    #[error("no active run: {0}")]
    NoActiveRun(String),
    #[error("run already active: {0}")]
    AlreadyActive(String),
    #[error("nested step: {0}")]
    NestedStep(String),
    #[error("step limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("tool error: {0}")]
    Tool(String),
    #[error("replay cursor exhausted: {0}")]
    CursorExhausted(String),
}

impl From<std::io::Error> for HindsightError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for HindsightError {
    fn from(error: serde_json::Error) -> Self {
        Self::Io(error.to_string())
    }
}
