use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Duplicate task: {0}")]
    DuplicateTask(String),

    #[error("Circular dependency: {0}")]
    CircularDependency(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Task {task_id} stalled ({stall_count} stalls)")]
    Stalled { task_id: String, stall_count: u32 },

    #[error("Terminal failure: {0}")]
    TerminalFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Collaboration unavailable: {0}")]
    Collaboration(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification used by callers that only care about how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown id or malformed request.
    Validation,
    /// Duplicate registration, dependency cycle, resource already held.
    Conflict,
    Timeout,
    /// No progress within the threshold; recoverable while retries remain.
    Stall,
    /// Stall budget exhausted or unrecoverable task error.
    Terminal,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::NotFound(_) => ErrorKind::Validation,
            Error::AlreadyRegistered(_)
            | Error::DuplicateTask(_)
            | Error::CircularDependency(_)
            | Error::ResourceUnavailable(_) => ErrorKind::Conflict,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Stalled { .. } => ErrorKind::Stall,
            Error::TerminalFailure(_) => ErrorKind::Terminal,
            Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Yaml(_)
            | Error::Storage(_)
            | Error::Collaboration(_)
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// True for outcomes that are expected under normal contention.
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

pub type Result<T> = std::result::Result<T, Error>;
