// Spindle error types
//
// One taxonomy for every layer. Stages raise these, the executor classifies
// them into an item status, and the IPC server maps them onto wire errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpindleError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Disc already in queue: {0}")]
    DuplicateFingerprint(String),

    #[error("Daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("Daemon not running: {0}")]
    NotRunning(String),

    #[error("Storage unavailable: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Database schema version {found} is newer than this build supports (max {supported})")]
    SchemaMismatch { found: u32, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("External tool error: {0}")]
    ExternalTool(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stopped by user")]
    Stopped,

    #[error("Needs review: {0}")]
    ReviewRequired(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Wire-level error categories for the IPC surface. The CLI maps these to
/// exit codes; the daemon only guarantees the category and a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotRunning,
    NotFound,
    Conflict,
    Validation,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotRunning => "not_running",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl SpindleError {
    /// Category used on the IPC wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SpindleError::Validation(_) | SpindleError::Configuration(_) => ErrorKind::Validation,
            SpindleError::NotFound(_) | SpindleError::EpisodeNotFound(_) => ErrorKind::NotFound,
            SpindleError::Conflict(_)
            | SpindleError::DuplicateFingerprint(_)
            | SpindleError::AlreadyRunning(_) => ErrorKind::Conflict,
            SpindleError::NotRunning(_) => ErrorKind::NotRunning,
            _ => ErrorKind::Internal,
        }
    }

    /// True for errors the caller may retry locally without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SpindleError::Conflict(_))
    }
}

impl From<anyhow::Error> for SpindleError {
    fn from(err: anyhow::Error) -> Self {
        SpindleError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SpindleError>;
