use std::path::PathBuf;

use thiserror::Error;

/// Problems with the config file itself, before any subsystem starts.
/// `Invalid` covers semantic checks (loopback listen, known timezone,
/// parseable durations) that TOML deserialization cannot express.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Unreadable { path: PathBuf, source: std::io::Error },
    #[error("config is not valid TOML: {0}")]
    Malformed(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Core error taxonomy, shared by the agent, the daemon, and the CLI.
///
/// Every kind crosses the IPC boundary: the daemon maps it to an HTTP
/// status, the client maps the status back, and the CLI maps it to an
/// exit code. Only `Transient` is ever retried.
#[derive(Debug, Error)]
pub enum FenceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("commitment violation: {0}")]
    CommitmentViolation(String),

    #[error("not authorized")]
    AuthorizationDenied,

    #[error("enforcement failure: {0}")]
    Enforcement(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("a block is already running until {0}")]
    AlreadyRunning(String),

    #[error("transient error: {0}")]
    Transient(String),
}

impl FenceError {
    /// CLI exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            FenceError::AuthorizationDenied => 2,
            FenceError::NotFound(_) => 3,
            FenceError::AlreadyRunning(_) => 4,
            _ => 1,
        }
    }

    /// HTTP status used on the IPC surface.
    pub fn status_code(&self) -> u16 {
        match self {
            FenceError::Validation(_) => 422,
            FenceError::CommitmentViolation(_) => 409,
            FenceError::AuthorizationDenied => 401,
            FenceError::NotFound(_) => 404,
            FenceError::AlreadyRunning(_) => 409,
            FenceError::Enforcement(_) | FenceError::Transient(_) => 500,
        }
    }

    /// Inverse of `status_code`, used by the IPC client. The `detail`
    /// string comes from the response body.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            401 | 403 => FenceError::AuthorizationDenied,
            404 => FenceError::NotFound(detail),
            409 if detail.starts_with("a block is already running") => {
                let until = detail.rsplit(' ').next().unwrap_or("").to_string();
                FenceError::AlreadyRunning(until)
            }
            409 => FenceError::CommitmentViolation(detail),
            422 => FenceError::Validation(detail),
            _ => FenceError::Enforcement(detail),
        }
    }
}

pub type FenceResult<T> = Result<T, FenceError>;
