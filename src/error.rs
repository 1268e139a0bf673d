//! Error types shared across the broker.

/// Errors produced by the broker core and its drivers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),

    #[error("unknown image '{0}'")]
    UnknownImage(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("no such job {0}")]
    NoSuchJob(u64),

    #[error("access denied")]
    AccessDenied,

    #[error("invalid path '{0}'")]
    InvalidPath(String),

    #[error("VM '{vm}' failed: {reason}")]
    Vm { vm: String, reason: String },

    #[error("driver error: {0}")]
    Driver(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Shorthand for a driver-level failure on a specific VM.
    pub fn vm(vm: &str, reason: impl Into<String>) -> Self {
        Self::Vm {
            vm: vm.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
