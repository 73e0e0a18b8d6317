//! Error types for kiln executors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("failed to pull image {image}: {message}")]
    PullFailure { image: String, message: String },

    #[error("failed to create container {name}: {message}")]
    ContainerCreate { name: String, message: String },

    #[error("failed to start container {name}: {message}")]
    ContainerStart { name: String, message: String },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("remote execution failed{}: {message}", exit_code.map(|c| format!(" with exit code {c}")).unwrap_or_default())]
    RemoteExecution {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true when the error is the job's own result rather than an
    /// infrastructure failure of the runner.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Error::RemoteExecution { .. })
    }

    pub(crate) fn missing(field: &str) -> Self {
        Error::Config(format!("missing {field}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
