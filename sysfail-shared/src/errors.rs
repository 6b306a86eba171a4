//! Error types used across the sysfail engine.

use thiserror::Error;

/// Result type for sysfail operations.
pub type SysfailResult<T> = Result<T, SysfailError>;

#[derive(Debug, Error)]
pub enum SysfailError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a sysfail session is already active in this process")]
    AlreadyActive,

    #[error("could not uniquely identify this library's own executable mapping: {0}")]
    MapNotFound(String),

    #[error("failed to install signal handler: {0}")]
    SignalInstallFailed(String),

    #[error("kernel refused syscall user-dispatch request (errno {0})")]
    KernelRefusedDispatch(i32),

    #[error("failed to start thread-discovery background thread: {0}")]
    MonitorStartFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for SysfailError {
    fn from(err: std::io::Error) -> Self {
        SysfailError::Internal(format!("I/O error: {}", err))
    }
}

impl From<std::num::ParseIntError> for SysfailError {
    fn from(err: std::num::ParseIntError) -> Self {
        SysfailError::Internal(format!("parse error: {}", err))
    }
}
