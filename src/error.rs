use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::backend::BackendKind;
use crate::job::JobId;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Which container lifecycle operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

/// Crate-wide error type.
///
/// Every variant carries a stable [`Error::code`] and, where it applies, the backend the
/// failure pertains to ([`Error::method`]) so a client can decide whether to retry a different
/// method explicitly.
///
/// This is intentionally decoupled from `anyhow` so downstream crates aren't forced to adopt
/// `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The request was rejected before dispatch.
    #[error("{message}")]
    Validation { code: &'static str, message: String },

    /// The backend is not registered (disabled or missing prerequisites).
    ///
    /// This is a configuration state, so it is never retried via fallback.
    #[error("backend '{method}' is not available")]
    BackendUnavailable { method: BackendKind },

    /// The backend was attempted and failed.
    #[error("backend '{method}' failed: {message}")]
    BackendExecution { method: BackendKind, message: String },

    /// The backend did not answer within the configured per-attempt timeout.
    #[error("backend '{method}' timed out after {}s", .after.as_secs())]
    Timeout { method: BackendKind, after: Duration },

    /// The job was cancelled while the backend was working on it.
    #[error("job {job_id} on backend '{method}' was cancelled")]
    JobCancelled { method: BackendKind, job_id: JobId },

    #[error("job '{job_id}' not found")]
    JobNotFound { job_id: String },

    #[error("failed to {action} container: {message}")]
    ContainerLifecycle {
        action: ContainerAction,
        message: String,
    },

    /// Every candidate in the fallback chain failed; `last` is the terminal error.
    #[error("all {} attempted backends failed; last error: {last}", .attempted.len())]
    AllBackendsFailed {
        attempted: Vec<BackendKind>,
        last: Box<Error>,
    },
}

impl Error {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn execution(method: BackendKind, message: impl Into<String>) -> Self {
        Self::BackendExecution {
            method,
            message: message.into(),
        }
    }

    /// Stable, client-facing error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::BackendUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::BackendExecution { .. } => "TRANSCRIPTION_FAILED",
            Self::Timeout { .. } => "TRANSCRIPTION_TIMEOUT",
            Self::JobCancelled { .. } => "JOB_CANCELLED",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::ContainerLifecycle {
                action: ContainerAction::Start,
                ..
            } => "CONTAINER_START_FAILED",
            Self::ContainerLifecycle {
                action: ContainerAction::Stop,
                ..
            } => "CONTAINER_STOP_FAILED",
            Self::AllBackendsFailed { .. } => "TRANSCRIPTION_FAILED",
        }
    }

    /// The backend this error pertains to, if any.
    pub fn method(&self) -> Option<BackendKind> {
        match self {
            Self::BackendUnavailable { method }
            | Self::BackendExecution { method, .. }
            | Self::Timeout { method, .. }
            | Self::JobCancelled { method, .. } => Some(*method),
            Self::AllBackendsFailed { last, .. } => last.method(),
            Self::Validation { .. } | Self::JobNotFound { .. } | Self::ContainerLifecycle { .. } => {
                None
            }
        }
    }

    /// Whether the router may move on to the next candidate after this error.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::BackendExecution { .. } | Self::Timeout { .. })
    }
}
