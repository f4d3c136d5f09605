use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure of a single job. Every variant is scoped to exactly one job; the
/// dispatcher records it in the ledger and moves on to the next job.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid sweep specification for '{path}' ({raw}): {reason}")]
    InvalidSweepSpecification {
        path: String,
        raw: String,
        reason: String,
    },

    #[error("sweep data source error for '{path}': {reason}")]
    SweepDataSource { path: String, reason: String },

    #[error("workspace setup failed: {0}")]
    WorkspaceSetup(String),

    #[error("simulation engine error: {0}")]
    SimulationEngine(String),

    #[error("simulation timed out after {seconds}s")]
    SimulationTimeout { seconds: u64 },

    #[error("rewrite target invalid: {0}")]
    RewriteTargetInvalid(String),

    #[error("handler resolution error: {0}")]
    HandlerResolution(String),

    #[error("handler execution error: {0}")]
    HandlerExecution(String),

    #[error("handler contract violation: {0}")]
    HandlerContractViolation(String),

    #[error("job cancelled before it started")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidSweepSpecification,
    SweepDataSourceError,
    WorkspaceSetupError,
    SimulationEngineError,
    SimulationTimeout,
    RewriteTargetInvalid,
    HandlerResolutionError,
    HandlerExecutionError,
    HandlerContractViolation,
    Cancelled,
    IoError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidSweepSpecification => "InvalidSweepSpecification",
            ErrorKind::SweepDataSourceError => "SweepDataSourceError",
            ErrorKind::WorkspaceSetupError => "WorkspaceSetupError",
            ErrorKind::SimulationEngineError => "SimulationEngineError",
            ErrorKind::SimulationTimeout => "SimulationTimeout",
            ErrorKind::RewriteTargetInvalid => "RewriteTargetInvalid",
            ErrorKind::HandlerResolutionError => "HandlerResolutionError",
            ErrorKind::HandlerExecutionError => "HandlerExecutionError",
            ErrorKind::HandlerContractViolation => "HandlerContractViolation",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::IoError => "IoError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::InvalidSweepSpecification { .. } => ErrorKind::InvalidSweepSpecification,
            JobError::SweepDataSource { .. } => ErrorKind::SweepDataSourceError,
            JobError::WorkspaceSetup(_) => ErrorKind::WorkspaceSetupError,
            JobError::SimulationEngine(_) => ErrorKind::SimulationEngineError,
            JobError::SimulationTimeout { .. } => ErrorKind::SimulationTimeout,
            JobError::RewriteTargetInvalid(_) => ErrorKind::RewriteTargetInvalid,
            JobError::HandlerResolution(_) => ErrorKind::HandlerResolutionError,
            JobError::HandlerExecution(_) => ErrorKind::HandlerExecutionError,
            JobError::HandlerContractViolation(_) => ErrorKind::HandlerContractViolation,
            JobError::Cancelled => ErrorKind::Cancelled,
            JobError::Io(_) => ErrorKind::IoError,
        }
    }

    /// Rebuilds an error reported by a worker process. The message is kept
    /// verbatim; structured fields that cannot cross the boundary are folded
    /// into it.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidSweepSpecification => JobError::InvalidSweepSpecification {
                path: String::new(),
                raw: String::new(),
                reason: message,
            },
            ErrorKind::SweepDataSourceError => JobError::SweepDataSource {
                path: String::new(),
                reason: message,
            },
            ErrorKind::WorkspaceSetupError => JobError::WorkspaceSetup(message),
            ErrorKind::SimulationEngineError => JobError::SimulationEngine(message),
            ErrorKind::SimulationTimeout => {
                let seconds = message
                    .split_whitespace()
                    .find_map(|w| w.trim_end_matches('s').parse().ok())
                    .unwrap_or(0);
                JobError::SimulationTimeout { seconds }
            }
            ErrorKind::RewriteTargetInvalid => JobError::RewriteTargetInvalid(message),
            ErrorKind::HandlerResolutionError => JobError::HandlerResolution(message),
            ErrorKind::HandlerExecutionError => JobError::HandlerExecution(message),
            ErrorKind::HandlerContractViolation => JobError::HandlerContractViolation(message),
            ErrorKind::Cancelled => JobError::Cancelled,
            ErrorKind::IoError => JobError::Io(std::io::Error::new(std::io::ErrorKind::Other, message)),
        }
    }

    /// The message without the kind prefix, for carrying across a process
    /// boundary together with [`JobError::kind`].
    pub fn detail(&self) -> String {
        match self {
            JobError::WorkspaceSetup(m)
            | JobError::SimulationEngine(m)
            | JobError::RewriteTargetInvalid(m)
            | JobError::HandlerResolution(m)
            | JobError::HandlerExecution(m)
            | JobError::HandlerContractViolation(m) => m.clone(),
            JobError::Io(e) => e.to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn invalid_spec(path: &str, raw: &str, reason: impl Into<String>) -> Self {
        JobError::InvalidSweepSpecification {
            path: path.to_string(),
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
