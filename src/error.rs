//! Error types for the container lifecycle core.
//!
//! Every error carries an [`ErrorCategory`] so callers can tell validation
//! problems from conflicts, missing objects, and host failures without
//! inspecting message text.

use crate::host::HostError;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad cause classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad or missing input; nothing was mutated.
    Validation,
    /// The container id is already taken.
    Conflict,
    /// The container (or a process in it) does not exist.
    NotFound,
    /// A host capability call failed.
    Host,
    /// Local I/O, serialization or invariant failures.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Conflict => write!(f, "conflict"),
            Self::NotFound => write!(f, "not-found"),
            Self::Host => write!(f, "host"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// One teardown step that failed during `delete`.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Name of the teardown step.
    pub step: &'static str,
    /// The error that step returned.
    pub error: Error,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Errors that can occur in the runtime core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Container ID failed validation.
    #[error("invalid container ID '{id}': {reason}")]
    InvalidContainerId { id: String, reason: String },

    /// Invalid bundle (missing config.json or required fields).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    /// Invalid process specification.
    #[error("invalid process spec: {0}")]
    InvalidProcess(String),

    /// A declared network rule cannot be translated.
    #[error("invalid network rule: {0}")]
    InvalidNetRule(String),

    /// Negative disk limit.
    #[error("disk limit must be a non-negative number of bytes, got {0}")]
    InvalidDiskLimit(i64),

    /// The rootfs layer named by the bundle or image tool is missing.
    #[error("rootfs layer does not exist: {}", .path.display())]
    RootfsNotFound { path: PathBuf },

    /// The parent layer chain next to the rootfs is unreadable.
    #[error("invalid layer chain at {path}: {reason}")]
    InvalidLayerChain { path: PathBuf, reason: String },

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container already exists.
    #[error("container with id already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container exists but cannot accept new processes.
    #[error("container '{id}' is in state '{state}', expected 'created' or 'running'")]
    ContainerNotRunning { id: String, state: String },

    /// One or more teardown steps failed; the remaining steps still ran.
    #[error("failed to delete container '{id}': {}", join_failures(.failures))]
    TeardownFailed {
        id: String,
        failures: Vec<TeardownFailure>,
    },

    // =========================================================================
    // Process Errors
    // =========================================================================
    /// Exit code requested before the process terminated.
    #[error("process {pid} has not exited")]
    ProcessNotExited { pid: u32 },

    /// Attach requested on a detached process or twice on the same handle.
    #[error("stdio of process {pid} is not attached")]
    StdioUnavailable { pid: u32 },

    // =========================================================================
    // Host Errors
    // =========================================================================
    /// A host capability call failed.
    #[error(transparent)]
    Host(#[from] HostError),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the cause category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidContainerId { .. }
            | Self::InvalidBundle { .. }
            | Self::InvalidProcess(_)
            | Self::InvalidNetRule(_)
            | Self::InvalidDiskLimit(_)
            | Self::RootfsNotFound { .. }
            | Self::InvalidLayerChain { .. } => ErrorCategory::Validation,
            Self::ContainerAlreadyExists(_) => ErrorCategory::Conflict,
            Self::ContainerNotFound(_) | Self::ContainerNotRunning { .. } => {
                ErrorCategory::NotFound
            }
            Self::Host(_) | Self::TeardownFailed { .. } => ErrorCategory::Host,
            Self::ProcessNotExited { .. }
            | Self::StdioUnavailable { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn join_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
