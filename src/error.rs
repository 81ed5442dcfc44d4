//! Error types for the executor.

use crate::network::NetMode;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running or attaching to an execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Execution identity failed validation.
    #[error("invalid execution identity '{id}': {reason}")]
    InvalidIdentity { id: String, reason: String },

    /// No network provider is registered for the requested mode.
    #[error("unknown network mode {0}")]
    UnknownNetworkMode(NetMode),

    /// User specification could not be parsed or resolved.
    #[error("invalid user '{user}': {reason}")]
    InvalidUser { user: String, reason: String },

    /// Executor configuration is inconsistent.
    #[error("invalid executor config: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Identity is not registered as a live execution.
    #[error("container {0} not found")]
    ContainerNotFound(String),

    /// Identity is already registered by a live execution.
    #[error("container {0} already exists")]
    ContainerAlreadyExists(String),

    /// Execution finished before the attach could happen.
    #[error("container {0} has stopped")]
    ContainerStopped(String),

    /// Execution finished with an error before the attach could happen.
    #[error("container {id} has exited with error: {reason}")]
    ContainerExited { id: String, reason: String },

    // =========================================================================
    // Resource Acquisition Errors
    // =========================================================================
    /// Resolver or hosts file generation failed.
    #[error("failed to prepare {file} for '{id}': {reason}")]
    NetworkFiles {
        id: String,
        file: &'static str,
        reason: String,
    },

    /// Mounting a filesystem failed.
    #[error("failed to mount {what} for '{id}': {reason}")]
    MountFailed {
        id: String,
        what: &'static str,
        reason: String,
    },

    /// Working directory is unusable.
    #[error("working dir {path} for '{id}': {reason}")]
    WorkingDir {
        id: String,
        path: PathBuf,
        reason: String,
    },

    /// Network namespace acquisition failed.
    #[error("failed to create network namespace for '{id}': {reason}")]
    NamespaceFailed { id: String, reason: String },

    /// OCI spec generation failed.
    #[error("failed to generate OCI spec: {0}")]
    SpecGenerationFailed(String),

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Task create failed.
    #[error("failed to create task '{id}': {reason}")]
    TaskCreateFailed { id: String, reason: String },

    /// Task start failed.
    #[error("failed to start task '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Exit status channel could not be obtained.
    #[error("failed to wait on task '{id}': {reason}")]
    WaitFailed { id: String, reason: String },

    // =========================================================================
    // Process Exit Errors
    // =========================================================================
    /// Process exited with a non-zero code.
    #[error("process returned non-zero exit code: {0}")]
    NonZeroExit(u32),

    /// Runtime could not collect the exit status.
    #[error("failure waiting for process: {0}")]
    ProcessFailed(String),

    /// Caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Process failed after the caller cancelled the run.
    #[error("{0}: operation cancelled")]
    CancelledDuring(Box<Error>),

    // =========================================================================
    // Teardown Errors
    // =========================================================================
    /// Signal delivery failed.
    #[error("failed to send signal to task '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Container delete failed.
    #[error("failed to delete container {id}: {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Task delete failed.
    #[error("failed to delete task {id}: {reason}")]
    TaskDeleteFailed { id: String, reason: String },

    /// Releasing a non-runtime resource failed.
    #[error("failed to release {step} for '{id}': {reason}")]
    ReleaseFailed {
        id: String,
        step: &'static str,
        reason: String,
    },

    // =========================================================================
    // Attach Errors
    // =========================================================================
    /// Exec failed.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    /// Operation not supported by this platform or runtime.
    #[error("operation not supported: {0}")]
    NotSupported(String),

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
    /// Returns true if the caller's cancellation caused or shaped this error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::CancelledDuring(_))
    }

    /// Returns true for container and task deletion failures, the only
    /// teardown errors allowed to become a run's primary error.
    pub fn is_runtime_teardown(&self) -> bool {
        matches!(self, Self::DeleteFailed { .. } | Self::TaskDeleteFailed { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// Run Error
// =============================================================================

/// Failure of a run: the primary error plus any teardown errors that were
/// suppressed in its favour.
#[derive(Debug)]
pub struct RunError {
    primary: Error,
    suppressed: Vec<Error>,
}

impl RunError {
    /// Creates a run error with suppressed teardown failures.
    pub fn new(primary: Error, suppressed: Vec<Error>) -> Self {
        Self {
            primary,
            suppressed,
        }
    }

    /// Returns the error that decided the run's outcome.
    pub fn primary(&self) -> &Error {
        &self.primary
    }

    /// Returns teardown errors that were not reported as primary.
    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }

    /// Consumes the run error, returning the primary error.
    pub fn into_primary(self) -> Error {
        self.primary
    }
}

impl From<Error> for RunError {
    fn from(primary: Error) -> Self {
        Self::new(primary, Vec::new())
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary)?;
        match self.suppressed.len() {
            0 => Ok(()),
            1 => write!(f, " (1 teardown error suppressed)"),
            n => write!(f, " ({n} teardown errors suppressed)"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.primary)
    }
}
