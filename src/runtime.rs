//! Container runtime client interface.
//!
//! The executor drives containers and tasks through these traits; the
//! embedding application supplies the implementation (a containerd, youki or
//! runc adapter). Objects are keyed by the execution identity:
//!
//! ```text
//! new_container(id, spec) → new_task(rootfs, io) → start → wait ─┐
//!                                                    │           │
//!                              exec(exec_id, process) → start    │
//!                                                                ▼
//!                                            delete task → delete container
//! ```
//!
//! # Ownership
//!
//! A run owns the container and task it creates and deletes them during
//! teardown. Attach only loads them and never deletes anything.

use crate::error::Result;
use crate::mount::Mount;
use crate::spec::{ProcessSpec, RuntimeSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

// =============================================================================
// Task Status
// =============================================================================

/// Live status of a task as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task has been created but not started.
    Created,
    /// Task process is running.
    Running,
    /// Task process has exited.
    Stopped,
    /// Task is being paused.
    Pausing,
    /// Task is paused.
    Paused,
    /// Runtime could not determine the status.
    Unknown,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Pausing => write!(f, "pausing"),
            Self::Paused => write!(f, "paused"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Exit Status
// =============================================================================

/// Exit status delivered once a task's process terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code of the process.
    pub code: u32,
    /// Error the runtime hit while collecting the status, if any.
    pub error: Option<String>,
}

impl ExitStatus {
    /// Creates an exit status with the given code.
    pub fn new(code: u32) -> Self {
        Self { code, error: None }
    }

    /// Creates an "unknown" exit status carrying the collection error.
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            code: crate::constants::UNKNOWN_EXIT_STATUS,
            error: Some(error.into()),
        }
    }

    /// Returns true if the process exited with code zero.
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Receiver that resolves with the task's exit status.
pub type ExitReceiver = oneshot::Receiver<ExitStatus>;

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGINT (interrupt).
    Int,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Int => libc::SIGINT,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Int => write!(f, "SIGINT"),
        }
    }
}

// =============================================================================
// Process I/O
// =============================================================================

/// Standard streams handed to the runtime for a task or exec'd process.
#[derive(Default)]
pub struct ProcessIo {
    /// Stream copied to the process's stdin.
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    /// Sink receiving the process's stdout.
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Sink receiving the process's stderr.
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Allocate a terminal for the process.
    pub terminal: bool,
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("terminal", &self.terminal)
            .finish()
    }
}

// =============================================================================
// Runtime Traits
// =============================================================================

/// Client of the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Creates a container object named `id` bound to `spec`.
    ///
    /// No process is started; see [`Container::new_task`].
    async fn new_container(&self, id: &str, spec: &RuntimeSpec) -> Result<Arc<dyn Container>>;

    /// Loads an existing container by identity.
    async fn load_container(&self, id: &str) -> Result<Arc<dyn Container>>;
}

/// A container object known to the runtime.
#[async_trait]
pub trait Container: Send + Sync {
    /// Returns the container identity.
    fn id(&self) -> &str;

    /// Returns a copy of the container's current runtime spec.
    async fn spec(&self) -> Result<RuntimeSpec>;

    /// Creates the container's task (its primary OS process) over `rootfs`.
    async fn new_task(&self, rootfs: &[Mount], io: ProcessIo) -> Result<Arc<dyn Task>>;

    /// Loads the container's existing task.
    async fn task(&self) -> Result<Arc<dyn Task>>;

    /// Deletes the container object.
    async fn delete(&self) -> Result<()>;
}

/// The runtime's handle to a container's primary process.
#[async_trait]
pub trait Task: Send + Sync {
    /// Returns the task identity (same as its container).
    fn id(&self) -> &str;

    /// Starts the task's process.
    async fn start(&self) -> Result<()>;

    /// Returns a receiver that resolves once the process exits.
    async fn wait(&self) -> Result<ExitReceiver>;

    /// Sends a signal to the task's process.
    async fn kill(&self, signal: Signal) -> Result<()>;

    /// Queries the live status of the task.
    async fn status(&self) -> Result<TaskStatus>;

    /// Creates an additional process inside the running task.
    async fn exec(
        &self,
        exec_id: &str,
        process: &ProcessSpec,
        io: ProcessIo,
    ) -> Result<Box<dyn Process>>;

    /// Deletes the task, reaping its process.
    async fn delete(&self) -> Result<()>;
}

/// A process exec'd into a running task.
#[async_trait]
pub trait Process: Send + Sync {
    /// Returns the exec identity.
    fn id(&self) -> &str;

    /// Starts the process.
    async fn start(&self) -> Result<()>;
}
