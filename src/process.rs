//! Build step process description.

use crate::netfiles::HostIp;
use crate::network::NetMode;
use crate::runtime::ProcessIo;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// What to run for a build step and how to isolate it.
///
/// Attach reuses the `user`, `args`, `cwd`, `env` and `tty` fields; the
/// rest only applies to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessMeta {
    /// Argument vector, program first.
    pub args: Vec<String>,
    /// Environment as `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory inside the root filesystem.
    pub cwd: String,
    /// User to run as: `uid:gid`, a name, or `name:group`.
    pub user: String,
    /// Allocate a terminal.
    pub tty: bool,
    /// Network policy.
    pub net_mode: NetMode,
    /// Mount the root filesystem read-only.
    #[serde(rename = "readonlyRootFS")]
    pub readonly_rootfs: bool,
    /// Additional `/etc/hosts` entries.
    pub extra_hosts: Vec<HostIp>,
}

/// A process description together with its standard streams.
#[derive(Default)]
pub struct ProcessInfo {
    pub meta: ProcessMeta,
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl ProcessInfo {
    /// Creates a process description without attached streams.
    pub fn new(meta: ProcessMeta) -> Self {
        Self {
            meta,
            ..Default::default()
        }
    }

    /// Attaches stdin.
    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    /// Attaches stdout.
    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    /// Attaches stderr.
    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// Splits into metadata and the runtime I/O handed to the task.
    pub fn into_parts(self) -> (ProcessMeta, ProcessIo) {
        let io = ProcessIo {
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            terminal: self.meta.tty,
        };
        (self.meta, io)
    }
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("meta", &self.meta)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}
