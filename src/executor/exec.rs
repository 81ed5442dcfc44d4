//! Exec: attach an extra process to a live execution.

use super::Executor;
use crate::constants::EXEC_POLL_INTERVAL;
use crate::error::{Error, Result};
use crate::identity::{new_id, UserSpec};
use crate::process::{ProcessInfo, ProcessMeta};
use crate::registry::{ExecutionHandle, Termination};
use crate::runtime::{Container, Task, TaskStatus};
use crate::spec::{ProcessSpec, User};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl Executor {
    /// Starts `process` inside the running execution `id`.
    ///
    /// Waits, polling every [`EXEC_POLL_INTERVAL`], until the execution's
    /// task reports `running`. Returns once the new process has started; it
    /// does not wait for that process to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerNotFound`] if `id` is not a live execution
    /// - [`Error::Cancelled`] if `cancel` fires while waiting
    /// - [`Error::ContainerStopped`] / [`Error::ContainerExited`] if the
    ///   execution ends while waiting
    /// - [`Error::InvalidUser`] if a user override is not numeric `uid:gid`
    pub async fn exec(
        &self,
        cancel: &CancellationToken,
        id: &str,
        process: ProcessInfo,
    ) -> Result<()> {
        let mut handle = self
            .running
            .lookup(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let (container, task) = self.wait_running(cancel, &mut handle).await?;

        let spec = container.spec().await.map_err(|e| Error::ExecFailed {
            container: id.to_string(),
            reason: format!("reading spec: {e}"),
        })?;
        let (meta, io) = process.into_parts();
        let process_spec = overlay_process(&spec.process, &meta)?;

        let exec_id = new_id();
        let exec_failed = |e: Error| Error::ExecFailed {
            container: id.to_string(),
            reason: e.to_string(),
        };
        let exec_process = task
            .exec(&exec_id, &process_spec, io)
            .await
            .map_err(exec_failed)?;
        exec_process.start().await.map_err(exec_failed)?;

        info!(id = %id, exec_id = %exec_id, args = ?process_spec.args, "Exec started");
        Ok(())
    }

    async fn wait_running(
        &self,
        cancel: &CancellationToken,
        handle: &mut ExecutionHandle,
    ) -> Result<(Arc<dyn Container>, Arc<dyn Task>)> {
        let id = handle.id().to_string();
        let mut container: Option<Arc<dyn Container>> = None;
        let mut task: Option<Arc<dyn Task>> = None;

        loop {
            if container.is_none() {
                container = self.runtime.load_container(&id).await.ok();
            }
            if task.is_none() {
                if let Some(c) = &container {
                    task = c.task().await.ok();
                }
            }
            if let (Some(c), Some(t)) = (&container, &task) {
                if let Ok(TaskStatus::Running) = t.status().await {
                    return Ok((c.clone(), t.clone()));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                ended = handle.terminated() => {
                    return Err(match ended {
                        Termination::Stopped => Error::ContainerStopped(id),
                        Termination::Failed(reason) => Error::ContainerExited { id, reason },
                    });
                }
                _ = tokio::time::sleep(EXEC_POLL_INTERVAL) => {
                    debug!(id = %id, "Waiting for task to be running");
                }
            }
        }
    }
}

/// Returns a copy of `base` with the caller's overrides applied.
///
/// Args and terminal always come from `meta`; cwd and env only when set.
/// A user override must be numeric and drops supplementary groups.
pub(crate) fn overlay_process(base: &ProcessSpec, meta: &ProcessMeta) -> Result<ProcessSpec> {
    let mut process = base.clone();

    if !meta.user.is_empty() {
        match UserSpec::parse(&meta.user) {
            UserSpec::Numeric { uid, gid } => {
                process.user = User {
                    uid,
                    gid,
                    additional_gids: Vec::new(),
                };
            }
            UserSpec::Symbolic(user) => {
                return Err(Error::InvalidUser {
                    user,
                    reason: "exec requires a numeric uid:gid".to_string(),
                });
            }
        }
    }

    process.terminal = meta.tty;
    process.args = meta.args.clone();
    if !meta.cwd.is_empty() {
        process.cwd = meta.cwd.clone();
    }
    if !meta.env.is_empty() {
        process.env = meta.env.clone();
    }
    Ok(process)
}
