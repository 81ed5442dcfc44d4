//! Run: one build step from registration to teardown.

use super::unwind::{Release, UnwindStack};
use super::{Executor, StartedSignal};
use crate::cgroup::cgroups_path;
use crate::constants::{validate_identity, KILL_GRACE_PERIOD, UNKNOWN_EXIT_STATUS};
use crate::error::{Error, Result, RunError};
use crate::identity::{ensure_working_dir, lookup_user, new_id, ResolvedUser, UserSpec};
use crate::mount::{ExtraMount, Mount, Mountable};
use crate::netfiles;
use crate::network::NetMode;
use crate::process::{ProcessInfo, ProcessMeta};
use crate::runtime::{ExitReceiver, ExitStatus, Signal, Task};
use crate::spec::{SpecOpts, SpecRequest};
use std::path::Path;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl Executor {
    /// Runs `process` in a fresh container over `root` and waits for it to
    /// exit.
    ///
    /// A missing or empty `id` is replaced by a generated identity. `started`
    /// fires once the process is running, or when the run gives up before
    /// that, so callers waiting on it are never left hanging.
    ///
    /// Cancelling `cancel` kills the process (bounded by
    /// [`KILL_GRACE_PERIOD`]) and still waits for its real exit status. All
    /// acquired resources are released in reverse order on every path, and
    /// the identity is unregistered before this returns.
    ///
    /// # Errors
    ///
    /// The first failure is the [`RunError`]'s primary error; teardown
    /// failures observed while handling it are attached as suppressed.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        id: Option<String>,
        root: &dyn Mountable,
        mounts: &[ExtraMount],
        process: ProcessInfo,
        started: Option<oneshot::Sender<()>>,
    ) -> std::result::Result<(), RunError> {
        let mut started = StartedSignal::new(started);

        let id = match id.filter(|id| !id.is_empty()) {
            Some(id) => {
                if let Err(reason) = validate_identity(&id) {
                    started.notify();
                    return Err(Error::InvalidIdentity {
                        id,
                        reason: reason.to_string(),
                    }
                    .into());
                }
                id
            }
            None => new_id(),
        };

        // A duplicate belongs to another live run; leave its entry alone.
        let _handle = match self.running.register(&id) {
            Ok(handle) => handle,
            Err(e) => {
                started.notify();
                return Err(e.into());
            }
        };
        info!(id = %id, args = ?process.meta.args, "Starting run");

        let mut stack = UnwindStack::new(&id);
        let outcome = self
            .run_registered(cancel, &id, root, mounts, process, &mut started, &mut stack)
            .await;

        let teardown = stack.unwind().await;
        let result = settle(outcome, teardown);

        match &result {
            Ok(()) => info!(id = %id, "Run completed"),
            Err(e) => {
                warn!(id = %id, error = %e, "Run failed");
                self.running.report_failure(&id, e.primary().to_string());
            }
        }
        self.running.unregister(&id);
        started.notify();
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_registered(
        &self,
        cancel: &CancellationToken,
        id: &str,
        root: &dyn Mountable,
        mounts: &[ExtraMount],
        process: ProcessInfo,
        started: &mut StartedSignal,
        stack: &mut UnwindStack,
    ) -> Result<()> {
        ensure_live(cancel, id, "preparing network files")?;
        let (meta, io) = process.into_parts();

        let resolv_conf = netfiles::resolv_conf(&self.config.root, self.config.dns.as_ref())
            .map_err(|e| Error::NetworkFiles {
                id: id.to_string(),
                file: "resolv.conf",
                reason: e.to_string(),
            })?;
        let (hosts_file, remove_hosts) =
            netfiles::hosts_file(&self.config.root, &meta.extra_hosts).map_err(|e| {
                Error::NetworkFiles {
                    id: id.to_string(),
                    file: "hosts",
                    reason: e.to_string(),
                }
            })?;
        if let Some(remove) = remove_hosts {
            stack.push(Release::HostsFile(remove));
        }

        let root_mounts = mount_root(id, root, meta.readonly_rootfs, stack).await?;

        let user = self.resolve_user(id, &meta, &root_mounts).await?;
        debug!(id = %id, uid = user.uid, gid = user.gid, "Resolved user");

        if meta.net_mode == NetMode::Host {
            info!(id = %id, "Enabling host networking");
        }
        let provider = self
            .network_providers
            .get(&meta.net_mode)
            .ok_or(Error::UnknownNetworkMode(meta.net_mode))?;
        let namespace = provider
            .new_namespace()
            .await
            .map_err(|e| Error::NamespaceFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        stack.push(Release::Namespace(namespace.clone()));

        let cgroups_path = self
            .config
            .cgroup_parent
            .as_deref()
            .and_then(|parent| cgroups_path(parent, id));
        let (spec, cleanup) = self
            .spec_generator
            .generate(SpecRequest {
                id,
                meta: &meta,
                mounts,
                resolv_conf: &resolv_conf,
                hosts_file: &hosts_file,
                namespace: namespace.as_ref(),
                process_mode: self.config.process_mode,
                opts: SpecOpts {
                    user,
                    readonly_rootfs: meta.readonly_rootfs,
                    cgroups_path,
                },
            })
            .await?;
        stack.push(Release::Spec(cleanup));

        ensure_live(cancel, id, "creating container")?;
        let container = self
            .runtime
            .new_container(id, &spec)
            .await
            .map_err(|e| Error::CreateFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        stack.push(Release::Container(container.clone()));

        let task = container
            .new_task(&root_mounts, io)
            .await
            .map_err(|e| Error::TaskCreateFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        stack.push(Release::Task(task.clone()));

        ensure_live(cancel, id, "starting task")?;
        task.start().await.map_err(|e| Error::StartFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        started.notify();
        debug!(id = %id, task = task.id(), "Task started");

        let exit = task.wait().await.map_err(|e| Error::WaitFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        wait_for_exit(cancel, id, task.as_ref(), exit).await
    }

    /// Resolves the numeric identity of the step's user.
    ///
    /// Symbolic users are looked up in the root filesystem through a
    /// temporary local mount that is detached before returning, on success
    /// and on failure alike.
    async fn resolve_user(
        &self,
        id: &str,
        meta: &ProcessMeta,
        root_mounts: &[Mount],
    ) -> Result<ResolvedUser> {
        let user = match UserSpec::parse(&meta.user) {
            UserSpec::Numeric { uid, gid } => {
                return Ok(ResolvedUser {
                    uid,
                    gid,
                    additional_gids: Vec::new(),
                })
            }
            UserSpec::Symbolic(user) => user,
        };

        let local = self
            .local_mounter
            .mount(root_mounts)
            .await
            .map_err(|e| Error::MountFailed {
                id: id.to_string(),
                what: "rootfs for user lookup",
                reason: e.to_string(),
            })?;
        let resolved = resolve_in_rootfs(id, local.path(), &user, meta);
        let unmounted = local.unmount().await;

        let resolved = resolved?;
        unmounted.map_err(|e| Error::MountFailed {
            id: id.to_string(),
            what: "rootfs for user lookup",
            reason: format!("unmount: {e}"),
        })?;
        Ok(resolved)
    }
}

async fn mount_root(
    id: &str,
    root: &dyn Mountable,
    readonly: bool,
    stack: &mut UnwindStack,
) -> Result<Vec<Mount>> {
    let failed = |e: Error| Error::MountFailed {
        id: id.to_string(),
        what: "rootfs",
        reason: e.to_string(),
    };
    let lease = root.mount(readonly).await.map_err(failed)?;
    let (mounts, release) = lease.mount().map_err(failed)?;
    if let Some(release) = release {
        stack.push(Release::RootMount(release));
    }
    debug!(id = %id, mounts = mounts.len(), readonly, "Mounted rootfs");
    Ok(mounts)
}

fn resolve_in_rootfs(id: &str, rootfs: &Path, user: &str, meta: &ProcessMeta) -> Result<ResolvedUser> {
    let resolved = lookup_user(rootfs, user)?;
    if !meta.readonly_rootfs && !meta.cwd.is_empty() {
        ensure_working_dir(rootfs, &meta.cwd, resolved.uid, resolved.gid).map_err(|e| {
            Error::WorkingDir {
                id: id.to_string(),
                path: meta.cwd.clone().into(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(resolved)
}

/// Stops setup once the caller has cancelled; nothing past this point runs.
fn ensure_live(cancel: &CancellationToken, id: &str, step: &str) -> Result<()> {
    if cancel.is_cancelled() {
        info!(id = %id, step, "Run cancelled during setup");
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Waits for the task to exit, killing it once if `cancel` fires first.
async fn wait_for_exit(
    cancel: &CancellationToken,
    id: &str,
    task: &dyn Task,
    mut exit: ExitReceiver,
) -> Result<()> {
    let mut killed = false;
    let status = loop {
        tokio::select! {
            _ = cancel.cancelled(), if !killed => {
                killed = true;
                info!(id = %id, "Run cancelled, killing task");
                match tokio::time::timeout(KILL_GRACE_PERIOD, task.kill(Signal::Kill)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        let err = Error::SignalFailed {
                            id: id.to_string(),
                            reason: e.to_string(),
                        };
                        warn!(error = %err, "Failed to kill task");
                    }
                    Err(_) => warn!(id = %id, "Timed out killing task"),
                }
            }
            status = &mut exit => {
                break status.unwrap_or_else(|_| ExitStatus::unknown("exit status channel closed"));
            }
        }
    };
    debug!(id = %id, code = status.code, "Task exited");

    match exit_result(status) {
        Err(e) if cancel.is_cancelled() => Err(Error::CancelledDuring(Box::new(e))),
        other => other,
    }
}

fn exit_result(status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    match status.error {
        Some(reason) if status.code == UNKNOWN_EXIT_STATUS => Err(Error::ProcessFailed(reason)),
        _ => Err(Error::NonZeroExit(status.code)),
    }
}

/// Combines the run outcome with the errors collected during teardown.
///
/// Container and task deletion failures fail an otherwise successful run;
/// other release failures only ever ride along as suppressed errors.
fn settle(outcome: Result<()>, teardown: Vec<Error>) -> std::result::Result<(), RunError> {
    match outcome {
        Err(primary) => Err(RunError::new(primary, teardown)),
        Ok(()) => {
            let mut teardown = teardown;
            match teardown.iter().position(Error::is_runtime_teardown) {
                Some(pos) => {
                    let primary = teardown.remove(pos);
                    Err(RunError::new(primary, teardown))
                }
                None => Ok(()),
            }
        }
    }
}
