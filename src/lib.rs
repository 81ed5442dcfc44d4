//! # stepexec
//!
//! **Container-Backed Execution of Isolated Build Steps**
//!
//! This crate is the execution backend of a build engine. Given a build step
//! (a command, its root filesystem, extra mounts, environment and network
//! policy) it materializes an isolated process through a container runtime,
//! runs it to completion and reports the outcome. It can also attach an
//! additional process to a step that is already running.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Executor                                 │
//! │        run(cancel, id, root, mounts, process, started)              │
//! │        exec(cancel, id, process)                                    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐   │
//! │  │ExecutionRegistry │  │  User Resolution │  │   Cgroup Paths   │   │
//! │  │ id → completion  │  │ /etc/passwd,group│  │ systemd/cgroupfs │   │
//! │  └──────────────────┘  └──────────────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                     Resource Provider Traits                        │
//! │  Mountable │ LocalMounter │ NetworkProvider │ SpecGenerator │ netfiles│
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                     Container Runtime Traits                        │
//! │        ContainerRuntime → Container → Task → Process                │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The container runtime client is always supplied by the embedding
//! application. Small reference implementations of the other providers are
//! bundled: [`OciSpecGenerator`], [`HostNetwork`], [`IsolatedNetwork`],
//! [`BindMountable`] and [`SystemLocalMounter`].
//!
//! # Run Lifecycle
//!
//! ```text
//!   register ─► resolv.conf/hosts ─► mount root ─► resolve uid/gid
//!                                                        │
//!   ┌────────────────────────────────────────────────────┘
//!   ▼
//!   netns ─► runtime spec ─► container ─► task ─► start ─► wait ─┐
//!                                                  (started)     │
//!   unregister ◄─ unwind in reverse ◄──────── exit / cancel+kill ◄┘
//! ```
//!
//! Each resource is released exactly once, in reverse acquisition order, on
//! every exit path. Cancellation kills the task with a bounded grace period
//! and still waits for its real exit status.
//!
//! # Attach
//!
//! [`Executor::exec`] polls the registry and the runtime until the step's
//! task is running, then starts a new process in it with the step's runtime
//! spec patched by the caller's args, env, cwd, terminal flag and user.
//!
//! # Example
//!
//! ```rust,ignore
//! use stepexec::{default_network_providers, BindMountable, Executor, ExecutorConfig};
//! use stepexec::{ProcessInfo, ProcessMeta};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn build(runtime: std::sync::Arc<dyn stepexec::ContainerRuntime>) -> stepexec::Result<()> {
//!     let executor = Executor::new(
//!         runtime,
//!         ExecutorConfig::new("/var/lib/stepexec"),
//!         default_network_providers(),
//!     )?;
//!     let root = BindMountable::new("/var/lib/rootfs/alpine");
//!     let process = ProcessInfo::new(ProcessMeta {
//!         args: vec!["make".into(), "all".into()],
//!         ..Default::default()
//!     });
//!     executor
//!         .run(&CancellationToken::new(), None, &root, &[], process, None)
//!         .await
//!         .map_err(|e| e.into_primary())
//! }
//! ```

pub mod cgroup;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod identity;
pub mod mount;
pub mod netfiles;
pub mod network;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod spec;

// Re-exports
pub use cgroup::cgroups_path;
pub use config::ExecutorConfig;
pub use constants::*;
pub use error::{Error, Result, RunError};
pub use executor::Executor;
pub use identity::{ResolvedUser, UserSpec};
pub use mount::{
    BindMountable, ExtraMount, LocalMount, LocalMounter, Mount, MountRef, Mountable, ReleaseFn,
    SystemLocalMounter,
};
pub use netfiles::{DnsConfig, HostIp};
pub use network::{default_network_providers, HostNetwork, IsolatedNetwork, Namespace, NetMode, NetworkProvider};
pub use process::{ProcessInfo, ProcessMeta};
pub use registry::{ExecutionHandle, ExecutionRegistry, Termination};
pub use runtime::{
    Container, ContainerRuntime, ExitReceiver, ExitStatus, Process, ProcessIo, Signal, Task,
    TaskStatus,
};
pub use spec::{OciSpecGenerator, ProcessMode, RuntimeSpec, SpecGenerator, SpecOpts, SpecRequest};
