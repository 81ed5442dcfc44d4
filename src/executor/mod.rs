//! The executor: runs build steps in containers and attaches to them.
//!
//! # Run lifecycle
//!
//! ```text
//!  register ─► resolv/hosts ─► mount root ─► resolve user ─► netns ─► spec
//!                                                                      │
//!  unregister ◄─ unwind (reverse) ◄─ wait/kill ◄─ start ◄─ task ◄─ container
//! ```
//!
//! Every acquired resource pushes its release onto an unwind stack that is
//! drained in reverse order on every exit path. See [`Executor::run`].
//!
//! # Attach
//!
//! [`Executor::exec`] waits for a registered execution to be running and
//! starts an extra process inside it.

mod exec;
mod run;
mod unwind;

use crate::config::ExecutorConfig;
use crate::error::Result;
use crate::mount::{LocalMounter, SystemLocalMounter};
use crate::netfiles;
use crate::network::{NetMode, NetworkProvider};
use crate::registry::ExecutionRegistry;
use crate::runtime::ContainerRuntime;
use crate::spec::{OciSpecGenerator, SpecGenerator};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

/// Container-backed executor for build steps.
///
/// ## Thread Safety
///
/// `Executor` is `Send + Sync`; share it behind an `Arc`. Runs for distinct
/// identities proceed in parallel and only meet at the execution registry.
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutorConfig,
    network_providers: HashMap<NetMode, Arc<dyn NetworkProvider>>,
    spec_generator: Arc<dyn SpecGenerator>,
    local_mounter: Arc<dyn LocalMounter>,
    running: ExecutionRegistry,
}

impl Executor {
    /// Creates an executor over `runtime`.
    ///
    /// Stale resolver and hosts files left under the configured root by a
    /// previous process are removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration does not validate.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ExecutorConfig,
        network_providers: HashMap<NetMode, Arc<dyn NetworkProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        netfiles::remove_stale(&config.root);
        info!(
            runtime = runtime.name(),
            root = %config.root.display(),
            "Executor ready"
        );
        Ok(Self {
            runtime,
            config,
            network_providers,
            spec_generator: Arc::new(OciSpecGenerator::new()),
            local_mounter: Arc::new(SystemLocalMounter::new()),
            running: ExecutionRegistry::new(),
        })
    }

    /// Replaces the runtime spec generator.
    pub fn with_spec_generator(mut self, generator: Arc<dyn SpecGenerator>) -> Self {
        self.spec_generator = generator;
        self
    }

    /// Replaces the mounter used to inspect root filesystems.
    pub fn with_local_mounter(mut self, mounter: Arc<dyn LocalMounter>) -> Self {
        self.local_mounter = mounter;
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Returns the registry of live executions.
    pub fn registry(&self) -> &ExecutionRegistry {
        &self.running
    }
}

/// One-shot "process started" notification for a run's caller.
///
/// Fires at most once; a run fires it when the task starts, or during
/// teardown if setup failed before that.
#[derive(Debug)]
pub(crate) struct StartedSignal(Option<oneshot::Sender<()>>);

impl StartedSignal {
    pub(crate) fn new(tx: Option<oneshot::Sender<()>>) -> Self {
        Self(tx)
    }

    pub(crate) fn notify(&mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}
