//! Reverse-order release of a run's resources.

use crate::error::Error;
use crate::mount::ReleaseFn;
use crate::network::Namespace;
use crate::runtime::{Container, Task};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A resource a run acquired, paired with how to release it.
pub(crate) enum Release {
    HostsFile(ReleaseFn),
    RootMount(ReleaseFn),
    Namespace(Arc<dyn Namespace>),
    Spec(ReleaseFn),
    Container(Arc<dyn Container>),
    Task(Arc<dyn Task>),
}

impl Release {
    pub(crate) fn step(&self) -> &'static str {
        match self {
            Self::HostsFile(_) => "hosts file",
            Self::RootMount(_) => "root mount",
            Self::Namespace(_) => "network namespace",
            Self::Spec(_) => "runtime spec",
            Self::Container(_) => "container",
            Self::Task(_) => "task",
        }
    }

    async fn release(self, id: &str) -> Result<(), Error> {
        let step = self.step();
        let failed = |reason: String| Error::ReleaseFailed {
            id: id.to_string(),
            step,
            reason,
        };
        match self {
            Self::HostsFile(f) | Self::RootMount(f) | Self::Spec(f) => {
                f().map_err(|e| failed(e.to_string()))
            }
            Self::Namespace(ns) => ns.close().await.map_err(|e| failed(e.to_string())),
            Self::Task(task) => task.delete().await.map_err(|e| Error::TaskDeleteFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
            Self::Container(container) => {
                container.delete().await.map_err(|e| Error::DeleteFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Release({})", self.step())
    }
}

/// Release actions recorded in acquisition order.
#[derive(Debug)]
pub(crate) struct UnwindStack {
    id: String,
    actions: Vec<Release>,
}

impl UnwindStack {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, release: Release) {
        self.actions.push(release);
    }

    #[cfg(test)]
    pub(crate) fn steps(&self) -> Vec<&'static str> {
        self.actions.iter().map(Release::step).collect()
    }

    /// Releases everything, last acquired first. Every action is attempted
    /// even when an earlier one fails; failures are returned in release
    /// order.
    pub(crate) async fn unwind(self) -> Vec<Error> {
        let UnwindStack { id, actions } = self;
        let mut errors = Vec::new();
        for action in actions.into_iter().rev() {
            let step = action.step();
            match action.release(&id).await {
                Ok(()) => debug!(id = %id, step, "Released"),
                Err(e) => {
                    warn!(id = %id, step, error = %e, "Release failed");
                    errors.push(e);
                }
            }
        }
        errors
    }
}
