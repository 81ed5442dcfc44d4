//! Network modes and namespace providers.
//!
//! Each run acquires exactly one [`Namespace`] from the [`NetworkProvider`]
//! registered for its [`NetMode`] and closes it during teardown.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Network policy of a build step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetMode {
    /// Executor default (an isolated namespace).
    #[default]
    Unset,
    /// Share the host network stack.
    Host,
    /// No network access beyond loopback.
    None,
}

impl fmt::Display for NetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Host => write!(f, "host"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Produces network namespaces for one network mode.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    /// Acquires a namespace owned by a single run.
    async fn new_namespace(&self) -> Result<Arc<dyn Namespace>>;
}

/// An acquired network namespace.
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Path of the namespace to join, if it is a pre-created one.
    ///
    /// `None` asks the spec generator for a fresh namespace (or for none at
    /// all in host mode).
    fn path(&self) -> Option<&Path>;

    /// Releases the namespace.
    async fn close(&self) -> Result<()>;
}

/// Placeholder namespace that owns nothing.
#[derive(Debug, Default)]
struct EmptyNamespace;

#[async_trait]
impl Namespace for EmptyNamespace {
    fn path(&self) -> Option<&Path> {
        None
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Provider for [`NetMode::Host`]: the process shares the host network.
#[derive(Debug, Clone, Default)]
pub struct HostNetwork;

#[async_trait]
impl NetworkProvider for HostNetwork {
    async fn new_namespace(&self) -> Result<Arc<dyn Namespace>> {
        Ok(Arc::new(EmptyNamespace))
    }
}

/// Provider for [`NetMode::None`]: a fresh namespace with only loopback,
/// created by the runtime from the spec.
#[derive(Debug, Clone, Default)]
pub struct IsolatedNetwork;

#[async_trait]
impl NetworkProvider for IsolatedNetwork {
    async fn new_namespace(&self) -> Result<Arc<dyn Namespace>> {
        debug!("Requesting fresh network namespace");
        Ok(Arc::new(EmptyNamespace))
    }
}

/// Returns the bundled providers: host networking for [`NetMode::Host`] and
/// a fresh isolated namespace for [`NetMode::None`] and [`NetMode::Unset`].
pub fn default_network_providers() -> HashMap<NetMode, Arc<dyn NetworkProvider>> {
    let isolated: Arc<dyn NetworkProvider> = Arc::new(IsolatedNetwork);
    HashMap::from([
        (NetMode::Unset, isolated.clone()),
        (NetMode::None, isolated),
        (NetMode::Host, Arc::new(HostNetwork) as Arc<dyn NetworkProvider>),
    ])
}
