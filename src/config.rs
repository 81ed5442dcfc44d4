//! Executor configuration.

use crate::error::{Error, Result};
use crate::netfiles::DnsConfig;
use crate::spec::ProcessMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default state root for generated resolver and hosts files.
const DEFAULT_ROOT: &str = "/var/lib/stepexec";

/// Static configuration of an [`Executor`](crate::Executor).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Directory holding generated `resolv.conf` and hosts files.
    pub root: PathBuf,
    /// Cgroup parent for executions (systemd `slice:prefix:` or a cgroupfs
    /// path). Unset leaves cgroup placement to the runtime.
    pub cgroup_parent: Option<String>,
    /// DNS override applied on top of the host resolver configuration.
    pub dns: Option<DnsConfig>,
    /// Process sandboxing mode.
    pub process_mode: ProcessMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            cgroup_parent: None,
            dns: None,
            process_mode: ProcessMode::Sandbox,
        }
    }
}

impl ExecutorConfig {
    /// Creates a configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Loads a JSON configuration file and validates it.
    ///
    /// Fields missing from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the cgroup parent.
    pub fn with_cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.cgroup_parent = Some(parent.into());
        self
    }

    /// Sets the DNS override.
    pub fn with_dns(mut self, dns: DnsConfig) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Checks the configuration for inconsistencies.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "root '{}' must be an absolute path",
                self.root.display()
            )));
        }
        if let Some(parent) = &self.cgroup_parent {
            if parent.trim().is_empty() {
                return Err(Error::InvalidConfig(
                    "cgroup parent must not be blank".to_string(),
                ));
            }
        }
        if let Some(dns) = &self.dns {
            for ns in &dns.nameservers {
                if ns.parse::<std::net::IpAddr>().is_err() {
                    return Err(Error::InvalidConfig(format!(
                        "nameserver '{ns}' is not an IP address"
                    )));
                }
            }
        }
        Ok(())
    }
}
