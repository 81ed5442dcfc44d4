//! OCI runtime spec types and generation.
//!
//! [`SpecGenerator`] turns a step's [`ProcessMeta`] plus the resources a run
//! has acquired into the [`RuntimeSpec`] the container is created from.
//! [`OciSpecGenerator`] is the bundled implementation.

use crate::constants::{DEFAULT_HOSTNAME, DEFAULT_PATH_ENV, OCI_RUNTIME_SPEC_VERSION};
use crate::error::{Error, Result};
use crate::identity::ResolvedUser;
use crate::mount::{ExtraMount, ReleaseFn};
use crate::network::{Namespace, NetMode};
use crate::process::ProcessMeta;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI Runtime Spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: Root,
    pub process: ProcessSpec,
    pub hostname: String,
    pub mounts: Vec<SpecMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// OCI root filesystem config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

/// OCI process config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// OCI user config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

/// OCI mount config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    pub options: Vec<String>,
}

/// OCI Linux-specific config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<LinuxNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
}

/// OCI namespace config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RuntimeSpec {
    /// Returns the network namespace entry, if the spec isolates networking.
    pub fn network_namespace(&self) -> Option<&LinuxNamespace> {
        self.linux
            .as_ref()
            .and_then(|l| l.namespaces.iter().find(|ns| ns.ns_type == "network"))
    }
}

// =============================================================================
// Generation
// =============================================================================

/// How the process tree of a step is sandboxed.
///
/// Only full sandboxing (a private PID namespace) is supported today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMode {
    #[default]
    Sandbox,
}

/// Per-run options computed by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecOpts {
    pub user: ResolvedUser,
    pub readonly_rootfs: bool,
    pub cgroups_path: Option<String>,
}

/// Inputs of spec generation.
pub struct SpecRequest<'a> {
    pub id: &'a str,
    pub meta: &'a ProcessMeta,
    pub mounts: &'a [ExtraMount],
    pub resolv_conf: &'a Path,
    pub hosts_file: &'a Path,
    pub namespace: &'a dyn Namespace,
    pub process_mode: ProcessMode,
    pub opts: SpecOpts,
}

/// Produces the runtime spec for a run.
#[async_trait]
pub trait SpecGenerator: Send + Sync {
    /// Generates the spec. The returned action releases whatever the
    /// generator acquired (extra mounts).
    async fn generate(&self, req: SpecRequest<'_>) -> Result<(RuntimeSpec, ReleaseFn)>;
}

/// Default OCI spec generator.
#[derive(Debug, Clone, Default)]
pub struct OciSpecGenerator {
    _private: (),
}

impl OciSpecGenerator {
    /// Creates the generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts one extra mount and converts it into spec mounts.
    async fn mount_extra(&self, extra: &ExtraMount) -> Result<(Vec<SpecMount>, Option<ReleaseFn>)> {
        let lease = extra.src.mount(extra.readonly).await?;
        let (mounts, release) = lease.mount()?;
        let selector = extra.selector.trim_start_matches('/');

        if let Some(m) = mounts.iter().find(|m| !selector.is_empty() && !m.is_bind()) {
            let err = Error::SpecGenerationFailed(format!(
                "selector {} is only supported on bind mounts (got {})",
                extra.selector, m.mount_type
            ));
            if let Some(release) = release {
                let _ = release();
            }
            return Err(err);
        }

        let mut converted = Vec::with_capacity(mounts.len());
        for m in mounts {
            let mut source = m.source.clone();
            if !selector.is_empty() {
                source = Path::new(&source).join(selector).to_string_lossy().to_string();
            }
            let mut options = m.options.clone();
            if extra.readonly && !m.is_readonly() {
                options.push("ro".to_string());
            }
            converted.push(SpecMount {
                destination: extra.dest.clone(),
                mount_type: m.mount_type,
                source,
                options,
            });
        }
        Ok((converted, release))
    }
}

fn bind_ro(source: &Path, destination: &str) -> SpecMount {
    SpecMount {
        destination: destination.to_string(),
        mount_type: "bind".to_string(),
        source: source.to_string_lossy().to_string(),
        options: vec!["rbind".to_string(), "ro".to_string()],
    }
}

fn default_mounts() -> Vec<SpecMount> {
    let mount = |destination: &str, mount_type: &str, options: &[&str]| SpecMount {
        destination: destination.to_string(),
        mount_type: mount_type.to_string(),
        source: mount_type.to_string(),
        options: options.iter().map(|o| o.to_string()).collect(),
    };
    vec![
        mount("/proc", "proc", &["nosuid", "noexec", "nodev"]),
        mount("/dev", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"]),
        mount(
            "/dev/pts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        ),
        mount("/dev/shm", "tmpfs", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        mount("/dev/mqueue", "mqueue", &["nosuid", "noexec", "nodev"]),
        mount("/sys", "sysfs", &["nosuid", "noexec", "nodev", "ro"]),
    ]
}

fn release_all(releases: Vec<ReleaseFn>) -> Result<()> {
    let mut first = None;
    for release in releases.into_iter().rev() {
        if let Err(e) = release() {
            warn!(error = %e, "Failed to release extra mount");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[async_trait]
impl SpecGenerator for OciSpecGenerator {
    async fn generate(&self, req: SpecRequest<'_>) -> Result<(RuntimeSpec, ReleaseFn)> {
        let meta = req.meta;

        let mut env = meta.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(DEFAULT_PATH_ENV.to_string());
        }

        let mut mounts = default_mounts();
        mounts.push(bind_ro(req.resolv_conf, "/etc/resolv.conf"));
        mounts.push(bind_ro(req.hosts_file, "/etc/hosts"));

        let mut releases: Vec<ReleaseFn> = Vec::new();
        for extra in req.mounts {
            match self.mount_extra(extra).await {
                Ok((converted, release)) => {
                    mounts.extend(converted);
                    releases.extend(release);
                }
                Err(e) => {
                    let _ = release_all(releases);
                    return Err(Error::SpecGenerationFailed(format!(
                        "mounting {}: {}",
                        extra.dest, e
                    )));
                }
            }
        }

        let mut namespaces: Vec<LinuxNamespace> = ["ipc", "uts", "mount"]
            .iter()
            .map(|ns| LinuxNamespace {
                ns_type: ns.to_string(),
                path: None,
            })
            .collect();
        match req.process_mode {
            ProcessMode::Sandbox => namespaces.push(LinuxNamespace {
                ns_type: "pid".to_string(),
                path: None,
            }),
        }
        if meta.net_mode != NetMode::Host {
            namespaces.push(LinuxNamespace {
                ns_type: "network".to_string(),
                path: req
                    .namespace
                    .path()
                    .map(|p| p.to_string_lossy().to_string()),
            });
        }

        let user = req.opts.user;
        let spec = RuntimeSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root {
                path: "rootfs".to_string(),
                readonly: req.opts.readonly_rootfs,
            },
            process: ProcessSpec {
                terminal: meta.tty,
                user: User {
                    uid: user.uid,
                    gid: user.gid,
                    additional_gids: user.additional_gids,
                },
                args: meta.args.clone(),
                env,
                cwd: if meta.cwd.is_empty() {
                    "/".to_string()
                } else {
                    meta.cwd.clone()
                },
            },
            hostname: DEFAULT_HOSTNAME.to_string(),
            mounts,
            linux: Some(Linux {
                namespaces,
                cgroups_path: req.opts.cgroups_path,
            }),
        };

        debug!(id = %req.id, mounts = spec.mounts.len(), "Generated runtime spec");
        Ok((spec, Box::new(move || release_all(releases))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{HostNetwork, NetworkProvider};

    #[test]
    fn test_spec_serializes_oci_field_names() {
        let spec = RuntimeSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root {
                path: "rootfs".to_string(),
                readonly: true,
            },
            process: ProcessSpec::default(),
            hostname: DEFAULT_HOSTNAME.to_string(),
            mounts: Vec::new(),
            linux: Some(Linux {
                namespaces: Vec::new(),
                cgroups_path: Some("/a/buildkit/b".to_string()),
            }),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["ociVersion"], "1.0.2");
        assert_eq!(json["linux"]["cgroupsPath"], "/a/buildkit/b");
        assert_eq!(json["root"]["readonly"], true);
    }

    #[tokio::test]
    async fn test_host_mode_has_no_network_namespace() {
        let ns = HostNetwork.new_namespace().await.unwrap();
        let meta = ProcessMeta {
            args: vec!["true".to_string()],
            net_mode: NetMode::Host,
            ..Default::default()
        };
        let (spec, cleanup) = OciSpecGenerator::new()
            .generate(SpecRequest {
                id: "abc",
                meta: &meta,
                mounts: &[],
                resolv_conf: Path::new("/state/resolv.conf"),
                hosts_file: Path::new("/state/hosts"),
                namespace: ns.as_ref(),
                process_mode: ProcessMode::Sandbox,
                opts: SpecOpts::default(),
            })
            .await
            .unwrap();
        assert!(spec.network_namespace().is_none());
        assert_eq!(spec.process.cwd, "/");
        assert!(spec.process.env.iter().any(|e| e.starts_with("PATH=")));
        assert!(spec
            .mounts
            .iter()
            .any(|m| m.destination == "/etc/hosts" && m.source == "/state/hosts"));
        cleanup().unwrap();
    }
}
