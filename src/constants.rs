//! # Executor Constants
//!
//! Defines the timeouts, well-known paths, and identity rules used by the
//! executor. These constants are the **single source of truth** for the
//! lifecycle bounds applied to every run and attach.
//!
//! ## Cross-References
//!
//! - [`crate::executor`]: Uses the kill grace period and exec poll interval
//! - [`crate::cgroup`]: Uses the cgroupfs namespace segment
//! - [`crate::netfiles`]: Uses the resolv.conf/hosts file names and defaults
//! - [`crate::spec`]: Uses the OCI spec version and default environment

use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================
//
// The run path never gives up on waiting for a process by itself; it only
// bounds the kill request issued after cancellation. The attach path polls
// at a fixed interval until the caller cancels.
// =============================================================================

/// Upper bound on the SIGKILL request issued after a run is cancelled.
///
/// The kill is issued under its own timeout, independent of the (already
/// cancelled) caller token, so the request itself is not aborted.
///
/// **Rationale**: 10s is generous for a runtime to deliver a signal while
/// still bounding a wedged runtime shim.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Interval between liveness probes while an exec waits for its target
/// process to reach the running state.
pub const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Exit Status
// =============================================================================

/// Exit code a runtime reports when the real status could not be collected.
///
/// Only treated as a distinct failure when accompanied by a status error;
/// otherwise it is reported like any other non-zero exit.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

// =============================================================================
// Cgroups
// =============================================================================

/// Segment inserted between the cgroup parent and the execution identity
/// when the cgroupfs driver convention is used.
///
/// Structure: `/<parent>/buildkit/<id>`
pub const CGROUP_NAMESPACE: &str = "buildkit";

/// Marker identifying a systemd slice in a cgroup parent.
pub const SYSTEMD_SLICE_MARKER: &str = ".slice";

/// Separator terminating a systemd-style cgroup parent (`slice:prefix:`).
pub const SYSTEMD_PARENT_SEPARATOR: char = ':';

// =============================================================================
// State Paths
// =============================================================================
//
// Files generated under the executor root. Stale copies are removed when an
// executor is constructed.
// =============================================================================

/// Name of the generated resolver configuration under the executor root.
pub const RESOLV_CONF_FILE: &str = "resolv.conf";

/// Name of the shared hosts file under the executor root.
pub const HOSTS_FILE: &str = "hosts";

/// Host resolver configuration used as the template for `resolv.conf`.
pub const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Nameservers used when the host only lists loopback resolvers.
pub const DEFAULT_NAMESERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];

// =============================================================================
// Runtime Spec Defaults
// =============================================================================

/// OCI Runtime Spec version for generated specs.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// `PATH` injected when the step environment does not set one.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Hostname of every isolated execution.
pub const DEFAULT_HOSTNAME: &str = "sandbox";

/// Mode of working directories created inside the root filesystem.
pub const WORKDIR_MODE: u32 = 0o755;

/// Maximum symlinks followed when resolving a path inside a root filesystem.
pub const MAX_SYMLINK_DEPTH: usize = 255;

// =============================================================================
// Identity Validation
// =============================================================================

/// Valid characters for execution identities.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.` (containerd's identifier set)
///
/// **Security**: Identities become container names and cgroup path
/// components, so separators are rejected and so are the `.`/`..` names.
pub const IDENTITY_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum execution identity length.
pub const MAX_IDENTITY_LEN: usize = 128;

/// Validates a caller-supplied execution identity.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[inline]
#[must_use = "validation result must be checked before the identity is used"]
pub fn validate_identity(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("identity cannot be empty");
    }
    if id.len() > MAX_IDENTITY_LEN {
        return Err("identity exceeds maximum length");
    }
    if !id.chars().all(|c| IDENTITY_VALID_CHARS.contains(c)) {
        return Err("identity contains invalid characters");
    }
    if id == "." || id == ".." {
        return Err("identity cannot be a relative path component");
    }
    Ok(())
}
