//! Mount sets and the providers that produce them.
//!
//! A run mounts its root through a [`Mountable`], which hands back a
//! [`MountRef`]; resolving the `MountRef` yields the concrete [`Mount`] list
//! plus the release action for the lease. The same mounts can be attached
//! at a temporary host path through a [`LocalMounter`] when the root
//! filesystem has to be inspected (user database lookups).

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Deferred release action for an acquired resource.
pub type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// A single filesystem mount, as understood by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type (`bind`, `overlay`, `tmpfs`, ...).
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Mount source.
    pub source: String,
    /// Mount options (`rbind`, `ro`, `lowerdir=...`).
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    /// Creates a read-write recursive bind mount of `source`.
    pub fn bind(source: impl Into<String>) -> Self {
        Self {
            mount_type: "bind".to_string(),
            source: source.into(),
            options: vec!["rbind".to_string()],
        }
    }

    /// Returns true for bind mounts (by type or option).
    pub fn is_bind(&self) -> bool {
        self.mount_type == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// Returns true if the mount is read-only.
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

// =============================================================================
// Mountable
// =============================================================================

/// A filesystem that can be mounted for the duration of a run.
#[async_trait]
pub trait Mountable: Send + Sync {
    /// Acquires a mount lease, read-only when `readonly` is set.
    async fn mount(&self, readonly: bool) -> Result<Box<dyn MountRef>>;
}

/// An acquired mount lease.
pub trait MountRef: Send {
    /// Returns the mounts and the action releasing the lease.
    fn mount(&self) -> Result<(Vec<Mount>, Option<ReleaseFn>)>;
}

/// Extra mount requested by a build step.
#[derive(Clone)]
pub struct ExtraMount {
    /// Filesystem to mount.
    pub src: Arc<dyn Mountable>,
    /// Subpath of the source to expose.
    pub selector: String,
    /// Destination inside the container.
    pub dest: String,
    /// Expose the mount read-only.
    pub readonly: bool,
}

impl fmt::Debug for ExtraMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraMount")
            .field("selector", &self.selector)
            .field("dest", &self.dest)
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

/// Mountable backed by an existing host directory.
#[derive(Debug, Clone)]
pub struct BindMountable {
    path: PathBuf,
}

impl BindMountable {
    /// Creates a mountable exposing `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Mountable for BindMountable {
    async fn mount(&self, readonly: bool) -> Result<Box<dyn MountRef>> {
        if !self.path.is_dir() {
            return Err(Error::MountFailed {
                id: self.path.display().to_string(),
                what: "bind source",
                reason: "not a directory".to_string(),
            });
        }
        let mut mount = Mount::bind(self.path.to_string_lossy());
        if readonly {
            mount.options.push("ro".to_string());
        }
        Ok(Box::new(StaticMountRef(vec![mount])))
    }
}

struct StaticMountRef(Vec<Mount>);

impl MountRef for StaticMountRef {
    fn mount(&self) -> Result<(Vec<Mount>, Option<ReleaseFn>)> {
        Ok((self.0.clone(), None))
    }
}

// =============================================================================
// Local Mounter
// =============================================================================

/// Attaches a mount set at a temporary host path.
#[async_trait]
pub trait LocalMounter: Send + Sync {
    /// Mounts `mounts` and returns the handle of the local mount.
    async fn mount(&self, mounts: &[Mount]) -> Result<Box<dyn LocalMount>>;
}

/// A mount set attached at a local path.
#[async_trait]
pub trait LocalMount: Send + Sync {
    /// Path where the root filesystem is visible.
    fn path(&self) -> &Path;

    /// Detaches the mount set.
    async fn unmount(self: Box<Self>) -> Result<()>;
}

/// [`LocalMounter`] backed by `mount(2)`.
///
/// A single bind mount is used in place without mounting anything, since its
/// source already is a host directory.
#[derive(Debug, Clone, Default)]
pub struct SystemLocalMounter {
    _private: (),
}

impl SystemLocalMounter {
    /// Creates a system mounter.
    pub fn new() -> Self {
        Self::default()
    }
}

struct InPlaceMount {
    path: PathBuf,
}

#[async_trait]
impl LocalMount for InPlaceMount {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn unmount(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LocalMounter for SystemLocalMounter {
    async fn mount(&self, mounts: &[Mount]) -> Result<Box<dyn LocalMount>> {
        if let [single] = mounts {
            if single.is_bind() {
                return Ok(Box::new(InPlaceMount {
                    path: PathBuf::from(&single.source),
                }));
            }
        }
        if mounts.is_empty() {
            return Err(Error::MountFailed {
                id: String::new(),
                what: "local root",
                reason: "no mounts given".to_string(),
            });
        }
        sys::mount_all(mounts.to_vec()).await
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{LocalMount, Mount};
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::ffi::CString;
    use std::path::{Path, PathBuf};
    use tracing::{debug, warn};

    /// Splits mount options into `MS_*` flags and filesystem data.
    pub(super) fn parse_options(options: &[String]) -> (libc::c_ulong, String) {
        let mut flags: libc::c_ulong = 0;
        let mut data = Vec::new();
        for opt in options {
            match opt.as_str() {
                "ro" => flags |= libc::MS_RDONLY,
                "rw" => flags &= !libc::MS_RDONLY,
                "bind" => flags |= libc::MS_BIND,
                "rbind" => flags |= libc::MS_BIND | libc::MS_REC,
                "nosuid" => flags |= libc::MS_NOSUID,
                "nodev" => flags |= libc::MS_NODEV,
                "noexec" => flags |= libc::MS_NOEXEC,
                "remount" => flags |= libc::MS_REMOUNT,
                other => data.push(other),
            }
        }
        (flags, data.join(","))
    }

    fn cstring(s: &str) -> Result<CString> {
        CString::new(s).map_err(|e| Error::Internal(format!("mount argument contains NUL: {e}")))
    }

    fn mount_one(target: &Path, m: &Mount) -> Result<()> {
        let (flags, data) = parse_options(&m.options);
        let source = cstring(&m.source)?;
        let target_c = cstring(&target.to_string_lossy())?;
        let fstype = cstring(&m.mount_type)?;
        let data = cstring(&data)?;
        // SAFETY: all pointers are valid NUL-terminated strings for the call.
        let rc = unsafe {
            libc::mount(
                source.as_ptr(),
                target_c.as_ptr(),
                fstype.as_ptr(),
                flags,
                data.as_ptr().cast(),
            )
        };
        if rc != 0 {
            return Err(Error::MountFailed {
                id: target.display().to_string(),
                what: "local root",
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        // Read-only bind mounts need a remount to take effect.
        if flags & libc::MS_BIND != 0 && flags & libc::MS_RDONLY != 0 {
            // SAFETY: as above; null source/fstype are allowed for remounts.
            let rc = unsafe {
                libc::mount(
                    std::ptr::null(),
                    target_c.as_ptr(),
                    std::ptr::null(),
                    flags | libc::MS_REMOUNT,
                    std::ptr::null(),
                )
            };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                let _ = unmount_path(target);
                return Err(Error::MountFailed {
                    id: target.display().to_string(),
                    what: "local root",
                    reason: format!("read-only remount: {err}"),
                });
            }
        }
        Ok(())
    }

    fn unmount_path(target: &Path) -> Result<()> {
        let target_c = cstring(&target.to_string_lossy())?;
        // SAFETY: target_c is a valid NUL-terminated path.
        let rc = unsafe { libc::umount2(target_c.as_ptr(), libc::MNT_DETACH) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) struct TempMount {
        path: PathBuf,
        layers: usize,
    }

    #[async_trait]
    impl LocalMount for TempMount {
        fn path(&self) -> &Path {
            &self.path
        }

        async fn unmount(self: Box<Self>) -> Result<()> {
            let TempMount { path, layers } = *self;
            tokio::task::spawn_blocking(move || {
                for _ in 0..layers {
                    unmount_path(&path)?;
                }
                std::fs::remove_dir(&path)?;
                debug!(path = %path.display(), "Removed temporary mount");
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("unmount task failed: {e}")))?
        }
    }

    pub(super) async fn mount_all(mounts: Vec<Mount>) -> Result<Box<dyn LocalMount>> {
        tokio::task::spawn_blocking(move || {
            let dir = tempfile::Builder::new()
                .prefix("stepexec-root-")
                .tempdir()?
                .keep();
            let mut layers = 0;
            for m in &mounts {
                if let Err(e) = mount_one(&dir, m) {
                    for _ in 0..layers {
                        if let Err(err) = unmount_path(&dir) {
                            warn!(path = %dir.display(), error = %err, "Failed to roll back mount");
                        }
                    }
                    let _ = std::fs::remove_dir(&dir);
                    return Err(e);
                }
                layers += 1;
            }
            debug!(path = %dir.display(), layers, "Mounted root at temporary path");
            Ok(Box::new(TempMount { path: dir, layers }) as Box<dyn LocalMount>)
        })
        .await
        .map_err(|e| Error::Internal(format!("mount task failed: {e}")))?
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::{LocalMount, Mount};
    use crate::error::{Error, Result};

    pub(super) async fn mount_all(_mounts: Vec<Mount>) -> Result<Box<dyn LocalMount>> {
        Err(Error::NotSupported(
            "mounting a root filesystem requires Linux".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_detection() {
        assert!(Mount::bind("/src").is_bind());
        let overlay = Mount {
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            options: vec!["lowerdir=/a".to_string()],
        };
        assert!(!overlay.is_bind());
        let mut ro = Mount::bind("/src");
        ro.options.push("ro".to_string());
        assert!(ro.is_readonly());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_options_splits_flags_and_data() {
        let (flags, data) = sys::parse_options(&[
            "rbind".to_string(),
            "ro".to_string(),
            "lowerdir=/l".to_string(),
            "upperdir=/u".to_string(),
        ]);
        assert_ne!(flags & libc::MS_BIND, 0);
        assert_ne!(flags & libc::MS_REC, 0);
        assert_ne!(flags & libc::MS_RDONLY, 0);
        assert_eq!(data, "lowerdir=/l,upperdir=/u");
    }

    #[tokio::test]
    async fn test_single_bind_mount_is_used_in_place() {
        let mounter = SystemLocalMounter::new();
        let local = mounter.mount(&[Mount::bind("/some/root")]).await.unwrap();
        assert_eq!(local.path(), Path::new("/some/root"));
        local.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_mountable_rejects_missing_dir() {
        let m = BindMountable::new("/definitely/not/here");
        assert!(m.mount(false).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_mountable_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let m = BindMountable::new(dir.path());
        let (mounts, release) = m.mount(true).await.unwrap().mount().unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].is_readonly());
        assert!(release.is_none());
    }
}
