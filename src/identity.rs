//! Execution identities and user resolution.
//!
//! A step's user is either numeric (`uid:gid`) and used as-is, or symbolic
//! (`name`, `name:group`, `uid`) and resolved against the `/etc/passwd` and
//! `/etc/group` files of the step's own root filesystem.

use crate::constants::{MAX_SYMLINK_DEPTH, WORKDIR_MODE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Generates a fresh execution identity.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// =============================================================================
// User Specification
// =============================================================================

/// Parsed form of a step's user field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSpec {
    /// Numeric `uid:gid`, usable without looking at the root filesystem.
    Numeric { uid: u32, gid: u32 },
    /// Anything else; needs the root filesystem's user database.
    Symbolic(String),
}

impl UserSpec {
    /// Parses a user field. An empty field means root (`0:0`).
    pub fn parse(user: &str) -> Self {
        if user.is_empty() {
            return Self::Numeric { uid: 0, gid: 0 };
        }
        if let Some((u, g)) = user.split_once(':') {
            if let (Ok(uid), Ok(gid)) = (u.parse(), g.parse()) {
                return Self::Numeric { uid, gid };
            }
        }
        Self::Symbolic(user.to_string())
    }
}

/// Numeric identity a process runs as.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
}

// =============================================================================
// User Database
// =============================================================================

#[derive(Debug)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Debug)]
struct GroupEntry {
    name: String,
    gid: u32,
    members: Vec<String>,
}

fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
            })
        })
        .collect()
}

fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            let members = fields
                .get(3)
                .map(|m| {
                    m.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupEntry {
                name: fields[0].to_string(),
                gid: fields[2].parse().ok()?,
                members,
            })
        })
        .collect()
}

fn read_db(rootfs: &Path, file: &str) -> Result<Option<String>> {
    let path = root_path(rootfs, file)?;
    match fs::read_to_string(&path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolves `user` against the user database inside `rootfs`.
///
/// Supplementary groups are collected from group membership of the matched
/// passwd entry, whether it was found by name or by uid, unless an explicit
/// group is requested.
pub fn lookup_user(rootfs: &Path, user: &str) -> Result<ResolvedUser> {
    let invalid = |reason: String| Error::InvalidUser {
        user: user.to_string(),
        reason,
    };
    let (user_arg, group_arg) = user.split_once(':').unwrap_or((user, ""));

    let passwd = read_db(rootfs, "/etc/passwd")?;
    let users = passwd.as_deref().map(parse_passwd).unwrap_or_default();
    let numeric_uid: Option<u32> = user_arg.parse().ok();

    let mut resolved = ResolvedUser::default();
    let mut matched_name = None;
    match users
        .iter()
        .find(|u| u.name == user_arg || Some(u.uid) == numeric_uid)
    {
        Some(entry) => {
            resolved.uid = entry.uid;
            resolved.gid = entry.gid;
            matched_name = Some(entry.name.clone());
        }
        None => match numeric_uid {
            Some(uid) => resolved.uid = uid,
            None if user_arg.is_empty() => {}
            None if passwd.is_none() => {
                return Err(invalid("no /etc/passwd in root filesystem".to_string()));
            }
            None => return Err(invalid("no matching entries in passwd file".to_string())),
        },
    }

    if group_arg.is_empty() && matched_name.is_none() {
        return Ok(resolved);
    }

    let groups = read_db(rootfs, "/etc/group")?
        .as_deref()
        .map(parse_group)
        .unwrap_or_default();

    if !group_arg.is_empty() {
        let numeric_gid: Option<u32> = group_arg.parse().ok();
        resolved.gid = match groups
            .iter()
            .find(|g| g.name == group_arg || Some(g.gid) == numeric_gid)
        {
            Some(g) => g.gid,
            None => numeric_gid
                .ok_or_else(|| invalid(format!("unable to find group {group_arg}")))?,
        };
    } else if let Some(name) = matched_name {
        resolved.additional_gids = groups
            .iter()
            .filter(|g| g.members.iter().any(|m| *m == name))
            .map(|g| g.gid)
            .collect();
    }

    Ok(resolved)
}

// =============================================================================
// Rooted Paths
// =============================================================================

/// Resolves `path` inside `root`, following symlinks without ever leaving
/// `root`. Missing components are accepted as-is.
pub fn root_path(root: &Path, path: &str) -> Result<PathBuf> {
    fn components(p: &str) -> VecDeque<String> {
        p.split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    let mut resolved = PathBuf::new();
    let mut pending = components(path);
    let mut links = 0;

    while let Some(comp) = pending.pop_front() {
        match comp.as_str() {
            "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }
        let candidate = resolved.join(&comp);
        let full = root.join(&candidate);
        match fs::symlink_metadata(&full) {
            Ok(meta) if meta.file_type().is_symlink() => {
                links += 1;
                if links > MAX_SYMLINK_DEPTH {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("too many symlinks resolving {path}"),
                    )));
                }
                let target = fs::read_link(&full)?;
                let target = target.to_string_lossy();
                if target.starts_with('/') {
                    resolved = PathBuf::new();
                }
                let mut next = components(&target);
                next.extend(pending);
                pending = next;
            }
            Ok(_) => resolved = candidate,
            Err(e) if e.kind() == io::ErrorKind::NotFound => resolved = candidate,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(root.join(resolved))
}

/// Ensures the working directory `cwd` exists inside `rootfs`, creating
/// missing components owned by `uid:gid`.
pub fn ensure_working_dir(rootfs: &Path, cwd: &str, uid: u32, gid: u32) -> Result<PathBuf> {
    let target = root_path(rootfs, cwd)?;
    if target.exists() {
        return Ok(target);
    }

    let mut missing = Vec::new();
    let mut cur = target.as_path();
    while !cur.exists() {
        missing.push(cur.to_path_buf());
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }

    for dir in missing.iter().rev() {
        match fs::DirBuilder::new().mode(WORKDIR_MODE).create(dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::chown(dir, Some(uid), Some(gid))?;
    }

    debug!(path = %target.display(), uid, gid, "Created working directory");
    Ok(target)
}
