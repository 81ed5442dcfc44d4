//! Cgroup path derivation.
//!
//! Two driver conventions are supported:
//!
//! | Parent                  | Driver   | Path                        |
//! |-------------------------|----------|-----------------------------|
//! | `system.slice:docker:`  | systemd  | `system.slice:docker:<id>`  |
//! | `mygroup`               | cgroupfs | `/mygroup/buildkit/<id>`    |

use crate::constants::{CGROUP_NAMESPACE, SYSTEMD_PARENT_SEPARATOR, SYSTEMD_SLICE_MARKER};

/// Returns the cgroup path for execution `id` under `parent`, or `None`
/// when no parent is configured.
pub fn cgroups_path(parent: &str, id: &str) -> Option<String> {
    if parent.is_empty() {
        return None;
    }
    if parent.ends_with(SYSTEMD_PARENT_SEPARATOR) && parent.contains(SYSTEMD_SLICE_MARKER) {
        return Some(format!("{parent}{id}"));
    }
    Some(clean_absolute(&[parent, CGROUP_NAMESPACE, id]))
}

/// Joins `parts` under `/` and lexically normalizes the result.
fn clean_absolute(parts: &[&str]) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for part in parts {
        for comp in part.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    stack.pop();
                }
                c => stack.push(c),
            }
        }
    }
    format!("/{}", stack.join("/"))
}
