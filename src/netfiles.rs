//! Resolver and hosts file generation.
//!
//! Every execution gets `/etc/resolv.conf` and `/etc/hosts` bind-mounted from
//! files generated under the executor root:
//!
//! | File                    | Shared | Lifetime                    |
//! |-------------------------|--------|-----------------------------|
//! | `<root>/resolv.conf`    | yes    | rewritten atomically per run|
//! | `<root>/hosts`          | yes    | used when no extra hosts    |
//! | `<root>/hosts-<random>` | no     | removed at run teardown     |

use crate::constants::{
    DEFAULT_HOSTNAME, DEFAULT_NAMESERVERS, HOSTS_FILE, HOST_RESOLV_CONF, RESOLV_CONF_FILE,
};
use crate::error::Result;
use crate::mount::ReleaseFn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// DNS settings overriding the host resolver configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DnsConfig {
    /// Nameserver addresses.
    pub nameservers: Vec<String>,
    /// Resolver options (`ndots:2`, ...).
    pub options: Vec<String>,
    /// Search domains.
    pub search_domains: Vec<String>,
}

/// Extra `/etc/hosts` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIp {
    /// Hostname to resolve.
    pub host: String,
    /// Address it resolves to.
    pub ip: IpAddr,
}

#[derive(Debug, Default)]
struct ResolvConf {
    nameservers: Vec<String>,
    search: Vec<String>,
    options: Vec<String>,
}

fn parse_resolv_conf(content: &str) -> ResolvConf {
    let mut conf = ResolvConf::default();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_string)),
            Some("search") | Some("domain") => {
                conf.search = fields.map(str::to_string).collect();
            }
            Some("options") => conf.options.extend(fields.map(str::to_string)),
            _ => {}
        }
    }
    conf
}

fn is_loopback(nameserver: &str) -> bool {
    nameserver
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Renders `resolv.conf` from the host's configuration and an override.
///
/// Loopback nameservers are dropped since they are unreachable from an
/// isolated network namespace; when none remain, public defaults are used.
pub fn render_resolv_conf(host: &str, dns: Option<&DnsConfig>) -> String {
    let mut conf = parse_resolv_conf(host);
    conf.nameservers.retain(|ns| !is_loopback(ns));
    if let Some(dns) = dns {
        if !dns.nameservers.is_empty() {
            conf.nameservers = dns.nameservers.clone();
        }
        if !dns.search_domains.is_empty() {
            conf.search = dns.search_domains.clone();
        }
        if !dns.options.is_empty() {
            conf.options = dns.options.clone();
        }
    }
    if conf.nameservers.is_empty() {
        conf.nameservers = DEFAULT_NAMESERVERS.iter().map(|s| s.to_string()).collect();
    }

    let mut out = String::new();
    for ns in &conf.nameservers {
        out.push_str(&format!("nameserver {ns}\n"));
    }
    if !conf.search.is_empty() {
        out.push_str(&format!("search {}\n", conf.search.join(" ")));
    }
    if !conf.options.is_empty() {
        out.push_str(&format!("options {}\n", conf.options.join(" ")));
    }
    out
}

/// Renders the hosts file with loopback entries followed by `extra`.
pub fn render_hosts(extra: &[HostIp]) -> String {
    let mut out = format!(
        "127.0.0.1\tlocalhost {DEFAULT_HOSTNAME}\n::1\tlocalhost ip6-localhost ip6-loopback\n"
    );
    for entry in extra {
        out.push_str(&format!("{}\t{}\n", entry.ip, entry.host));
    }
    out
}

fn write_atomic(dir: &Path, target: &Path, content: &str) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Writes `<root>/resolv.conf` from the host configuration and returns its
/// path.
pub fn resolv_conf(root: &Path, dns: Option<&DnsConfig>) -> Result<PathBuf> {
    let host = fs::read_to_string(HOST_RESOLV_CONF).unwrap_or_default();
    write_resolv_conf(root, &host, dns)
}

/// Writes `<root>/resolv.conf` from the given host configuration content.
pub fn write_resolv_conf(root: &Path, host: &str, dns: Option<&DnsConfig>) -> Result<PathBuf> {
    fs::create_dir_all(root)?;
    let path = root.join(RESOLV_CONF_FILE);
    write_atomic(root, &path, &render_resolv_conf(host, dns))?;
    Ok(path)
}

/// Prepares the hosts file for a run.
///
/// Without extra hosts the shared `<root>/hosts` is returned and no cleanup
/// is needed. With extra hosts a private file is created and the returned
/// release action removes it.
pub fn hosts_file(root: &Path, extra: &[HostIp]) -> Result<(PathBuf, Option<ReleaseFn>)> {
    fs::create_dir_all(root)?;
    if extra.is_empty() {
        let path = root.join(HOSTS_FILE);
        write_atomic(root, &path, &render_hosts(&[]))?;
        return Ok((path, None));
    }

    let mut tmp = tempfile::Builder::new()
        .prefix("hosts-")
        .tempfile_in(root)?;
    tmp.write_all(render_hosts(extra).as_bytes())?;
    let (_, path) = tmp.keep().map_err(|e| e.error)?;
    debug!(path = %path.display(), entries = extra.len(), "Created private hosts file");

    let remove = path.clone();
    let cleanup: ReleaseFn = Box::new(move || {
        match fs::remove_file(&remove) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    });
    Ok((path, Some(cleanup)))
}

/// Removes generated files left behind by a previous process. Errors are
/// ignored.
pub fn remove_stale(root: &Path) {
    let _ = fs::remove_file(root.join(HOSTS_FILE));
    let _ = fs::remove_file(root.join(RESOLV_CONF_FILE));
}
