//! Link primitives: veth pairs, namespace moves, addresses, routes,
//! neighbors and renames.
//!
//! Every [`LinkOps`] method acts in the namespace of the calling OS thread.
//! Callers that need a container namespace run inside a
//! [`NetnsExecutor`](crate::netns::NetnsExecutor) section.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::error::{FwdError, FwdResult};
use crate::netns::Netns;
use crate::shell::{self, shellquote, IP_CMD};

/// Administrative state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminState {
    Up,
    Down,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Up => write!(f, "up"),
            AdminState::Down => write!(f, "down"),
        }
    }
}

/// Link primitives, scoped to the calling thread's namespace.
pub trait LinkOps: Send + Sync {
    /// Returns true if a link with this name exists.
    fn link_exists(&self, name: &str) -> FwdResult<bool>;

    /// Returns the name of the link bound to a PCI device, if visible.
    fn find_by_device(&self, device: &str) -> FwdResult<Option<String>>;

    /// Creates a veth pair with both ends at `mtu`.
    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> FwdResult<()>;

    /// Deletes a link (for a veth, both ends go away).
    fn delete_link(&self, name: &str) -> FwdResult<()>;

    /// Moves a link into another namespace.
    fn set_netns(&self, name: &str, ns: &Netns) -> FwdResult<()>;

    /// Sets the administrative state.
    fn set_admin_state(&self, name: &str, state: AdminState) -> FwdResult<()>;

    /// Renames a link. The link must be down.
    fn rename(&self, name: &str, new_name: &str) -> FwdResult<()>;

    /// Lists the addresses on a link in CIDR notation.
    fn addresses(&self, name: &str) -> FwdResult<Vec<String>>;

    /// Adds an address in CIDR notation.
    fn add_address(&self, name: &str, cidr: &str) -> FwdResult<()>;

    /// Removes an address in CIDR notation.
    fn delete_address(&self, name: &str, cidr: &str) -> FwdResult<()>;

    /// Adds a route to `prefix` through the link.
    fn add_route(&self, name: &str, prefix: &str) -> FwdResult<()>;

    /// Adds a permanent neighbor entry on the link.
    fn add_neighbor(&self, name: &str, ip: &str, mac: &str) -> FwdResult<()>;
}

/// Normalizes an address into CIDR notation; bare IPv4 addresses get /32 and
/// bare IPv6 addresses /128.
pub fn to_cidr(ip: &str) -> String {
    if ip.contains('/') {
        ip.to_string()
    } else if ip.contains(':') {
        format!("{}/128", ip)
    } else {
        format!("{}/32", ip)
    }
}

/// Adds `ip` to a link unless it is already present.
pub fn ensure_address(ops: &dyn LinkOps, name: &str, ip: &str) -> FwdResult<()> {
    let cidr = to_cidr(ip);
    if ops.addresses(name)?.iter().any(|a| *a == cidr) {
        return Ok(());
    }
    ops.add_address(name, &cidr)
}

// ---------------------------------------------------------------------------
// `ip` command builders
// ---------------------------------------------------------------------------

/// Build veth pair creation command
pub fn build_add_veth_cmd(name: &str, peer: &str, mtu: u32) -> String {
    format!(
        "{} link add {} mtu {} type veth peer name {} mtu {}",
        IP_CMD,
        shellquote(name),
        mtu,
        shellquote(peer),
        mtu
    )
}

/// Build link deletion command
pub fn build_del_link_cmd(name: &str) -> String {
    format!("{} link del {}", IP_CMD, shellquote(name))
}

/// Build link existence probe command
pub fn build_show_link_cmd(name: &str) -> String {
    format!("{} link show dev {}", IP_CMD, shellquote(name))
}

/// Build namespace move command
///
/// `ip` accepts a namespace file path in place of a named namespace.
pub fn build_set_netns_cmd(name: &str, ns_path: &str) -> String {
    format!(
        "{} link set dev {} netns {}",
        IP_CMD,
        shellquote(name),
        shellquote(ns_path)
    )
}

/// Build admin state command
pub fn build_set_state_cmd(name: &str, state: AdminState) -> String {
    format!("{} link set dev {} {}", IP_CMD, shellquote(name), state)
}

/// Build rename command
pub fn build_rename_cmd(name: &str, new_name: &str) -> String {
    format!(
        "{} link set dev {} name {}",
        IP_CMD,
        shellquote(name),
        shellquote(new_name)
    )
}

/// Build address listing command (one line per address)
pub fn build_show_addr_cmd(name: &str) -> String {
    format!("{} -o addr show dev {}", IP_CMD, shellquote(name))
}

/// Build address add command
pub fn build_add_addr_cmd(name: &str, cidr: &str) -> String {
    format!(
        "{} addr add {} dev {}",
        IP_CMD,
        shellquote(cidr),
        shellquote(name)
    )
}

/// Build address delete command
pub fn build_del_addr_cmd(name: &str, cidr: &str) -> String {
    format!(
        "{} addr del {} dev {}",
        IP_CMD,
        shellquote(cidr),
        shellquote(name)
    )
}

/// Build route command
///
/// Uses 'replace' so that re-wiring an interface does not fail on an
/// existing route.
pub fn build_add_route_cmd(name: &str, prefix: &str) -> String {
    let family = if prefix.contains(':') { " -6" } else { "" };
    format!(
        "{}{} route replace {} dev {}",
        IP_CMD,
        family,
        shellquote(prefix),
        shellquote(name)
    )
}

/// Build permanent neighbor command
pub fn build_add_neigh_cmd(name: &str, ip: &str, mac: &str) -> String {
    format!(
        "{} neigh replace {} lladdr {} dev {} nud permanent",
        IP_CMD,
        shellquote(ip),
        shellquote(mac),
        shellquote(name)
    )
}

/// Extracts CIDR addresses from `ip -o addr show` output.
pub fn parse_addresses(output: &str) -> Vec<String> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "inet" || token == "inet6" {
                if let Some(addr) = tokens.next() {
                    addrs.push(addr.to_string());
                }
            }
        }
    }
    addrs
}

/// [`LinkOps`] backed by the `ip` command.
///
/// Commands run on the calling thread so that they inherit its namespace.
#[derive(Debug, Clone)]
pub struct IpLink {
    sysfs_root: PathBuf,
}

impl IpLink {
    /// Creates primitives that read device bindings from `/sys`.
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys")
    }

    /// Creates primitives reading device bindings from another sysfs root.
    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: root.into(),
        }
    }

    fn run(&self, link: &str, operation: &str, cmd: &str) -> FwdResult<String> {
        shell::exec_blocking_or_throw(cmd).map_err(|e| match e {
            FwdError::ShellCommandFailed { output, .. } => FwdError::link(link, operation, output),
            other => other,
        })
    }
}

impl Default for IpLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkOps for IpLink {
    fn link_exists(&self, name: &str) -> FwdResult<bool> {
        Ok(shell::exec_blocking(&build_show_link_cmd(name))?.success())
    }

    fn find_by_device(&self, device: &str) -> FwdResult<Option<String>> {
        let dir = self
            .sysfs_root
            .join("bus/pci/devices")
            .join(device)
            .join("net");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> FwdResult<()> {
        self.run(name, "add-veth", &build_add_veth_cmd(name, peer, mtu))
            .map(|_| ())
    }

    fn delete_link(&self, name: &str) -> FwdResult<()> {
        self.run(name, "delete", &build_del_link_cmd(name)).map(|_| ())
    }

    fn set_netns(&self, name: &str, ns: &Netns) -> FwdResult<()> {
        let path = ns.path().ok_or_else(|| {
            FwdError::namespace_unavailable(ns.id(), "handle has no namespace file")
        })?;
        let cmd = build_set_netns_cmd(name, &path.display().to_string());
        self.run(name, "set-netns", &cmd).map(|_| ())
    }

    fn set_admin_state(&self, name: &str, state: AdminState) -> FwdResult<()> {
        self.run(name, "set-state", &build_set_state_cmd(name, state))
            .map(|_| ())
    }

    fn rename(&self, name: &str, new_name: &str) -> FwdResult<()> {
        self.run(name, "rename", &build_rename_cmd(name, new_name))
            .map(|_| ())
    }

    fn addresses(&self, name: &str) -> FwdResult<Vec<String>> {
        let out = self.run(name, "list-addresses", &build_show_addr_cmd(name))?;
        Ok(parse_addresses(&out))
    }

    fn add_address(&self, name: &str, cidr: &str) -> FwdResult<()> {
        self.run(name, "add-address", &build_add_addr_cmd(name, cidr))
            .map(|_| ())
    }

    fn delete_address(&self, name: &str, cidr: &str) -> FwdResult<()> {
        self.run(name, "delete-address", &build_del_addr_cmd(name, cidr))
            .map(|_| ())
    }

    fn add_route(&self, name: &str, prefix: &str) -> FwdResult<()> {
        self.run(name, "add-route", &build_add_route_cmd(name, prefix))
            .map(|_| ())
    }

    fn add_neighbor(&self, name: &str, ip: &str, mac: &str) -> FwdResult<()> {
        self.run(name, "add-neighbor", &build_add_neigh_cmd(name, ip, mac))
            .map(|_| ())
    }
}
