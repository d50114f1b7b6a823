//! SR-IOV lookups through sysfs.
//!
//! A VF is identified by its PCI address. Its representor is the host netdev
//! that shares the uplink's `phys_switch_id` and whose `phys_port_name` names
//! the VF index (`pf0vf3` or `vf3`).

use std::fs;
use std::path::{Path, PathBuf};

use nsm_fwd_common::{FwdError, FwdResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

static REP_PORT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:pf\d+)?vf(\d+)$").expect("Invalid regex pattern"));

const VIRTFN_PREFIX: &str = "virtfn";

/// Sysfs-backed SR-IOV resolver.
#[derive(Debug, Clone)]
pub struct SysfsSriov {
    root: PathBuf,
}

impl SysfsSriov {
    /// Creates a resolver reading below `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pci_dir(&self, pci: &str) -> PathBuf {
        self.root.join("bus/pci/devices").join(pci)
    }

    fn class_net(&self) -> PathBuf {
        self.root.join("class/net")
    }

    /// Uplink netdev of the physical function owning `vf`.
    pub fn uplink(&self, vf: &str) -> FwdResult<String> {
        let dir = self.pci_dir(vf).join("physfn/net");
        first_entry(&dir)?
            .ok_or_else(|| FwdError::link(vf, "uplink", "physical function has no netdev"))
    }

    /// Index of `vf` among its physical function's virtual functions.
    pub fn vf_index(&self, vf: &str) -> FwdResult<u32> {
        let physfn = self.pci_dir(vf).join("physfn");
        for (index, target) in virtfns(&physfn)? {
            if target == vf {
                return Ok(index);
            }
        }
        Err(FwdError::link(vf, "vf-index", "not listed by its physical function"))
    }

    /// Representor netdev of `vf`.
    ///
    /// `Ok(None)` means the VF is well formed but its representor is not
    /// visible right now; the driver drops it briefly on some events.
    pub fn representor(&self, vf: &str) -> FwdResult<Option<String>> {
        let uplink = self.uplink(vf)?;
        let index = self.vf_index(vf)?;
        let switch_id = read_attr(&self.class_net().join(&uplink).join("phys_switch_id"))
            .ok_or_else(|| FwdError::link(&uplink, "representor", "uplink has no switch id"))?;

        let entries = match fs::read_dir(self.class_net()) {
            Ok(entries) => entries,
            Err(e) => return Err(FwdError::link(vf, "representor", e.to_string())),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == uplink {
                continue;
            }
            let dir = entry.path();
            if read_attr(&dir.join("phys_switch_id")).as_deref() != Some(switch_id.as_str()) {
                continue;
            }
            let Some(port_name) = read_attr(&dir.join("phys_port_name")) else {
                continue;
            };
            let matches = REP_PORT_NAME
                .captures(&port_name)
                .and_then(|c| c[1].parse::<u32>().ok())
                .is_some_and(|n| n == index);
            if matches {
                debug!(vf, representor = %name, "Resolved representor");
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// PCI addresses of the VFs of physical function netdev `pf`, in index
    /// order.
    pub fn virtual_functions(&self, pf: &str) -> FwdResult<Vec<String>> {
        let device = self.class_net().join(pf).join("device");
        if !device.exists() {
            return Err(FwdError::config(
                "physical_functions",
                format!("'{}' is not a PCI netdev", pf),
            ));
        }
        let mut vfs = virtfns(&device)?;
        vfs.sort_by_key(|(index, _)| *index);
        Ok(vfs.into_iter().map(|(_, pci)| pci).collect())
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_entry(dir: &Path) -> FwdResult<Option<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

// (index, PCI address) of every virtfn<N> link under a PF device directory.
fn virtfns(pf_dir: &Path) -> FwdResult<Vec<(u32, String)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(pf_dir)?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = name
            .strip_prefix(VIRTFN_PREFIX)
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let target = fs::read_link(entry.path())?;
        if let Some(pci) = target.file_name() {
            out.push((index, pci.to_string_lossy().into_owned()));
        }
    }
    Ok(out)
}
