//! Fake sysfs tree for SR-IOV lookups.
//!
//! Lays out the subset of `/sys` the forwarder reads: PCI device directories
//! with `physfn`, `virtfn<N>` and `net/<netdev>` entries, and
//! `class/net/<netdev>` directories with `device`, `phys_switch_id` and
//! `phys_port_name`.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A temporary sysfs root.
#[derive(Debug)]
pub struct SysfsTree {
    dir: TempDir,
}

impl SysfsTree {
    /// Creates an empty tree.
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("bus/pci/devices"))?;
        fs::create_dir_all(dir.path().join("class/net"))?;
        Ok(Self { dir })
    }

    /// The root to hand to the code under test in place of `/sys`.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    fn pci(&self, addr: &str) -> PathBuf {
        self.root().join("bus/pci/devices").join(addr)
    }

    fn class_net(&self, netdev: &str) -> PathBuf {
        self.root().join("class/net").join(netdev)
    }

    fn add_netdev(
        &self,
        pci: &str,
        netdev: &str,
        switch_id: &str,
        port_name: Option<&str>,
    ) -> io::Result<()> {
        fs::create_dir_all(self.pci(pci).join("net").join(netdev))?;
        let class = self.class_net(netdev);
        fs::create_dir_all(&class)?;
        symlink(format!("../../../bus/pci/devices/{}", pci), class.join("device"))?;
        fs::write(class.join("phys_switch_id"), format!("{}\n", switch_id))?;
        if let Some(name) = port_name {
            fs::write(class.join("phys_port_name"), format!("{}\n", name))?;
        }
        Ok(())
    }

    /// Adds a physical function with its uplink netdev.
    pub fn add_pf(&self, pci: &str, netdev: &str, switch_id: &str) -> io::Result<&Self> {
        fs::create_dir_all(self.pci(pci))?;
        self.add_netdev(pci, netdev, switch_id, Some("p0"))?;
        Ok(self)
    }

    /// Adds VF number `index` of `pf_pci`, its netdev, and its representor
    /// netdev `rep` (with `phys_port_name` = `pf0vf<index>`).
    pub fn add_vf(
        &self,
        pf_pci: &str,
        index: u32,
        vf_pci: &str,
        vf_netdev: &str,
        rep: &str,
    ) -> io::Result<&Self> {
        let switch_id = fs::read_to_string(self.pf_uplink_class(pf_pci)?.join("phys_switch_id"))?;
        let switch_id = switch_id.trim();

        fs::create_dir_all(self.pci(vf_pci).join("net").join(vf_netdev))?;
        symlink(format!("../{}", pf_pci), self.pci(vf_pci).join("physfn"))?;
        symlink(
            format!("../{}", vf_pci),
            self.pci(pf_pci).join(format!("virtfn{}", index)),
        )?;

        // Representors hang off the PF device.
        let class = self.class_net(rep);
        fs::create_dir_all(&class)?;
        symlink(format!("../../../bus/pci/devices/{}", pf_pci), class.join("device"))?;
        fs::write(class.join("phys_switch_id"), format!("{}\n", switch_id))?;
        fs::write(class.join("phys_port_name"), format!("pf0vf{}\n", index))?;
        Ok(self)
    }

    /// Removes a representor netdev, as when the driver briefly drops it.
    pub fn remove_representor(&self, rep: &str) -> io::Result<()> {
        fs::remove_dir_all(self.class_net(rep))
    }

    fn pf_uplink_class(&self, pf_pci: &str) -> io::Result<PathBuf> {
        let entry = fs::read_dir(self.pci(pf_pci).join("net"))?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "physical function has no netdev")
            })??;
        Ok(self.class_net(&entry.file_name().to_string_lossy()))
    }
}
