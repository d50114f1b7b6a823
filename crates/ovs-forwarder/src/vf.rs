//! Moving SR-IOV VFs into container namespaces and back.

use std::collections::HashMap;
use std::sync::Arc;

use nsm_fwd_common::link::{ensure_address, to_cidr};
use nsm_fwd_common::{AdminState, FwdError, FwdResult, LinkOps, Netns, NetnsExecutor, NetnsScope};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::types::LinkConfig;

/// Where a VF link was found.
enum Located {
    Host(String),
    Target(String),
}

/// VF attach/detach with a registry of the names the links had on the host.
#[derive(Clone)]
pub struct VfManager {
    exec: NetnsExecutor,
    links: Arc<dyn LinkOps>,
    original_names: Arc<Mutex<HashMap<String, String>>>,
}

impl VfManager {
    pub fn new(exec: NetnsExecutor, links: Arc<dyn LinkOps>) -> Self {
        Self {
            exec,
            links,
            original_names: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Host name recorded for a device that is currently attached.
    pub fn original_name(&self, device: &str) -> Option<String> {
        self.original_names.lock().get(device).cloned()
    }

    /// Moves `device` into `cfg.netns`, names it `cfg.ifname` and configures
    /// it.
    ///
    /// A link already in the target namespace (left by an earlier attempt)
    /// is configured in place.
    pub async fn attach(&self, device: &str, cfg: &LinkConfig) -> FwdResult<()> {
        let links = Arc::clone(&self.links);
        let names = Arc::clone(&self.original_names);
        let device = device.to_string();
        let cfg = cfg.clone();

        self.exec
            .run("vf-attach", move |scope| {
                let target = scope.open(&cfg.netns)?;
                let name = match locate(links.as_ref(), scope, &target, &device, &cfg.ifname)? {
                    Located::Host(name) => {
                        names
                            .lock()
                            .entry(device.clone())
                            .or_insert_with(|| name.clone());
                        links.set_admin_state(&name, AdminState::Down)?;
                        links.set_netns(&name, &target)?;
                        scope.enter(&target)?;
                        name
                    }
                    Located::Target(name) => {
                        debug!(device = %device, link = %name, "VF already in target namespace");
                        links.set_admin_state(&name, AdminState::Down)?;
                        name
                    }
                };

                if let Some(ip) = &cfg.ip {
                    ensure_address(links.as_ref(), &name, ip)?;
                }
                if name != cfg.ifname {
                    links.rename(&name, &cfg.ifname)?;
                }
                links.set_admin_state(&cfg.ifname, AdminState::Up)?;
                for prefix in &cfg.routes {
                    links.add_route(&cfg.ifname, prefix)?;
                }
                for (ip, mac) in &cfg.neighbors {
                    links.add_neighbor(&cfg.ifname, ip, mac)?;
                }
                info!(device = %device, netns = %cfg.netns, ifname = %cfg.ifname, "Attached VF");
                Ok(())
            })
            .await
    }

    /// Returns `device` from `cfg.netns` to the host under its original name.
    ///
    /// A namespace that is already gone is not an error: the kernel hands
    /// the VF back to the host namespace on its own.
    pub async fn detach(&self, device: &str, cfg: &LinkConfig) -> FwdResult<()> {
        let links = Arc::clone(&self.links);
        let names = Arc::clone(&self.original_names);
        let device = device.to_string();
        let cfg = cfg.clone();

        self.exec
            .run("vf-detach", move |scope| {
                match scope.open(&cfg.netns) {
                    Ok(target) => {
                        scope.enter(&target)?;
                        let found = match links.find_by_device(&device)? {
                            Some(name) => Some(name),
                            None if links.link_exists(&cfg.ifname)? => Some(cfg.ifname.clone()),
                            None => None,
                        };
                        match found {
                            Some(name) => {
                                if let Some(ip) = &cfg.ip {
                                    let cidr = to_cidr(ip);
                                    if links.addresses(&name)?.contains(&cidr) {
                                        links.delete_address(&name, &cidr)?;
                                    }
                                }
                                links.set_admin_state(&name, AdminState::Down)?;
                                links.set_netns(&name, scope.origin())?;
                            }
                            None => {
                                warn!(device = %device, netns = %cfg.netns, "VF not found in target namespace");
                            }
                        }
                        scope.enter_origin()?;
                    }
                    Err(e) => {
                        warn!(device = %device, netns = %cfg.netns, error = %e, "Namespace gone, releasing VF degraded");
                    }
                }

                restore_name(links.as_ref(), &names, &device)?;
                info!(device = %device, netns = %cfg.netns, "Detached VF");
                Ok(())
            })
            .await
    }
}

impl std::fmt::Debug for VfManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfManager")
            .field("original_names", &*self.original_names.lock())
            .finish_non_exhaustive()
    }
}

// Looks for the device in the host namespace first, then in the target by
// device and by name. Leaves the thread in the namespace the link was found
// in.
fn locate(
    links: &dyn LinkOps,
    scope: &NetnsScope<'_>,
    target: &Netns,
    device: &str,
    ifname: &str,
) -> FwdResult<Located> {
    if let Some(name) = links.find_by_device(device)? {
        return Ok(Located::Host(name));
    }
    scope.enter(target)?;
    if let Some(name) = links.find_by_device(device)? {
        return Ok(Located::Target(name));
    }
    if links.link_exists(ifname)? {
        return Ok(Located::Target(ifname.to_string()));
    }
    scope.enter_origin()?;
    Err(FwdError::link(
        device,
        "attach",
        format!("no link for device in host or namespace {}", target.id()),
    ))
}

// Renames the host link of `device` back to its recorded name and drops the
// record. Must run in the host namespace.
fn restore_name(
    links: &dyn LinkOps,
    names: &Mutex<HashMap<String, String>>,
    device: &str,
) -> FwdResult<()> {
    let Some(original) = names.lock().get(device).cloned() else {
        return Ok(());
    };
    match links.find_by_device(device)? {
        Some(current) if current != original => {
            links.set_admin_state(&current, AdminState::Down)?;
            links.rename(&current, &original)?;
        }
        Some(_) => {}
        None => {
            warn!(device, "VF not back in host namespace yet, keeping its name record");
            return Ok(());
        }
    }
    names.lock().remove(device);
    Ok(())
}
