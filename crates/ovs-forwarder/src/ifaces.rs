//! Veth pairs between the switch and a container namespace.
//!
//! The switch end stays in the host namespace under the port name. The
//! container end is created under a staging name derived from the port name
//! and only takes the requested interface name once it is inside the target
//! namespace, so concurrent connections never collide on the host.

use std::sync::Arc;

use nsm_fwd_common::link::ensure_address;
use nsm_fwd_common::{AdminState, FwdResult, LinkOps, NetnsExecutor};
use tracing::{info, warn};

use crate::types::LinkConfig;

/// Host-side name of the container end of the veth for `port`.
pub fn staging_name(port: &str) -> String {
    format!("nsm{}", port.strip_prefix("tap").unwrap_or(port))
}

/// Creates the veth pair for `port` and wires its container end.
pub async fn wire_veth(
    exec: &NetnsExecutor,
    links: &Arc<dyn LinkOps>,
    port: &str,
    cfg: &LinkConfig,
    mtu: u32,
) -> FwdResult<()> {
    let links = Arc::clone(links);
    let port = port.to_string();
    let cfg = cfg.clone();

    exec.run("veth-wire", move |scope| {
        let target = scope.open(&cfg.netns)?;
        let staging = staging_name(&port);

        links.create_veth(&port, &staging, mtu)?;
        links.set_admin_state(&port, AdminState::Up)?;
        links.set_netns(&staging, &target)?;

        scope.enter(&target)?;
        links.rename(&staging, &cfg.ifname)?;
        if let Some(ip) = &cfg.ip {
            ensure_address(links.as_ref(), &cfg.ifname, ip)?;
        }
        links.set_admin_state(&cfg.ifname, AdminState::Up)?;
        for prefix in &cfg.routes {
            links.add_route(&cfg.ifname, prefix)?;
        }
        for (ip, mac) in &cfg.neighbors {
            links.add_neighbor(&cfg.ifname, ip, mac)?;
        }
        info!(port = %port, netns = %cfg.netns, ifname = %cfg.ifname, "Wired veth");
        Ok(())
    })
    .await
}

/// Brings the container end back to the host and deletes the pair.
///
/// Without a usable configuration, or when the namespace is gone, only the
/// switch end is removed.
pub async fn unwire_veth(
    exec: &NetnsExecutor,
    links: &Arc<dyn LinkOps>,
    port: &str,
    cfg: Option<&LinkConfig>,
) -> FwdResult<()> {
    let links = Arc::clone(links);
    let port = port.to_string();
    let cfg = cfg.cloned();

    exec.run("veth-unwire", move |scope| {
        let staging = staging_name(&port);
        if let Some(cfg) = &cfg {
            match scope.open(&cfg.netns) {
                Ok(target) => {
                    scope.enter(&target)?;
                    if links.link_exists(&cfg.ifname)? {
                        links.set_admin_state(&cfg.ifname, AdminState::Down)?;
                        links.rename(&cfg.ifname, &staging)?;
                        links.set_netns(&staging, scope.origin())?;
                    } else {
                        warn!(netns = %cfg.netns, ifname = %cfg.ifname, "Container end already gone");
                    }
                    scope.enter_origin()?;
                }
                Err(e) => {
                    warn!(netns = %cfg.netns, error = %e, "Namespace gone, removing switch end only");
                }
            }
        }

        if links.link_exists(&staging)? {
            links.delete_link(&staging)?;
        }
        if links.link_exists(&port)? {
            links.delete_link(&port)?;
        }
        info!(port = %port, "Unwired veth");
        Ok(())
    })
    .await
}
