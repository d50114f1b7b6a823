//! Reference-counted VXLAN tunnel ports, one per remote peer.

use std::collections::HashMap;
use std::net::IpAddr;

use nsm_fwd_common::{Acquire, FwdResult, RefMap, Release, TunnelSpec};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::port_binding::PortBindings;
use crate::tables::TUNNEL_PORT_PREFIX;

/// Name of the tunnel port towards `remote`: the prefix followed by the
/// address with its separators removed.
pub fn tunnel_port_name(remote: &IpAddr) -> String {
    let digits: String = remote
        .to_string()
        .chars()
        .filter(|c| *c != '.' && *c != ':')
        .collect();
    format!("{}{}", TUNNEL_PORT_PREFIX, digits)
}

#[derive(Debug, Clone)]
struct TunnelEntry {
    name: String,
    spec: TunnelSpec,
}

/// The tunnel reference a connection holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHold {
    /// Tunnel port name.
    pub port: String,
    pub remote: IpAddr,
    /// VNI of the connection's flows on the tunnel port.
    pub vni: u32,
}

#[derive(Debug, Default)]
struct Tunnels {
    refs: RefMap<String, TunnelEntry>,
    holders: HashMap<String, TunnelHold>,
}

/// Tunnels keyed by peer address.
///
/// Each connection holds at most one reference, so repeating an acquire or
/// a release for the same connection does not move the count. What a
/// connection holds is recorded, so releasing needs only its id.
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    inner: Mutex<Tunnels>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a reference for `holder` on the tunnel to `remote`, creating
    /// its port on first use. Returns the port name.
    ///
    /// A holder moving to another peer gives up its old reference first.
    pub async fn acquire(
        &self,
        ports: &PortBindings,
        holder: &str,
        local: IpAddr,
        remote: IpAddr,
        vni: u32,
    ) -> FwdResult<String> {
        let mut inner = self.inner.lock().await;

        let moving = match inner.holders.get_mut(holder) {
            Some(held) if held.remote == remote => {
                debug!(tunnel = %held.port, holder, "Tunnel already held");
                held.vni = vni;
                return Ok(held.port.clone());
            }
            Some(_) => true,
            None => false,
        };
        if moving {
            drop_hold(&mut inner, ports, holder).await?;
        }

        let key = remote.to_string();
        let Tunnels { refs, holders } = &mut *inner;
        let name = if let Some(entry) = refs.get(&key) {
            if entry.spec.local_ip != local.to_string() {
                debug!(remote = %key, existing = %entry.spec.local_ip, requested = %local,
                    "Reusing tunnel with a different local address");
            }
            let entry = entry.clone();
            let name = entry.name.clone();
            if let Acquire::Shared(count) = refs.acquire(key, entry) {
                debug!(tunnel = %name, holder, refs = count, "Shared tunnel");
            }
            name
        } else {
            let entry = TunnelEntry {
                name: tunnel_port_name(&remote),
                spec: TunnelSpec {
                    local_ip: local.to_string(),
                    remote_ip: key.clone(),
                },
            };
            ports.add_tunnel(&entry.name, &entry.spec).await?;
            info!(tunnel = %entry.name, local = %local, remote = %remote, "Created tunnel");
            let name = entry.name.clone();
            refs.acquire(key, entry);
            name
        };

        holders.insert(
            holder.to_string(),
            TunnelHold {
                port: name.clone(),
                remote,
                vni,
            },
        );
        Ok(name)
    }

    /// The tunnel reference recorded for `holder`.
    pub async fn held(&self, holder: &str) -> Option<TunnelHold> {
        self.inner.lock().await.holders.get(holder).cloned()
    }

    /// Drops the reference `holder` has; the last one deletes the port and
    /// its binding. A holder without a reference is a no-op.
    ///
    /// If the port cannot be deleted the entry stays registered with the
    /// reference of `holder` and the error is returned.
    pub async fn release(&self, ports: &PortBindings, holder: &str) -> FwdResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.holders.contains_key(holder) {
            debug!(holder, "No tunnel reference to release");
            return Ok(());
        }
        drop_hold(&mut inner, ports, holder).await
    }

    /// Current reference count of the tunnel to `remote`.
    pub async fn ref_count(&self, remote: IpAddr) -> Option<u32> {
        self.inner.lock().await.refs.ref_count(&remote.to_string())
    }

    /// Number of live tunnels.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.refs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.refs.is_empty()
    }
}

async fn drop_hold(inner: &mut Tunnels, ports: &PortBindings, holder: &str) -> FwdResult<()> {
    let Tunnels { refs, holders } = inner;
    let Some(hold) = holders.remove(holder) else {
        return Ok(());
    };
    let key = hold.remote.to_string();

    match refs.release(&key) {
        Release::Absent => Ok(()),
        Release::Decremented(count) => {
            debug!(remote = %key, refs = count, "Tunnel still in use");
            Ok(())
        }
        Release::Removed(entry) => {
            if let Err(e) = ports.delete_port(&entry.name).await {
                warn!(tunnel = %entry.name, error = %e, "Failed to delete tunnel port");
                refs.restore(key, entry);
                holders.insert(holder.to_string(), hold);
                return Err(e);
            }
            info!(tunnel = %entry.name, remote = %key, "Deleted tunnel");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_fwd_common::{RetryPolicy, SwitchOps};
    use nsm_fwd_test::{MockSwitch, SwitchVerifier};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    const BRIDGE: &str = "br-nsm";

    async fn setup() -> (MockSwitch, PortBindings) {
        let switch = MockSwitch::new();
        switch.add_bridge(BRIDGE).await.unwrap();
        let ports = PortBindings::new(
            Arc::new(switch.clone()),
            BRIDGE,
            RetryPolicy::new(2, Duration::from_millis(1)),
        );
        (switch, ports)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tunnel_port_name() {
        assert_eq!(tunnel_port_name(&ip("10.0.0.5")), "v10005");
        assert_eq!(tunnel_port_name(&ip("fd00::5")), "vfd005");
    }

    #[tokio::test]
    async fn test_refcount_m_of_m() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let peer = ip("10.0.0.5");

        for (vni, holder) in ["1", "2", "3"].into_iter().enumerate() {
            let name = registry
                .acquire(&ports, holder, ip("10.0.0.1"), peer, vni as u32)
                .await
                .unwrap();
            assert_eq!(name, "v10005");
        }
        assert_eq!(registry.ref_count(peer).await, Some(3));
        assert_eq!(switch.call_count("add_tunnel_port"), 1);
        ports.lookup("v10005").await.unwrap();

        for holder in ["1", "2"] {
            registry.release(&ports, holder).await.unwrap();
        }
        SwitchVerifier::new(&switch, BRIDGE).assert_port("v10005").unwrap();

        registry.release(&ports, "3").await.unwrap();
        SwitchVerifier::new(&switch, BRIDGE).assert_no_port("v10005").unwrap();
        assert_eq!(ports.get("v10005"), None);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_hold_is_recorded() {
        let (_switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let peer = ip("10.0.0.5");
        registry
            .acquire(&ports, "1", ip("10.0.0.1"), peer, 42)
            .await
            .unwrap();

        assert_eq!(
            registry.held("1").await,
            Some(TunnelHold {
                port: "v10005".to_string(),
                remote: peer,
                vni: 42,
            })
        );
        assert_eq!(registry.held("2").await, None);

        registry.release(&ports, "1").await.unwrap();
        assert_eq!(registry.held("1").await, None);
    }

    #[tokio::test]
    async fn test_release_without_hold_is_noop() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let peer = ip("10.0.0.5");
        registry
            .acquire(&ports, "1", ip("10.0.0.1"), peer, 42)
            .await
            .unwrap();

        registry.release(&ports, "2").await.unwrap();
        registry.release(&ports, "2").await.unwrap();
        assert_eq!(registry.ref_count(peer).await, Some(1));
        assert_eq!(switch.call_count("delete_port"), 0);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let peer = ip("10.0.0.5");
        registry
            .acquire(&ports, "1", ip("10.0.0.1"), peer, 42)
            .await
            .unwrap();

        switch.fail_operation("delete_port");
        assert!(registry.release(&ports, "1").await.is_err());
        assert_eq!(registry.ref_count(peer).await, Some(1));
        assert_eq!(registry.held("1").await.map(|h| h.vni), Some(42));

        switch.clear_failures();
        registry.release(&ports, "1").await.unwrap();
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_create_registers_nothing() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        switch.fail_operation("add_tunnel_port");
        assert!(registry
            .acquire(&ports, "1", ip("10.0.0.1"), ip("10.0.0.5"), 42)
            .await
            .is_err());
        assert!(registry.is_empty().await);
        assert_eq!(registry.held("1").await, None);
    }

    #[tokio::test]
    async fn test_repeated_acquire_by_one_holder() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let peer = ip("10.0.0.5");

        for vni in [42, 43] {
            registry
                .acquire(&ports, "1", ip("10.0.0.1"), peer, vni)
                .await
                .unwrap();
        }
        registry
            .acquire(&ports, "2", ip("10.0.0.1"), peer, 44)
            .await
            .unwrap();
        assert_eq!(registry.ref_count(peer).await, Some(2));
        assert_eq!(registry.held("1").await.map(|h| h.vni), Some(43));

        registry.release(&ports, "1").await.unwrap();
        registry.release(&ports, "1").await.unwrap();
        assert_eq!(registry.ref_count(peer).await, Some(1));
        assert_eq!(switch.call_count("delete_port"), 0);
    }

    #[tokio::test]
    async fn test_holder_moving_to_another_peer() {
        let (switch, ports) = setup().await;
        let registry = TunnelRegistry::new();
        let first = ip("10.0.0.5");
        let second = ip("10.0.0.6");

        registry
            .acquire(&ports, "1", ip("10.0.0.1"), first, 42)
            .await
            .unwrap();
        let name = registry
            .acquire(&ports, "1", ip("10.0.0.1"), second, 42)
            .await
            .unwrap();

        assert_eq!(name, "v10006");
        assert_eq!(registry.ref_count(first).await, None);
        assert_eq!(registry.ref_count(second).await, Some(1));
        SwitchVerifier::new(&switch, BRIDGE).assert_no_port("v10005").unwrap();
    }
}
