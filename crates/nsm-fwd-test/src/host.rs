//! In-memory host: namespaces and links.
//!
//! The namespace a thread is "in" is tracked per OS thread, like the real
//! kernel property, so code running inside a `NetnsExecutor` section sees
//! the links of the namespace it entered.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nsm_fwd_common::link::AdminState;
use nsm_fwd_common::{FwdError, FwdResult, LinkOps, Netns, NetnsOps};
use parking_lot::Mutex;

/// Namespace id of the simulated host namespace.
pub const HOST_NS: &str = "host";

static NEXT_HOST: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_NS: RefCell<HashMap<u64, String>> = RefCell::new(HashMap::new());
}

/// Observable state of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub name: String,
    pub netns: String,
    pub up: bool,
    pub mtu: u32,
    pub peer: Option<String>,
    pub device: Option<String>,
    pub addresses: Vec<String>,
    pub routes: Vec<String>,
    pub neighbors: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct World {
    namespaces: BTreeSet<String>,
    // Keyed by a stable link index so renames and moves keep identity.
    links: HashMap<u64, LinkSnapshot>,
    next_index: u64,
    failing: HashSet<String>,
}

impl World {
    fn find(&self, ns: &str, name: &str) -> Option<u64> {
        self.links
            .iter()
            .find(|(_, l)| l.netns == ns && l.name == name)
            .map(|(idx, _)| *idx)
    }

    fn get_mut(&mut self, ns: &str, name: &str, op: &str) -> FwdResult<&mut LinkSnapshot> {
        let idx = self
            .find(ns, name)
            .ok_or_else(|| FwdError::link(name, op, format!("no such link in {}", ns)))?;
        self.links
            .get_mut(&idx)
            .ok_or_else(|| FwdError::internal("link index vanished"))
    }

    fn insert(&mut self, link: LinkSnapshot) -> u64 {
        self.next_index += 1;
        self.links.insert(self.next_index, link);
        self.next_index
    }

    fn check(&self, op: &str, name: &str) -> FwdResult<()> {
        if self.failing.contains(op) {
            return Err(FwdError::link(name, op, "injected failure"));
        }
        Ok(())
    }
}

/// In-memory namespaces and links.
///
/// Clones share the same world.
#[derive(Debug, Clone)]
pub struct MockHost {
    instance: u64,
    world: Arc<Mutex<World>>,
}

impl MockHost {
    /// Creates a host with only the host namespace.
    pub fn new() -> Self {
        let mut world = World::default();
        world.namespaces.insert(HOST_NS.to_string());
        Self {
            instance: NEXT_HOST.fetch_add(1, Ordering::SeqCst),
            world: Arc::new(Mutex::new(world)),
        }
    }

    /// Adds a container namespace.
    pub fn add_namespace(&self, id: &str) -> &Self {
        self.world.lock().namespaces.insert(id.to_string());
        self
    }

    /// Removes a namespace together with every link inside it.
    pub fn remove_namespace(&self, id: &str) {
        let mut world = self.world.lock();
        world.namespaces.remove(id);
        world.links.retain(|_, l| l.netns != id);
    }

    /// Adds a link bound to a PCI device (a VF netdev) to the host namespace.
    pub fn add_device_link(&self, name: &str, device: &str) -> &Self {
        self.world.lock().insert(LinkSnapshot {
            name: name.to_string(),
            netns: HOST_NS.to_string(),
            up: false,
            mtu: 1500,
            peer: None,
            device: Some(device.to_string()),
            addresses: Vec::new(),
            routes: Vec::new(),
            neighbors: Vec::new(),
        });
        self
    }

    /// Makes every call of the named [`LinkOps`] method fail.
    ///
    /// Method names are the operation labels used in errors, e.g.
    /// `"create-veth"`, `"set-netns"`, `"rename"`.
    pub fn fail_operation(&self, op: &str) {
        self.world.lock().failing.insert(op.to_string());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.world.lock().failing.clear();
    }

    /// Returns a link by namespace and name.
    pub fn link(&self, netns: &str, name: &str) -> Option<LinkSnapshot> {
        let world = self.world.lock();
        world.find(netns, name).and_then(|idx| world.links.get(&idx).cloned())
    }

    /// Returns the link bound to a device, wherever it is.
    pub fn device_link(&self, device: &str) -> Option<LinkSnapshot> {
        self.world
            .lock()
            .links
            .values()
            .find(|l| l.device.as_deref() == Some(device))
            .cloned()
    }

    /// Returns the sorted link names in a namespace.
    pub fn links_in(&self, netns: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .world
            .lock()
            .links
            .values()
            .filter(|l| l.netns == netns)
            .map(|l| l.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Returns the total number of links across all namespaces.
    pub fn link_count(&self) -> usize {
        self.world.lock().links.len()
    }

    fn current_ns(&self) -> String {
        CURRENT_NS.with(|cur| {
            cur.borrow()
                .get(&self.instance)
                .cloned()
                .unwrap_or_else(|| HOST_NS.to_string())
        })
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl NetnsOps for MockHost {
    fn current(&self) -> FwdResult<Netns> {
        Ok(Netns::detached(self.current_ns()))
    }

    fn open(&self, id: &str) -> FwdResult<Netns> {
        if self.world.lock().namespaces.contains(id) {
            Ok(Netns::detached(id))
        } else {
            Err(FwdError::namespace_unavailable(id, "no such namespace"))
        }
    }

    fn enter(&self, ns: &Netns) -> FwdResult<()> {
        if !self.world.lock().namespaces.contains(ns.id()) {
            return Err(FwdError::namespace_unavailable(ns.id(), "namespace is gone"));
        }
        CURRENT_NS.with(|cur| {
            cur.borrow_mut().insert(self.instance, ns.id().to_string());
        });
        Ok(())
    }
}

impl LinkOps for MockHost {
    fn link_exists(&self, name: &str) -> FwdResult<bool> {
        let ns = self.current_ns();
        Ok(self.world.lock().find(&ns, name).is_some())
    }

    fn find_by_device(&self, device: &str) -> FwdResult<Option<String>> {
        let ns = self.current_ns();
        Ok(self
            .world
            .lock()
            .links
            .values()
            .find(|l| l.netns == ns && l.device.as_deref() == Some(device))
            .map(|l| l.name.clone()))
    }

    fn create_veth(&self, name: &str, peer: &str, mtu: u32) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("create-veth", name)?;
        for n in [name, peer] {
            if world.find(&ns, n).is_some() {
                return Err(FwdError::link(n, "create-veth", "file exists"));
            }
        }
        for (n, p) in [(name, peer), (peer, name)] {
            world.insert(LinkSnapshot {
                name: n.to_string(),
                netns: ns.clone(),
                up: false,
                mtu,
                peer: Some(p.to_string()),
                device: None,
                addresses: Vec::new(),
                routes: Vec::new(),
                neighbors: Vec::new(),
            });
        }
        Ok(())
    }

    fn delete_link(&self, name: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("delete", name)?;
        let idx = world
            .find(&ns, name)
            .ok_or_else(|| FwdError::link(name, "delete", "no such link"))?;
        let removed = world.links.remove(&idx);
        // Deleting either end of a veth removes the pair.
        if let Some(peer) = removed.and_then(|l| l.peer) {
            world
                .links
                .retain(|_, l| !(l.name == peer && l.peer.as_deref() == Some(name)));
        }
        Ok(())
    }

    fn set_netns(&self, name: &str, target: &Netns) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("set-netns", name)?;
        if !world.namespaces.contains(target.id()) {
            return Err(FwdError::namespace_unavailable(target.id(), "namespace is gone"));
        }
        if world.find(target.id(), name).is_some() {
            return Err(FwdError::link(name, "set-netns", "name taken in target"));
        }
        let link = world.get_mut(&ns, name, "set-netns")?;
        link.netns = target.id().to_string();
        // Moving a link resets its state and drops its addresses.
        link.up = false;
        link.addresses.clear();
        link.routes.clear();
        link.neighbors.clear();
        Ok(())
    }

    fn set_admin_state(&self, name: &str, state: AdminState) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("set-state", name)?;
        world.get_mut(&ns, name, "set-state")?.up = state == AdminState::Up;
        Ok(())
    }

    fn rename(&self, name: &str, new_name: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("rename", name)?;
        if name != new_name && world.find(&ns, new_name).is_some() {
            return Err(FwdError::link(new_name, "rename", "file exists"));
        }
        let link = world.get_mut(&ns, name, "rename")?;
        if link.up {
            return Err(FwdError::link(name, "rename", "device or resource busy"));
        }
        link.name = new_name.to_string();
        Ok(())
    }

    fn addresses(&self, name: &str) -> FwdResult<Vec<String>> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        Ok(world.get_mut(&ns, name, "list-addresses")?.addresses.clone())
    }

    fn add_address(&self, name: &str, cidr: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("add-address", name)?;
        let link = world.get_mut(&ns, name, "add-address")?;
        if link.addresses.iter().any(|a| a == cidr) {
            return Err(FwdError::link(name, "add-address", "file exists"));
        }
        link.addresses.push(cidr.to_string());
        Ok(())
    }

    fn delete_address(&self, name: &str, cidr: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("delete-address", name)?;
        let link = world.get_mut(&ns, name, "delete-address")?;
        let before = link.addresses.len();
        link.addresses.retain(|a| a != cidr);
        if link.addresses.len() == before {
            return Err(FwdError::link(name, "delete-address", "cannot assign requested address"));
        }
        Ok(())
    }

    fn add_route(&self, name: &str, prefix: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("add-route", name)?;
        let link = world.get_mut(&ns, name, "add-route")?;
        if !link.routes.iter().any(|r| r == prefix) {
            link.routes.push(prefix.to_string());
        }
        Ok(())
    }

    fn add_neighbor(&self, name: &str, ip: &str, mac: &str) -> FwdResult<()> {
        let ns = self.current_ns();
        let mut world = self.world.lock();
        world.check("add-neighbor", name)?;
        let link = world.get_mut(&ns, name, "add-neighbor")?;
        link.neighbors.retain(|(i, _)| i != ip);
        link.neighbors.push((ip.to_string(), mac.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_fwd_common::NetnsExecutor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_veth_pair_lifecycle() {
        let host = MockHost::new();
        host.create_veth("nsm0", "tapsrc1", 16000).unwrap();
        assert_eq!(host.links_in(HOST_NS), vec!["nsm0", "tapsrc1"]);
        assert_eq!(host.link(HOST_NS, "nsm0").unwrap().mtu, 16000);

        host.delete_link("tapsrc1").unwrap();
        assert_eq!(host.link_count(), 0);
    }

    #[test]
    fn test_rename_requires_down() {
        let host = MockHost::new();
        host.add_device_link("enp1s0f0v0", "0000:01:00.1");
        host.set_admin_state("enp1s0f0v0", AdminState::Up).unwrap();
        assert!(host.rename("enp1s0f0v0", "nsm0").is_err());

        host.set_admin_state("enp1s0f0v0", AdminState::Down).unwrap();
        host.rename("enp1s0f0v0", "nsm0").unwrap();
        assert_eq!(host.device_link("0000:01:00.1").unwrap().name, "nsm0");
    }

    #[tokio::test]
    async fn test_namespace_is_per_thread() {
        let host = MockHost::new();
        host.add_namespace("4026532000");
        host.create_veth("nsm0", "tapsrc1", 1500).unwrap();

        let exec = NetnsExecutor::new(Arc::new(host.clone()));
        let moved = host.clone();
        exec.run("move", move |scope| {
            let target = scope.open("4026532000")?;
            moved.set_netns("nsm0", &target)?;
            scope.enter(&target)?;
            moved.set_admin_state("nsm0", AdminState::Up)?;
            moved.add_address("nsm0", "10.0.0.1/24")
        })
        .await
        .unwrap();

        // The test thread never left the host namespace.
        assert!(!host.link_exists("nsm0").unwrap());
        let link = host.link("4026532000", "nsm0").unwrap();
        assert!(link.up);
        assert_eq!(link.addresses, vec!["10.0.0.1/24"]);
    }

    #[test]
    fn test_injected_failure() {
        let host = MockHost::new();
        host.fail_operation("create-veth");
        assert!(matches!(
            host.create_veth("a", "b", 1500),
            Err(FwdError::Link { .. })
        ));
        host.clear_failures();
        host.create_veth("a", "b", 1500).unwrap();
    }
}
