//! In-memory switch: bridges, ports with OpenFlow numbers, and a flow table.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use nsm_fwd_common::{Flow, FlowMatch, FwdError, FwdResult, SwitchOps, TunnelSpec};
use parking_lot::Mutex;

/// A port attached to a mock bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPort {
    pub bridge: String,
    pub ofport: u32,
    pub tunnel: Option<TunnelSpec>,
}

#[derive(Debug, Default)]
struct SwitchState {
    bridges: BTreeSet<String>,
    ports: BTreeMap<String, MockPort>,
    next_ofport: u32,
    flows: Vec<(String, Flow)>,
    // Interfaces the switch reports without them being on a managed bridge.
    foreign: BTreeSet<String>,
    // Number of port-id queries answering 0 for a fresh port.
    unassigned_polls: u32,
    pending: HashMap<String, u32>,
    calls: HashMap<&'static str, u32>,
    failing: BTreeSet<&'static str>,
}

impl SwitchState {
    fn record(&mut self, op: &'static str) -> FwdResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        if self.failing.contains(op) {
            return Err(FwdError::switch(op, "injected failure"));
        }
        Ok(())
    }

    fn attach(
        &mut self,
        bridge: &str,
        port: &str,
        tunnel: Option<TunnelSpec>,
        op: &str,
    ) -> FwdResult<()> {
        if !self.bridges.contains(bridge) {
            return Err(FwdError::switch(op, format!("no bridge named {}", bridge)));
        }
        if self.ports.contains_key(port) {
            return Ok(());
        }
        self.next_ofport += 1;
        let ofport = self.next_ofport;
        self.ports.insert(
            port.to_string(),
            MockPort {
                bridge: bridge.to_string(),
                ofport,
                tunnel,
            },
        );
        if self.unassigned_polls > 0 {
            self.pending.insert(port.to_string(), self.unassigned_polls);
        }
        Ok(())
    }
}

/// In-memory switch.
///
/// Clones share the same state. Operation names used by
/// [`MockSwitch::call_count`] and [`MockSwitch::fail_operation`] are the
/// [`SwitchOps`] method names (`"add_port"`, `"add_flow"`, ...).
#[derive(Debug, Clone, Default)]
pub struct MockSwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl MockSwitch {
    /// Creates an empty switch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes freshly added ports report port number 0 for the first `polls`
    /// queries.
    pub fn with_unassigned_polls(self, polls: u32) -> Self {
        self.state.lock().unassigned_polls = polls;
        self
    }

    /// Reports `name` as an interface attached somewhere on the switch.
    pub fn add_foreign_interface(&self, name: &str) {
        self.state.lock().foreign.insert(name.to_string());
    }

    /// Makes every call of the named method fail.
    pub fn fail_operation(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Returns how many times a method was called.
    pub fn call_count(&self, op: &str) -> u32 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Returns true if the bridge exists.
    pub fn has_bridge(&self, bridge: &str) -> bool {
        self.state.lock().bridges.contains(bridge)
    }

    /// Returns a port by name.
    pub fn port(&self, name: &str) -> Option<MockPort> {
        self.state.lock().ports.get(name).cloned()
    }

    /// Returns the sorted names of attached ports.
    pub fn port_names(&self) -> Vec<String> {
        self.state.lock().ports.keys().cloned().collect()
    }

    /// Returns the flows installed on a bridge, in insertion order.
    pub fn flows(&self, bridge: &str) -> Vec<Flow> {
        self.state
            .lock()
            .flows
            .iter()
            .filter(|(b, _)| b == bridge)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Returns the rendered flows installed on a bridge.
    pub fn flow_strings(&self, bridge: &str) -> Vec<String> {
        self.flows(bridge).iter().map(Flow::to_string).collect()
    }
}

#[async_trait]
impl SwitchOps for MockSwitch {
    async fn add_bridge(&self, bridge: &str) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("add_bridge")?;
        state.bridges.insert(bridge.to_string());
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("delete_bridge")?;
        state.bridges.remove(bridge);
        state.ports.retain(|_, p| p.bridge != bridge);
        state.flows.retain(|(b, _)| b != bridge);
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("add_port")?;
        state.attach(bridge, port, None, "add-port")
    }

    async fn add_tunnel_port(
        &self,
        bridge: &str,
        port: &str,
        tunnel: &TunnelSpec,
    ) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("add_tunnel_port")?;
        state.attach(bridge, port, Some(tunnel.clone()), "add-tunnel-port")
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("delete_port")?;
        let on_bridge = state.ports.get(port).is_some_and(|p| p.bridge == bridge);
        if !on_bridge {
            return Err(FwdError::switch(
                "del-port",
                format!("bridge {} does not have a port {}", bridge, port),
            ));
        }
        state.ports.remove(port);
        state.pending.remove(port);
        Ok(())
    }

    async fn port_id(&self, port: &str) -> FwdResult<u32> {
        let mut state = self.state.lock();
        state.record("port_id")?;
        if let Some(remaining) = state.pending.get_mut(port) {
            *remaining -= 1;
            if *remaining == 0 {
                state.pending.remove(port);
            }
            return Ok(0);
        }
        Ok(state.ports.get(port).map_or(0, |p| p.ofport))
    }

    async fn add_flow(&self, bridge: &str, flow: &Flow) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("add_flow")?;
        if !state.bridges.contains(bridge) {
            return Err(FwdError::switch("add-flow", format!("{} is not a bridge", bridge)));
        }
        state.flows.push((bridge.to_string(), flow.clone()));
        Ok(())
    }

    async fn delete_flows(&self, bridge: &str, filter: Option<&FlowMatch>) -> FwdResult<()> {
        let mut state = self.state.lock();
        state.record("delete_flows")?;
        state.flows.retain(|(b, f)| {
            b != bridge || filter.is_some_and(|m| !f.matches.covered_by(m))
        });
        Ok(())
    }

    async fn list_ports(&self) -> FwdResult<Vec<String>> {
        let mut state = self.state.lock();
        state.record("list_ports")?;
        let mut names: Vec<String> = state.bridges.iter().cloned().collect();
        names.extend(state.ports.keys().cloned());
        names.extend(state.foreign.iter().cloned());
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_ports_get_increasing_ids() {
        let switch = MockSwitch::new();
        switch.add_bridge("br-nsm").await.unwrap();
        switch.add_port("br-nsm", "tapsrc1").await.unwrap();
        switch.add_port("br-nsm", "tapdst1").await.unwrap();
        // Idempotent re-add keeps the number.
        switch.add_port("br-nsm", "tapsrc1").await.unwrap();

        assert_eq!(switch.port_id("tapsrc1").await.unwrap(), 1);
        assert_eq!(switch.port_id("tapdst1").await.unwrap(), 2);
        assert_eq!(switch.port_id("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unassigned_polls() {
        let switch = MockSwitch::new().with_unassigned_polls(2);
        switch.add_bridge("br-nsm").await.unwrap();
        switch.add_port("br-nsm", "tap_1").await.unwrap();

        assert_eq!(switch.port_id("tap_1").await.unwrap(), 0);
        assert_eq!(switch.port_id("tap_1").await.unwrap(), 0);
        assert_eq!(switch.port_id("tap_1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_flows_by_match() {
        let switch = MockSwitch::new();
        switch.add_bridge("br-nsm").await.unwrap();
        switch.add_flow("br-nsm", &Flow::decap(9, 42, 1)).await.unwrap();
        switch.add_flow("br-nsm", &Flow::decap(9, 43, 2)).await.unwrap();
        switch.add_flow("br-nsm", &Flow::encap(1, 9, 42)).await.unwrap();

        switch
            .delete_flows("br-nsm", Some(&FlowMatch::tunnel(9, 42)))
            .await
            .unwrap();
        assert_eq!(
            switch.flow_strings("br-nsm"),
            vec![
                "priority=100,in_port=9,tun_id=43,actions=output:2",
                "priority=100,in_port=1,actions=set_field:42->tun_id,output:9",
            ]
        );

        switch.delete_flows("br-nsm", None).await.unwrap();
        assert!(switch.flows("br-nsm").is_empty());
    }

    #[tokio::test]
    async fn test_add_port_requires_bridge() {
        let switch = MockSwitch::new();
        assert!(matches!(
            switch.add_port("br-missing", "tapsrc1").await,
            Err(FwdError::SwitchProgrammingFailed { .. })
        ));
        assert_eq!(switch.call_count("add_port"), 1);
    }
}
