//! Switch ports and the OpenFlow port numbers the switch assigned to them.

use std::collections::HashMap;
use std::sync::Arc;

use nsm_fwd_common::{
    retry_fixed, Flow, FlowMatch, FwdError, FwdResult, RetryPolicy, SwitchOps, TunnelSpec,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Port name → OpenFlow port number for ports attached by this forwarder.
pub struct PortBindings {
    switch: Arc<dyn SwitchOps>,
    bridge: String,
    retry: RetryPolicy,
    bindings: Mutex<HashMap<String, u32>>,
}

impl PortBindings {
    pub fn new(switch: Arc<dyn SwitchOps>, bridge: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            switch,
            bridge: bridge.into(),
            retry,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Cached port number of `port`.
    pub fn get(&self, port: &str) -> Option<u32> {
        self.bindings.lock().get(port).copied()
    }

    /// Attaches `port` to the bridge and returns its port number.
    pub async fn bind(&self, port: &str) -> FwdResult<u32> {
        self.switch.add_port(&self.bridge, port).await?;
        self.lookup(port).await
    }

    /// Creates a VXLAN port on the bridge. Its number is read with
    /// [`PortBindings::lookup`].
    pub async fn add_tunnel(&self, port: &str, tunnel: &TunnelSpec) -> FwdResult<()> {
        self.switch.add_tunnel_port(&self.bridge, port, tunnel).await
    }

    /// Returns the port number of an attached port, waiting while the
    /// switch still reports 0.
    pub async fn lookup(&self, port: &str) -> FwdResult<u32> {
        if let Some(id) = self.get(port) {
            return Ok(id);
        }
        let switch = &self.switch;
        let id = retry_fixed(self.retry, &format!("port number of {}", port), || async move {
            let id = switch.port_id(port).await?;
            Ok::<_, FwdError>((id != 0).then_some(id))
        })
        .await?;
        self.bindings.lock().insert(port.to_string(), id);
        debug!(port, ofport = id, "Bound port");
        Ok(id)
    }

    /// Installs flows on the bridge.
    pub async fn install(&self, flows: &[Flow]) -> FwdResult<()> {
        for flow in flows {
            self.switch.add_flow(&self.bridge, flow).await?;
        }
        Ok(())
    }

    /// Deletes the flows entering through `port`, then the port itself.
    ///
    /// Unbound ports are left alone. Both deletions are attempted; the
    /// first error is returned.
    pub async fn unbind(&self, port: &str) -> FwdResult<()> {
        let Some(id) = self.get(port) else {
            debug!(port, "Port not bound, nothing to remove");
            return Ok(());
        };
        let flows = self
            .switch
            .delete_flows(&self.bridge, Some(&FlowMatch::in_port(id)))
            .await;
        if let Err(e) = &flows {
            warn!(port, ofport = id, error = %e, "Failed to delete port flows");
        }
        self.delete_port(port).await?;
        info!(port, ofport = id, "Unbound port");
        flows
    }

    /// Deletes a port from the bridge and drops its binding.
    pub async fn delete_port(&self, port: &str) -> FwdResult<()> {
        self.switch.delete_port(&self.bridge, port).await?;
        self.forget(port);
        Ok(())
    }

    /// Drops a binding without touching the switch.
    pub fn forget(&self, port: &str) -> Option<u32> {
        self.bindings.lock().remove(port)
    }

    /// Deletes the flows of one VNI arriving through a tunnel port, leaving
    /// other connections on the same tunnel untouched.
    pub async fn delete_tunnel_flows(&self, tunnel: &str, vni: u32) -> FwdResult<()> {
        let Some(id) = self.get(tunnel) else {
            debug!(tunnel, vni, "Tunnel not bound, no flows to remove");
            return Ok(());
        };
        self.switch
            .delete_flows(&self.bridge, Some(&FlowMatch::tunnel(id, vni)))
            .await
    }
}

impl std::fmt::Debug for PortBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortBindings")
            .field("bridge", &self.bridge)
            .field("bindings", &*self.bindings.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_fwd_test::{MockSwitch, SwitchVerifier};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const BRIDGE: &str = "br-nsm";
    const FAST: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(1));

    async fn bindings(switch: &MockSwitch) -> PortBindings {
        switch.add_bridge(BRIDGE).await.unwrap();
        PortBindings::new(Arc::new(switch.clone()), BRIDGE, FAST)
    }

    #[tokio::test]
    async fn test_bind_waits_for_port_number() {
        let switch = MockSwitch::new().with_unassigned_polls(3);
        let ports = bindings(&switch).await;

        let id = ports.bind("tapsrc1").await.unwrap();
        assert_eq!(id, SwitchVerifier::new(&switch, BRIDGE).assert_port("tapsrc1").unwrap());
        assert_eq!(switch.call_count("port_id"), 4);

        // Cached from now on.
        assert_eq!(ports.lookup("tapsrc1").await.unwrap(), id);
        assert_eq!(switch.call_count("port_id"), 4);
    }

    #[tokio::test]
    async fn test_bind_gives_up() {
        let switch = MockSwitch::new().with_unassigned_polls(10);
        let ports = bindings(&switch).await;
        assert!(matches!(
            ports.bind("tapsrc1").await,
            Err(FwdError::TransientLookupFailure { attempts: 5, .. })
        ));
        assert_eq!(ports.get("tapsrc1"), None);
    }

    #[tokio::test]
    async fn test_unbind_removes_flows_and_port() {
        let switch = MockSwitch::new();
        let ports = bindings(&switch).await;
        let a = ports.bind("tapsrc1").await.unwrap();
        let b = ports.bind("tapdst1").await.unwrap();
        ports
            .install(&[Flow::forward(a, b), Flow::forward(b, a)])
            .await
            .unwrap();

        ports.unbind("tapsrc1").await.unwrap();
        let verifier = SwitchVerifier::new(&switch, BRIDGE);
        verifier.assert_no_port("tapsrc1").unwrap();
        verifier.assert_no_flows(&FlowMatch::in_port(a)).unwrap();
        verifier.assert_flow(&Flow::forward(b, a)).unwrap();
        assert_eq!(ports.get("tapsrc1"), None);

        // Unbound names are a no-op.
        ports.unbind("tapsrc1").await.unwrap();
        assert_eq!(switch.call_count("delete_port"), 1);
    }

    #[tokio::test]
    async fn test_tunnel_flows_are_per_vni() {
        let switch = MockSwitch::new();
        let ports = bindings(&switch).await;
        let spec = TunnelSpec {
            local_ip: "10.0.0.1".to_string(),
            remote_ip: "10.0.0.5".to_string(),
        };
        ports.add_tunnel("v10005", &spec).await.unwrap();
        let t = ports.lookup("v10005").await.unwrap();
        let l1 = ports.bind("tap_1").await.unwrap();
        let l2 = ports.bind("tap_2").await.unwrap();
        ports
            .install(&[Flow::decap(t, 42, l1), Flow::decap(t, 43, l2)])
            .await
            .unwrap();

        ports.delete_tunnel_flows("v10005", 42).await.unwrap();
        let verifier = SwitchVerifier::new(&switch, BRIDGE);
        verifier.assert_no_flows(&FlowMatch::tunnel(t, 42)).unwrap();
        verifier.assert_flow(&Flow::decap(t, 43, l2)).unwrap();
    }
}
