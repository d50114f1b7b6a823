//! The connection controller.
//!
//! [`Forwarder`] owns every record a cross-connect creates: device
//! allocations, tunnel references, port bindings and the per-connection
//! state. Requests for different connection ids may run concurrently; a
//! request for an id that is mid-transition is rejected, a close waits for
//! the transition to settle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use nsm_fwd_common::{
    retry_fixed, FwdError, FwdResult, LinkOps, NetnsExecutor, NetnsOps, SwitchOps,
};
use tracing::{debug, error, info, warn};

use crate::config::ForwarderConfig;
use crate::device_pool::{Allocation, AllocationKey, DevicePool};
use crate::ifaces;
use crate::monitor::{MonitorSink, TracingMonitor};
use crate::port_binding::PortBindings;
use crate::sriov::SysfsSriov;
use crate::tables::PARAM_SRC_IP;
use crate::tunnel::TunnelRegistry;
use crate::types::{
    ConnectionKind, CrossConnectRequest, DeviceMap, EndpointDescriptor, LinkConfig, MechanismKind,
    Mechanisms, MonitorDevice, Role, Side,
};
use crate::vf::VfManager;

/// Host primitives the forwarder drives.
#[derive(Clone)]
pub struct Primitives {
    pub netns: Arc<dyn NetnsOps>,
    pub links: Arc<dyn LinkOps>,
    pub switch: Arc<dyn SwitchOps>,
}

/// Lifecycle of one connection id. Absent ids have no entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected(DeviceMap),
    Disconnecting,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected(_) => write!(f, "connected"),
            ConnState::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Records shared by all connections.
#[derive(Debug)]
pub struct ForwarderState {
    pool: tokio::sync::Mutex<DevicePool>,
    tunnels: TunnelRegistry,
    ports: PortBindings,
    connections: parking_lot::Mutex<HashMap<String, ConnState>>,
    // Interface configuration of every endpoint set up and not yet
    // released, so teardown does not depend on the close request.
    endpoints: parking_lot::Mutex<HashMap<AllocationKey, Endpoint>>,
    // Signalled whenever a request or a close for any id finishes.
    settled: tokio::sync::Notify,
}

impl ForwarderState {
    pub fn new(pool: DevicePool, ports: PortBindings) -> Self {
        Self {
            pool: tokio::sync::Mutex::new(pool),
            tunnels: TunnelRegistry::new(),
            ports,
            connections: parking_lot::Mutex::new(HashMap::new()),
            endpoints: parking_lot::Mutex::new(HashMap::new()),
            settled: tokio::sync::Notify::new(),
        }
    }

    fn recorded_endpoints(&self, conn_id: &str) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .endpoints
            .lock()
            .values()
            .filter(|e| e.key.conn_id == conn_id)
            .cloned()
            .collect();
        endpoints.sort_by_key(|e| e.key.role.key());
        endpoints
    }

    pub(crate) fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub(crate) fn ports(&self) -> &PortBindings {
        &self.ports
    }
}

/// A local endpoint of a connection.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub key: AllocationKey,
    pub side: Side,
    /// Switch-side veth name, used when no device is recorded for `key`.
    pub veth_port: String,
    pub link: Option<LinkConfig>,
}

/// What teardown knows about one endpoint.
#[derive(Debug)]
pub(crate) struct Teardown {
    /// Device recorded at connect time, if the endpoint was a VF.
    pub device: Option<String>,
    /// Switch port to unbind, if it could be determined.
    pub port: Option<String>,
}

/// OVS cross-connect forwarder.
pub struct Forwarder {
    config: ForwarderConfig,
    exec: NetnsExecutor,
    links: Arc<dyn LinkOps>,
    switch: Arc<dyn SwitchOps>,
    sriov: SysfsSriov,
    vfs: VfManager,
    monitor: Arc<dyn MonitorSink>,
    state: ForwarderState,
}

impl Forwarder {
    /// Builds a forwarder. VFs of the configured physical functions are
    /// added to the device pool.
    pub fn new(config: ForwarderConfig, prims: Primitives) -> FwdResult<Self> {
        config.validate()?;
        let sriov = SysfsSriov::new(&config.sysfs_root);

        let mut devices = config.devices.clone();
        for pf in &config.physical_functions {
            let vfs = sriov.virtual_functions(pf)?;
            info!(pf = %pf, count = vfs.len(), "Discovered virtual functions");
            devices.extend(vfs);
        }
        let pool = DevicePool::new(devices);
        info!(devices = pool.len(), "Device pool ready");

        let ports = PortBindings::new(
            Arc::clone(&prims.switch),
            config.bridge.clone(),
            config.retry.port_id_policy(),
        );
        let exec = NetnsExecutor::new(prims.netns);
        let vfs = VfManager::new(exec.clone(), Arc::clone(&prims.links));

        Ok(Self {
            exec,
            links: prims.links,
            switch: prims.switch,
            sriov,
            vfs,
            monitor: Arc::new(TracingMonitor),
            state: ForwarderState::new(pool, ports),
            config,
        })
    }

    /// Replaces the monitoring sink.
    pub fn with_monitor(mut self, monitor: Arc<dyn MonitorSink>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Creates the bridge if needed and clears its flow table.
    pub async fn init(&self) -> FwdResult<()> {
        let bridge = &self.config.bridge;
        self.switch.add_bridge(bridge).await?;
        self.switch.delete_flows(bridge, None).await?;
        info!(bridge = %bridge, "Bridge initialized");
        Ok(())
    }

    /// Mechanisms this forwarder accepts.
    pub fn mechanisms(&self) -> Mechanisms {
        let mut remote = EndpointDescriptor::new(MechanismKind::RemoteTunnel);
        if let Some(ip) = &self.config.egress_ip {
            remote = remote.with_param(PARAM_SRC_IP, ip.clone());
        }
        Mechanisms {
            local: vec![EndpointDescriptor::new(MechanismKind::LocalKernel)],
            remote: vec![remote],
        }
    }

    /// Runs a request or a close depending on its `connect` flag.
    pub async fn apply(&self, req: &CrossConnectRequest) -> FwdResult<DeviceMap> {
        if req.connect {
            self.request(req).await
        } else {
            self.close(req).await
        }
    }

    /// Establishes a cross-connect.
    ///
    /// A repeated request for a connected id returns the recorded devices.
    /// On failure nothing is rolled back; a close for the same id releases
    /// whatever was recorded.
    pub async fn request(&self, req: &CrossConnectRequest) -> FwdResult<DeviceMap> {
        let kind = req.validate()?;
        {
            let mut conns = self.state.connections.lock();
            match conns.get(&req.id) {
                Some(ConnState::Connected(devices)) => {
                    info!(conn_id = %req.id, "Connection already established");
                    return Ok(devices.clone());
                }
                Some(state) => {
                    return Err(FwdError::invalid_request(format!(
                        "connection {} is {}",
                        req.id, state
                    )));
                }
                None => {
                    conns.insert(req.id.clone(), ConnState::Connecting);
                }
            }
        }

        info!(conn_id = %req.id, kind = ?kind, "Connecting");
        let result = match kind {
            ConnectionKind::Local => self.connect_local(req).await,
            ConnectionKind::Incoming | ConnectionKind::Outgoing => {
                self.connect_remote(req, kind).await
            }
        };

        let result = match result {
            Ok(devices) => {
                self.state
                    .connections
                    .lock()
                    .insert(req.id.clone(), ConnState::Connected(devices.clone()));
                self.emit(&devices, true);
                info!(conn_id = %req.id, "Connected");
                Ok(devices)
            }
            Err(e) => {
                self.state.connections.lock().remove(&req.id);
                error!(conn_id = %req.id, error = %e, "Connect failed");
                Err(e)
            }
        };
        self.state.settled.notify_waiters();
        result
    }

    /// Tears down a cross-connect.
    ///
    /// A close arriving while the id is connecting waits for the request to
    /// settle first. One arriving while the id is already disconnecting
    /// waits for that close and returns no devices.
    ///
    /// Every step is best effort and driven by what was recorded at connect
    /// time; the request only fills in endpoints that left no record. The
    /// only error is an ambiguous request, reported after the recorded
    /// endpoints of the id have been torn down.
    pub async fn close(&self, req: &CrossConnectRequest) -> FwdResult<DeviceMap> {
        let mut joined = false;
        loop {
            let settled = self.state.settled.notified();
            {
                let mut conns = self.state.connections.lock();
                match conns.get(&req.id) {
                    Some(ConnState::Connecting) => {
                        debug!(conn_id = %req.id, "Close waiting for connect to settle");
                    }
                    Some(ConnState::Disconnecting) => {
                        debug!(conn_id = %req.id, "Close already in progress");
                        joined = true;
                    }
                    _ if joined => {
                        debug!(conn_id = %req.id, "Joined close finished");
                        return Ok(DeviceMap::new());
                    }
                    _ => {
                        conns.insert(req.id.clone(), ConnState::Disconnecting);
                        break;
                    }
                }
            }
            settled.await;
        }

        let result = match req.classify() {
            Ok(kind) => {
                info!(conn_id = %req.id, kind = ?kind, "Disconnecting");
                let devices = match kind {
                    ConnectionKind::Local => self.close_local(req).await,
                    ConnectionKind::Incoming | ConnectionKind::Outgoing => {
                        self.close_remote(req, kind).await
                    }
                };
                self.emit(&devices, false);
                info!(conn_id = %req.id, "Disconnected");
                Ok(devices)
            }
            Err(e) => {
                warn!(conn_id = %req.id, error = %e,
                    "Cannot classify close, tearing down recorded endpoints only");
                self.teardown(&req.id, Vec::new()).await;
                Err(e)
            }
        };
        self.state.connections.lock().remove(&req.id);
        self.state.settled.notify_waiters();
        result
    }

    fn emit(&self, devices: &DeviceMap, connected: bool) {
        if self.config.metrics_enabled {
            self.monitor.update(devices, connected);
        }
    }

    // ---------------------------------------------------------------------
    // State inspection
    // ---------------------------------------------------------------------

    /// Lifecycle state of a connection id.
    pub fn connection_state(&self, id: &str) -> Option<ConnState> {
        self.state.connections.lock().get(id).cloned()
    }

    /// Device recorded for a connection role.
    pub async fn allocation(&self, id: &str, role: Role) -> Option<String> {
        self.state
            .pool
            .lock()
            .await
            .record(&AllocationKey::new(id, role))
            .map(str::to_string)
    }

    /// In-use state of a pool device.
    pub async fn device_in_use(&self, device: &str) -> Option<bool> {
        self.state.pool.lock().await.is_in_use(device)
    }

    /// Number of pool devices currently handed out.
    pub async fn devices_in_use(&self) -> usize {
        self.state.pool.lock().await.in_use_count()
    }

    /// Reference count of the tunnel to a peer.
    pub async fn tunnel_refs(&self, remote: IpAddr) -> Option<u32> {
        self.state.tunnels.ref_count(remote).await
    }

    /// Number of live tunnels.
    pub async fn tunnel_count(&self) -> usize {
        self.state.tunnels.len().await
    }

    /// Cached OpenFlow port number of a switch port.
    pub fn port_number(&self, port: &str) -> Option<u32> {
        self.state.ports.get(port)
    }

    // ---------------------------------------------------------------------
    // Endpoint setup and teardown shared by local and remote connections
    // ---------------------------------------------------------------------

    /// Wires one local endpoint and returns its switch port: the VF
    /// representor when the endpoint lists devices, `veth_port` otherwise.
    ///
    /// The endpoint is recorded before anything is created on the host, so
    /// a close can undo a partial setup.
    pub(crate) async fn setup_endpoint(
        &self,
        key: AllocationKey,
        side: Side,
        ep: &EndpointDescriptor,
        cfg: &LinkConfig,
        veth_port: String,
    ) -> FwdResult<String> {
        let record = Endpoint {
            key: key.clone(),
            side,
            veth_port: veth_port.clone(),
            link: Some(cfg.clone()),
        };
        match ep.device_candidates()? {
            Some(candidates) => {
                // A VF record is only valid alongside its pool record.
                self.state.endpoints.lock().remove(&key);
                let allocation = self.allocate_device(key.clone(), &candidates).await?;
                self.state.endpoints.lock().insert(key, record);
                self.vfs.attach(&allocation.device, cfg).await?;
                Ok(allocation.representor)
            }
            None => {
                self.state.endpoints.lock().insert(key, record);
                ifaces::wire_veth(&self.exec, &self.links, &veth_port, cfg, self.config.veth_mtu)
                    .await?;
                Ok(veth_port)
            }
        }
    }

    async fn allocate_device(
        &self,
        key: AllocationKey,
        candidates: &[String],
    ) -> FwdResult<Allocation> {
        let attached: HashSet<String> = self.switch.list_ports().await?.into_iter().collect();
        let mut pool = self.state.pool.lock().await;
        let sriov = &self.sriov;
        pool.allocate_for(key, candidates, |device| match sriov.representor(device) {
            Ok(Some(rep)) if attached.contains(&rep) => {
                debug!(device, representor = %rep, "Representor already on the switch");
                None
            }
            Ok(rep) => rep,
            Err(e) => {
                debug!(device, error = %e, "Cannot resolve representor");
                None
            }
        })
    }

    /// Removes every local endpoint of `conn_id` and its tunnel reference.
    ///
    /// Recorded endpoints take precedence over `fallback`, which is derived
    /// from the close request. An endpoint whose interface could not be
    /// returned keeps its records and its device, so a later close retries.
    /// Returns the devices of the endpoints that had a configuration.
    pub(crate) async fn teardown(&self, conn_id: &str, fallback: Vec<Endpoint>) -> DeviceMap {
        let mut endpoints = self.state.recorded_endpoints(conn_id);
        for ep in fallback {
            if !endpoints.iter().any(|e| e.key == ep.key) {
                endpoints.push(ep);
            }
        }

        let ports = self.state.ports();
        let tunnels = self.state.tunnels();
        let hold = tunnels.held(conn_id).await;
        if let Some(hold) = &hold {
            if let Err(e) = ports.delete_tunnel_flows(&hold.port, hold.vni).await {
                warn!(tunnel = %hold.port, vni = hold.vni, error = %e, "Failed to delete tunnel flows");
            }
        }

        let mut targets = Vec::with_capacity(endpoints.len());
        for ep in &endpoints {
            targets.push(self.teardown_target(&ep.key, ep.veth_port.clone()).await);
        }
        for target in &targets {
            self.unbind_port(target).await;
        }

        let mut devices = DeviceMap::new();
        for (ep, target) in endpoints.into_iter().zip(&targets) {
            let released = self.release_interface(target, ep.link.as_ref()).await;
            self.finish_endpoint(&ep.key, released).await;
            if let Some(link) = ep.link {
                devices.insert(
                    link.netns,
                    MonitorDevice {
                        name: link.ifname,
                        xcon_name: ep.side.xcon_name(conn_id),
                    },
                );
            }
        }

        if let Some(hold) = hold {
            if let Err(e) = tunnels.release(ports, conn_id).await {
                warn!(remote = %hold.remote, error = %e, "Failed to release tunnel");
            }
        }
        devices
    }

    /// Works out which device and switch port an endpoint used.
    ///
    /// VF endpoints come from the allocation record; their representor is
    /// resolved again with retries. Veth endpoints use `veth_port`.
    async fn teardown_target(&self, key: &AllocationKey, veth_port: String) -> Teardown {
        let device = self.state.pool.lock().await.record(key).map(str::to_string);
        let Some(device) = device else {
            return Teardown {
                device: None,
                port: Some(veth_port),
            };
        };

        let sriov = &self.sriov;
        let dev = device.as_str();
        let policy = self.config.retry.representor_policy();
        let port = match retry_fixed(policy, "representor", || {
            let rep = sriov.representor(dev);
            async move { rep }
        })
        .await
        {
            Ok(rep) => Some(rep),
            Err(e) => {
                warn!(conn_id = %key.conn_id, device = %device, error = %e,
                    "Cannot resolve representor, leaving its switch port");
                None
            }
        };
        Teardown {
            device: Some(device),
            port,
        }
    }

    /// Deletes the flows and the switch port of an endpoint.
    async fn unbind_port(&self, target: &Teardown) {
        if let Some(port) = &target.port {
            if let Err(e) = self.state.ports.unbind(port).await {
                warn!(port = %port, error = %e, "Failed to unbind port");
            }
        }
    }

    /// Returns a VF to the host, or removes a veth pair. True when the
    /// interface is back.
    async fn release_interface(&self, target: &Teardown, cfg: Option<&LinkConfig>) -> bool {
        match (&target.device, cfg) {
            (Some(device), Some(cfg)) => match self.vfs.detach(device, cfg).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %device, error = %e, "Failed to detach VF");
                    false
                }
            },
            (Some(device), None) => {
                warn!(device = %device, "No interface configuration, VF left in its namespace");
                false
            }
            (None, cfg) => {
                let Some(port) = &target.port else {
                    return true;
                };
                match ifaces::unwire_veth(&self.exec, &self.links, port, cfg).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(port = %port, error = %e, "Failed to remove veth");
                        false
                    }
                }
            }
        }
    }

    /// Drops the endpoint record and frees its device once the interface is
    /// back; otherwise both stay for the next close.
    async fn finish_endpoint(&self, key: &AllocationKey, released: bool) {
        if !released {
            warn!(conn_id = %key.conn_id, role = %key.role, "Endpoint kept for a later close");
            return;
        }
        self.state.endpoints.lock().remove(key);
        if let Some(device) = self.state.pool.lock().await.release_for(key) {
            debug!(conn_id = %key.conn_id, role = %key.role, device = %device, "Freed device");
        }
    }

    pub(crate) fn state(&self) -> &ForwarderState {
        &self.state
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Interface configuration of an endpoint for teardown; problems are logged.
pub(crate) fn teardown_config(req: &CrossConnectRequest, side: Side) -> Option<LinkConfig> {
    match req.endpoint(side).link_config(side) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(conn_id = %req.id, error = %e, "Incomplete endpoint, skipping its interface");
            None
        }
    }
}
