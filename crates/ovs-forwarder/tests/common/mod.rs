//! Shared environment and request fixtures for forwarder scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use nsm_fwd_test::{MockHost, MockSwitch, SysfsTree};
use ovs_forwarder::tables::*;
use ovs_forwarder::{
    CrossConnectRequest, DeviceMap, EndpointDescriptor, Forwarder, ForwarderConfig, IpContext,
    MechanismKind, MonitorSink, Primitives, RetryConfig, Route,
};
use parking_lot::Mutex;

pub const BRIDGE: &str = "br-nsm";
pub const PF_PCI: &str = "0000:01:00.0";
pub const PF_NETDEV: &str = "enp1s0f0";
pub const EGRESS_IP: &str = "10.0.0.1";
pub const PEER_IP: &str = "10.0.0.5";

pub const NS_A: &str = "4026532001";
pub const NS_B: &str = "4026532002";
pub const NS_C: &str = "4026532003";
pub const NS_D: &str = "4026532004";

/// PCI address of VF `index` of the test PF.
pub fn vf_pci(index: u32) -> String {
    format!("0000:01:00.{}", index + 1)
}

/// Host netdev of VF `index`.
pub fn vf_netdev(index: u32) -> String {
    format!("{}v{}", PF_NETDEV, index)
}

/// Representor of VF `index`.
pub fn vf_rep(index: u32) -> String {
    format!("{}_{}", PF_NETDEV, index)
}

/// Monitoring sink that keeps every event.
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<(DeviceMap, bool)>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<(DeviceMap, bool)> {
        self.events.lock().clone()
    }
}

impl MonitorSink for RecordingMonitor {
    fn update(&self, devices: &DeviceMap, connected: bool) {
        self.events.lock().push((devices.clone(), connected));
    }
}

/// A forwarder over an in-memory host and switch, with four VFs and four
/// container namespaces.
pub struct TestEnv {
    pub host: MockHost,
    pub switch: MockSwitch,
    pub sysfs: SysfsTree,
    pub monitor: Arc<RecordingMonitor>,
    pub forwarder: Forwarder,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut ForwarderConfig)) -> Self {
        Self::build(MockSwitch::new(), customize).await
    }

    /// Uses a preconfigured switch, e.g. one with slow port numbering.
    pub async fn with_switch(switch: MockSwitch) -> Self {
        Self::build(switch, |_| {}).await
    }

    async fn build(switch: MockSwitch, customize: impl FnOnce(&mut ForwarderConfig)) -> Self {
        let host = MockHost::new();
        for ns in [NS_A, NS_B, NS_C, NS_D] {
            host.add_namespace(ns);
        }

        let sysfs = SysfsTree::new().unwrap();
        sysfs.add_pf(PF_PCI, PF_NETDEV, "5c6f69fffe000001").unwrap();
        for index in 0..4 {
            sysfs
                .add_vf(PF_PCI, index, &vf_pci(index), &vf_netdev(index), &vf_rep(index))
                .unwrap();
            host.add_device_link(&vf_netdev(index), &vf_pci(index));
        }

        let mut config = ForwarderConfig {
            egress_ip: Some(EGRESS_IP.to_string()),
            physical_functions: vec![PF_NETDEV.to_string()],
            sysfs_root: sysfs.root().to_path_buf(),
            metrics_enabled: true,
            retry: RetryConfig {
                port_id_attempts: 5,
                port_id_delay_ms: 1,
                representor_attempts: 3,
                representor_delay_ms: 1,
            },
            ..Default::default()
        };
        customize(&mut config);

        let prims = Primitives {
            netns: Arc::new(host.clone()),
            links: Arc::new(host.clone()),
            switch: Arc::new(switch.clone()),
        };
        let monitor = Arc::new(RecordingMonitor::default());
        let forwarder = Forwarder::new(config, prims)
            .unwrap()
            .with_monitor(monitor.clone());
        forwarder.init().await.unwrap();

        Self {
            host,
            switch,
            sysfs,
            monitor,
            forwarder,
        }
    }
}

pub fn ip_context() -> IpContext {
    IpContext {
        src_ip_addr: Some("172.16.1.1/30".to_string()),
        dst_ip_addr: Some("172.16.1.2/30".to_string()),
        src_routes: vec![Route {
            prefix: "192.168.10.0/24".to_string(),
        }],
        dst_routes: vec![Route {
            prefix: "192.168.20.0/24".to_string(),
        }],
        ip_neighbors: Vec::new(),
    }
}

/// Kernel endpoint backed by a veth pair.
pub fn kernel_endpoint(netns: &str, ifname: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(MechanismKind::LocalKernel)
        .with_param(PARAM_NETNS_INODE, netns)
        .with_param(PARAM_INTERFACE_NAME, ifname)
        .with_ip_context(ip_context())
}

/// Kernel endpoint backed by one of `candidates`.
pub fn vf_endpoint(netns: &str, ifname: &str, candidates: &[String]) -> EndpointDescriptor {
    kernel_endpoint(netns, ifname).with_param(PARAM_PCI_ADDRESSES, candidates.join(","))
}

/// Tunnel endpoint.
pub fn tunnel_endpoint(src_ip: &str, dst_ip: &str, vni: u32) -> EndpointDescriptor {
    EndpointDescriptor::new(MechanismKind::RemoteTunnel)
        .with_param(PARAM_SRC_IP, src_ip)
        .with_param(PARAM_DST_IP, dst_ip)
        .with_param(PARAM_VNI, vni.to_string())
}

pub fn request(
    id: &str,
    source: EndpointDescriptor,
    destination: EndpointDescriptor,
) -> CrossConnectRequest {
    CrossConnectRequest {
        id: id.to_string(),
        source,
        destination,
        connect: true,
    }
}

/// Local veth-to-veth request between two namespaces.
pub fn local_request(id: &str, src_ns: &str, dst_ns: &str) -> CrossConnectRequest {
    request(
        id,
        kernel_endpoint(src_ns, "nsm0"),
        kernel_endpoint(dst_ns, "nsm0"),
    )
}

/// Peer → local destination in `netns`.
pub fn incoming_request(id: &str, netns: &str, vni: u32) -> CrossConnectRequest {
    request(
        id,
        tunnel_endpoint(PEER_IP, EGRESS_IP, vni),
        kernel_endpoint(netns, "nsm0"),
    )
}

/// Local source in `netns` → peer.
pub fn outgoing_request(id: &str, netns: &str, vni: u32) -> CrossConnectRequest {
    request(
        id,
        kernel_endpoint(netns, "nsm0"),
        tunnel_endpoint(EGRESS_IP, PEER_IP, vni),
    )
}
