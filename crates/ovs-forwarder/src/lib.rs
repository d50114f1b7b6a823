//! OVS Forwarder - cross-connect controller for the network service mesh
//!
//! The forwarder wires pairs of endpoints through an Open vSwitch bridge:
//! - Local connections: two container interfaces on this host, each backed
//!   by a veth pair or an SR-IOV VF, joined by symmetric flows
//! - Remote connections: one container interface joined to a VXLAN tunnel
//!   port shared by all connections to the same peer
//! - Teardown driven by allocation records rather than by the close request
//! - SR-IOV device pool with sysfs representor discovery

pub mod config;
pub mod device_pool;
pub mod forwarder;
pub mod ifaces;
pub mod local;
pub mod monitor;
pub mod port_binding;
pub mod remote;
pub mod sriov;
pub mod tables;
pub mod tunnel;
pub mod types;
pub mod vf;

pub use config::{ForwarderConfig, RetryConfig};
pub use device_pool::{Allocation, AllocationKey, DevicePool};
pub use forwarder::{ConnState, Forwarder, ForwarderState, Primitives};
pub use monitor::{MonitorSink, TracingMonitor};
pub use types::{
    ConnectionKind, CrossConnectRequest, DeviceMap, EndpointDescriptor, IpContext, MechanismKind,
    Mechanisms, MonitorDevice, Neighbor, Role, Route, Side,
};
