//! Parameter keys, port name prefixes and other fixed names

/// Mechanism parameter: inode of the endpoint's network namespace
pub const PARAM_NETNS_INODE: &str = "netnsInode";

/// Mechanism parameter: interface name inside the namespace
pub const PARAM_INTERFACE_NAME: &str = "name";

/// Mechanism parameter: fallback interface name
pub const PARAM_WORKSPACE: &str = "workspace";

/// Mechanism parameter: comma-separated candidate PCI addresses
pub const PARAM_PCI_ADDRESSES: &str = "pci_addresses";

/// Tunnel parameter: source endpoint IP
pub const PARAM_SRC_IP: &str = "src_ip";

/// Tunnel parameter: destination endpoint IP
pub const PARAM_DST_IP: &str = "dst_ip";

/// Tunnel parameter: VXLAN network identifier
pub const PARAM_VNI: &str = "vni";

/// Switch-side veth name prefix, local source
pub const SRC_PORT_PREFIX: &str = "tapsrc";

/// Switch-side veth name prefix, local destination
pub const DST_PORT_PREFIX: &str = "tapdst";

/// Switch-side veth name prefix, local side of a remote connection
pub const REMOTE_PORT_PREFIX: &str = "tap_";

/// Monitoring name prefix, source side
pub const SRC_XCON_PREFIX: &str = "SRC-";

/// Monitoring name prefix, destination side
pub const DST_XCON_PREFIX: &str = "DST-";

/// Tunnel port name prefix; the peer IP without separators follows
pub const TUNNEL_PORT_PREFIX: &str = "v";

/// Default integration bridge
pub const DEFAULT_BRIDGE: &str = "br-nsm";

/// MTU of veth pairs created for kernel interfaces
pub const VETH_MTU: u32 = 16000;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nsm/ovs-forwarder.toml";
