//! Cross-connect request types and the values derived from them.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use nsm_fwd_common::{FwdError, FwdResult};
use serde::{Deserialize, Serialize};

use crate::tables::*;

/// Mechanism of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MechanismKind {
    /// A kernel interface inside a namespace on this host.
    LocalKernel,
    /// The far side of a VXLAN tunnel.
    RemoteTunnel,
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MechanismKind::LocalKernel => write!(f, "local-kernel"),
            MechanismKind::RemoteTunnel => write!(f, "remote-tunnel"),
        }
    }
}

/// A route to install through the endpoint interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
}

/// A static neighbor entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub ip: String,
    pub hardware_address: String,
}

/// Addresses, routes and neighbors of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpContext {
    pub src_ip_addr: Option<String>,
    pub dst_ip_addr: Option<String>,
    pub src_routes: Vec<Route>,
    pub dst_routes: Vec<Route>,
    pub ip_neighbors: Vec<Neighbor>,
}

/// One side of a cross-connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub mechanism: MechanismKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_context: IpContext,
    #[serde(default)]
    pub remote: bool,
}

/// Which side of the cross-connect an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    /// Prefix of the switch-side veth name for a local connection.
    pub fn port_prefix(self) -> &'static str {
        match self {
            Side::Source => SRC_PORT_PREFIX,
            Side::Destination => DST_PORT_PREFIX,
        }
    }

    /// Monitoring name of this side for connection `id`.
    pub fn xcon_name(self, id: &str) -> String {
        match self {
            Side::Source => format!("{}{}", SRC_XCON_PREFIX, id),
            Side::Destination => format!("{}{}", DST_XCON_PREFIX, id),
        }
    }
}

/// Owner role of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Destination,
    Remote,
}

impl Role {
    /// Short key used in logs.
    pub fn key(self) -> &'static str {
        match self {
            Role::Source => "src",
            Role::Destination => "dst",
            Role::Remote => "rem",
        }
    }
}

impl From<Side> for Role {
    fn from(side: Side) -> Self {
        match side {
            Side::Source => Role::Source,
            Side::Destination => Role::Destination,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// How a cross-connect is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// Both endpoints on this host.
    Local,
    /// Remote source, local destination.
    Incoming,
    /// Local source, remote destination.
    Outgoing,
}

impl ConnectionKind {
    /// The side that is on this host, for remote connections.
    pub fn local_side(self) -> Side {
        match self {
            ConnectionKind::Incoming => Side::Destination,
            ConnectionKind::Local | ConnectionKind::Outgoing => Side::Source,
        }
    }
}

/// Tunnel parameters of a remote endpoint, resolved for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub local_ip: Option<IpAddr>,
    pub remote_ip: IpAddr,
    pub vni: u32,
}

/// Interface configuration for the local end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub netns: String,
    pub ifname: String,
    pub ip: Option<String>,
    pub routes: Vec<String>,
    pub neighbors: Vec<(String, String)>,
}

/// Device reported to monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorDevice {
    pub name: String,
    pub xcon_name: String,
}

/// Namespace inode → device.
pub type DeviceMap = BTreeMap<String, MonitorDevice>;

/// Mechanisms the forwarder accepts, as advertised to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanisms {
    pub local: Vec<EndpointDescriptor>,
    pub remote: Vec<EndpointDescriptor>,
}

/// A request to connect or disconnect two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossConnectRequest {
    pub id: String,
    pub source: EndpointDescriptor,
    pub destination: EndpointDescriptor,
    #[serde(default = "default_connect")]
    pub connect: bool,
}

fn default_connect() -> bool {
    true
}

fn parse_ip(raw: &str, what: &str) -> FwdResult<IpAddr> {
    raw.trim()
        .parse()
        .map_err(|_| FwdError::invalid_request(format!("{} '{}' is not an IP address", what, raw)))
}

impl EndpointDescriptor {
    /// Creates an endpoint with no parameters.
    pub fn new(mechanism: MechanismKind) -> Self {
        Self {
            mechanism,
            parameters: BTreeMap::new(),
            ip_context: IpContext::default(),
            remote: mechanism == MechanismKind::RemoteTunnel,
        }
    }

    /// Adds a mechanism parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Replaces the IP context.
    pub fn with_ip_context(mut self, ctx: IpContext) -> Self {
        self.ip_context = ctx;
        self
    }

    /// Returns true for the tunnel side of a remote connection.
    pub fn is_remote(&self) -> bool {
        self.mechanism == MechanismKind::RemoteTunnel
    }

    fn param(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Namespace inode of a local endpoint.
    pub fn netns_inode(&self) -> FwdResult<&str> {
        self.param(PARAM_NETNS_INODE).ok_or_else(|| {
            FwdError::invalid_request(format!("missing parameter '{}'", PARAM_NETNS_INODE))
        })
    }

    /// Interface name, falling back to the workspace name.
    pub fn interface_name(&self) -> FwdResult<&str> {
        self.param(PARAM_INTERFACE_NAME)
            .or_else(|| self.param(PARAM_WORKSPACE))
            .ok_or_else(|| {
                FwdError::invalid_request(format!(
                    "missing parameter '{}' or '{}'",
                    PARAM_INTERFACE_NAME, PARAM_WORKSPACE
                ))
            })
    }

    /// Candidate PCI devices, or `None` for a pure veth endpoint.
    pub fn device_candidates(&self) -> FwdResult<Option<Vec<String>>> {
        let Some(raw) = self.parameters.get(PARAM_PCI_ADDRESSES) else {
            return Ok(None);
        };
        let candidates: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if candidates.is_empty() {
            return Err(FwdError::invalid_request(format!(
                "parameter '{}' has no device",
                PARAM_PCI_ADDRESSES
            )));
        }
        Ok(Some(candidates))
    }

    /// Tunnel parameters seen from this host.
    ///
    /// For an incoming connection the tunnel's destination is us; for an
    /// outgoing one its source is.
    pub fn tunnel_params(&self, kind: ConnectionKind) -> FwdResult<TunnelParams> {
        let required = |key: &str| {
            self.param(key).ok_or_else(|| {
                FwdError::invalid_request(format!("missing tunnel parameter '{}'", key))
            })
        };
        let vni_raw = required(PARAM_VNI)?;
        let vni: u32 = vni_raw
            .parse()
            .ok()
            .filter(|v| *v < 1 << 24)
            .ok_or_else(|| FwdError::invalid_request(format!("invalid VNI '{}'", vni_raw)))?;

        let (local_key, remote_key) = match kind {
            ConnectionKind::Incoming => (PARAM_DST_IP, PARAM_SRC_IP),
            ConnectionKind::Outgoing | ConnectionKind::Local => (PARAM_SRC_IP, PARAM_DST_IP),
        };
        let remote_ip = parse_ip(required(remote_key)?, remote_key)?;
        let local_ip = self
            .param(local_key)
            .map(|raw| parse_ip(raw, local_key))
            .transpose()?;
        Ok(TunnelParams {
            local_ip,
            remote_ip,
            vni,
        })
    }

    /// Interface configuration for this endpoint acting as `side`.
    ///
    /// The source interface gets the source address and routes towards the
    /// destination, and vice versa.
    pub fn link_config(&self, side: Side) -> FwdResult<LinkConfig> {
        let ctx = &self.ip_context;
        let (ip, routes) = match side {
            Side::Source => (&ctx.src_ip_addr, &ctx.dst_routes),
            Side::Destination => (&ctx.dst_ip_addr, &ctx.src_routes),
        };
        Ok(LinkConfig {
            netns: self.netns_inode()?.to_string(),
            ifname: self.interface_name()?.to_string(),
            ip: ip.as_ref().filter(|ip| !ip.is_empty()).cloned(),
            routes: routes.iter().map(|r| r.prefix.clone()).collect(),
            neighbors: ctx
                .ip_neighbors
                .iter()
                .map(|n| (n.ip.clone(), n.hardware_address.clone()))
                .collect(),
        })
    }

    fn validate_local(&self, what: &str) -> FwdResult<()> {
        self.netns_inode()
            .and_then(|_| self.interface_name())
            .and_then(|_| self.device_candidates())
            .map(|_| ())
            .map_err(|e| match e {
                FwdError::InvalidRequest { message } => {
                    FwdError::invalid_request(format!("{}: {}", what, message))
                }
                other => other,
            })
    }
}

impl CrossConnectRequest {
    /// Returns the endpoint on `side`.
    pub fn endpoint(&self, side: Side) -> &EndpointDescriptor {
        match side {
            Side::Source => &self.source,
            Side::Destination => &self.destination,
        }
    }

    /// Classifies the request by its endpoint mechanisms.
    pub fn classify(&self) -> FwdResult<ConnectionKind> {
        for (what, ep) in [("source", &self.source), ("destination", &self.destination)] {
            if ep.remote != ep.is_remote() {
                return Err(FwdError::invalid_request(format!(
                    "{} is flagged {} but uses mechanism {}",
                    what,
                    if ep.remote { "remote" } else { "local" },
                    ep.mechanism
                )));
            }
        }
        match (self.source.is_remote(), self.destination.is_remote()) {
            (false, false) => Ok(ConnectionKind::Local),
            (true, false) => Ok(ConnectionKind::Incoming),
            (false, true) => Ok(ConnectionKind::Outgoing),
            (true, true) => Err(FwdError::invalid_request(
                "both endpoints are remote; exactly one may be",
            )),
        }
    }

    /// Checks that everything the wiring needs is present and well formed.
    pub fn validate(&self) -> FwdResult<ConnectionKind> {
        if self.id.trim().is_empty() {
            return Err(FwdError::invalid_request("connection id is empty"));
        }
        let kind = self.classify()?;
        match kind {
            ConnectionKind::Local => {
                self.source.validate_local("source")?;
                self.destination.validate_local("destination")?;
            }
            ConnectionKind::Incoming => {
                self.destination.validate_local("destination")?;
                self.source.tunnel_params(kind)?;
            }
            ConnectionKind::Outgoing => {
                self.source.validate_local("source")?;
                self.destination.tunnel_params(kind)?;
            }
        }
        Ok(kind)
    }

    /// The remote endpoint of a remote connection.
    pub fn remote_endpoint(&self, kind: ConnectionKind) -> &EndpointDescriptor {
        match kind {
            ConnectionKind::Incoming => &self.source,
            ConnectionKind::Local | ConnectionKind::Outgoing => &self.destination,
        }
    }
}
