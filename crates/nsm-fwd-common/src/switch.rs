//! Switch-control primitives: bridges, ports and OpenFlow rules.

use std::fmt;

use async_trait::async_trait;

use crate::error::{FwdError, FwdResult};
use crate::shell::{self, shellquote, OVS_OFCTL_CMD, OVS_VSCTL_CMD};

/// Priority used for all cross-connect flows.
pub const FLOW_PRIORITY: u16 = 100;

/// A flow action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Set the tunnel key (VNI) of the packet.
    SetTunnelId(u32),
    /// Send to a switch port.
    Output(u32),
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAction::SetTunnelId(vni) => write!(f, "set_field:{}->tun_id", vni),
            FlowAction::Output(port) => write!(f, "output:{}", port),
        }
    }
}

/// Match part of a flow: ingress port and, for tunnel traffic, the VNI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: u32,
    pub tun_id: Option<u32>,
}

impl FlowMatch {
    /// Matches everything arriving on `port`.
    pub fn in_port(port: u32) -> Self {
        Self {
            in_port: port,
            tun_id: None,
        }
    }

    /// Matches traffic arriving on tunnel `port` with key `vni`.
    pub fn tunnel(port: u32, vni: u32) -> Self {
        Self {
            in_port: port,
            tun_id: Some(vni),
        }
    }

    /// Returns true if this match is at least as specific as `filter`.
    ///
    /// Deleting by `in_port=N` removes every flow on that port, including
    /// ones that also match a tunnel id.
    pub fn covered_by(&self, filter: &FlowMatch) -> bool {
        self.in_port == filter.in_port
            && match filter.tun_id {
                None => true,
                Some(vni) => self.tun_id == Some(vni),
            }
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in_port={}", self.in_port)?;
        if let Some(vni) = self.tun_id {
            write!(f, ",tun_id={}", vni)?;
        }
        Ok(())
    }
}

/// A complete flow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub priority: u16,
    pub matches: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl Flow {
    /// `in_port=from, actions=output:to`
    pub fn forward(from: u32, to: u32) -> Self {
        Self {
            priority: FLOW_PRIORITY,
            matches: FlowMatch::in_port(from),
            actions: vec![FlowAction::Output(to)],
        }
    }

    /// Local port into a tunnel: tag with `vni` and output to `tunnel`.
    pub fn encap(local: u32, tunnel: u32, vni: u32) -> Self {
        Self {
            priority: FLOW_PRIORITY,
            matches: FlowMatch::in_port(local),
            actions: vec![FlowAction::SetTunnelId(vni), FlowAction::Output(tunnel)],
        }
    }

    /// Tunnel traffic with `vni` out to the local port.
    pub fn decap(tunnel: u32, vni: u32, local: u32) -> Self {
        Self {
            priority: FLOW_PRIORITY,
            matches: FlowMatch::tunnel(tunnel, vni),
            actions: vec![FlowAction::Output(local)],
        }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={},{},actions=", self.priority, self.matches)?;
        for (i, action) in self.actions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", action)?;
        }
        Ok(())
    }
}

/// Endpoints of a VXLAN tunnel port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_ip: String,
    pub remote_ip: String,
}

/// Switch primitives.
#[async_trait]
pub trait SwitchOps: Send + Sync {
    /// Creates a bridge if it does not exist.
    async fn add_bridge(&self, bridge: &str) -> FwdResult<()>;

    /// Deletes a bridge if it exists.
    async fn delete_bridge(&self, bridge: &str) -> FwdResult<()>;

    /// Attaches an existing link to the bridge. Idempotent.
    async fn add_port(&self, bridge: &str, port: &str) -> FwdResult<()>;

    /// Creates a VXLAN port with a flow-based key. Idempotent.
    async fn add_tunnel_port(&self, bridge: &str, port: &str, tunnel: &TunnelSpec)
        -> FwdResult<()>;

    /// Detaches a port from the bridge.
    async fn delete_port(&self, bridge: &str, port: &str) -> FwdResult<()>;

    /// Returns the OpenFlow port number, or 0 while it is not assigned yet.
    async fn port_id(&self, port: &str) -> FwdResult<u32>;

    /// Installs a flow.
    async fn add_flow(&self, bridge: &str, flow: &Flow) -> FwdResult<()>;

    /// Deletes flows covered by `filter`, or every flow when `None`.
    async fn delete_flows(&self, bridge: &str, filter: Option<&FlowMatch>) -> FwdResult<()>;

    /// Lists the names of all interfaces known to the switch.
    async fn list_ports(&self) -> FwdResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// ovs-vsctl / ovs-ofctl command builders
// ---------------------------------------------------------------------------

/// Build bridge creation command
pub fn build_add_bridge_cmd(bridge: &str) -> String {
    format!("{} --may-exist add-br {}", OVS_VSCTL_CMD, shellquote(bridge))
}

/// Build bridge deletion command
pub fn build_del_bridge_cmd(bridge: &str) -> String {
    format!("{} --if-exists del-br {}", OVS_VSCTL_CMD, shellquote(bridge))
}

/// Build port attach command
pub fn build_add_port_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} --may-exist add-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build VXLAN port creation command
pub fn build_add_tunnel_port_cmd(bridge: &str, port: &str, tunnel: &TunnelSpec) -> String {
    format!(
        "{} -- --may-exist add-port {} {} -- set interface {} type=vxlan \
         options:local_ip={} options:remote_ip={} options:key=flow",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port),
        shellquote(port),
        shellquote(&tunnel.local_ip),
        shellquote(&tunnel.remote_ip)
    )
}

/// Build port detach command
pub fn build_del_port_cmd(bridge: &str, port: &str) -> String {
    format!(
        "{} del-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port)
    )
}

/// Build OpenFlow port number query
pub fn build_get_ofport_cmd(port: &str) -> String {
    format!(
        "{} --if-exists get interface {} ofport",
        OVS_VSCTL_CMD,
        shellquote(port)
    )
}

/// Build flow add command
pub fn build_add_flow_cmd(bridge: &str, flow: &Flow) -> String {
    format!(
        "{} add-flow {} {}",
        OVS_OFCTL_CMD,
        shellquote(bridge),
        shellquote(&flow.to_string())
    )
}

/// Build flow delete command
pub fn build_del_flows_cmd(bridge: &str, filter: Option<&FlowMatch>) -> String {
    match filter {
        Some(m) => format!(
            "{} del-flows {} {}",
            OVS_OFCTL_CMD,
            shellquote(bridge),
            shellquote(&m.to_string())
        ),
        None => format!("{} del-flows {}", OVS_OFCTL_CMD, shellquote(bridge)),
    }
}

/// Build interface name listing command
pub fn build_list_ports_cmd() -> String {
    format!("{} --bare --columns=name list Interface", OVS_VSCTL_CMD)
}

/// Parses `ofport` output. Empty, `[]` and negative values mean "not
/// assigned" and become 0.
pub fn parse_ofport(output: &str) -> u32 {
    output.trim().parse::<u32>().unwrap_or(0)
}

/// Parses `--bare --columns=name` output into interface names.
pub fn parse_port_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|l| l.trim().trim_matches('"'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// [`SwitchOps`] backed by `ovs-vsctl` and `ovs-ofctl`.
#[derive(Debug, Clone, Default)]
pub struct OvsSwitch;

impl OvsSwitch {
    /// Creates the switch driver.
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, operation: &str, cmd: &str) -> FwdResult<String> {
        shell::exec_or_throw(cmd).await.map_err(|e| match e {
            FwdError::ShellCommandFailed { output, .. } => FwdError::switch(operation, output),
            other => other,
        })
    }
}

#[async_trait]
impl SwitchOps for OvsSwitch {
    async fn add_bridge(&self, bridge: &str) -> FwdResult<()> {
        self.run("add-br", &build_add_bridge_cmd(bridge)).await?;
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> FwdResult<()> {
        self.run("del-br", &build_del_bridge_cmd(bridge)).await?;
        Ok(())
    }

    async fn add_port(&self, bridge: &str, port: &str) -> FwdResult<()> {
        self.run("add-port", &build_add_port_cmd(bridge, port))
            .await?;
        Ok(())
    }

    async fn add_tunnel_port(
        &self,
        bridge: &str,
        port: &str,
        tunnel: &TunnelSpec,
    ) -> FwdResult<()> {
        self.run(
            "add-tunnel-port",
            &build_add_tunnel_port_cmd(bridge, port, tunnel),
        )
        .await?;
        Ok(())
    }

    async fn delete_port(&self, bridge: &str, port: &str) -> FwdResult<()> {
        self.run("del-port", &build_del_port_cmd(bridge, port))
            .await?;
        Ok(())
    }

    async fn port_id(&self, port: &str) -> FwdResult<u32> {
        let out = self.run("get-ofport", &build_get_ofport_cmd(port)).await?;
        Ok(parse_ofport(&out))
    }

    async fn add_flow(&self, bridge: &str, flow: &Flow) -> FwdResult<()> {
        self.run("add-flow", &build_add_flow_cmd(bridge, flow))
            .await?;
        Ok(())
    }

    async fn delete_flows(&self, bridge: &str, filter: Option<&FlowMatch>) -> FwdResult<()> {
        self.run("del-flows", &build_del_flows_cmd(bridge, filter))
            .await?;
        Ok(())
    }

    async fn list_ports(&self) -> FwdResult<Vec<String>> {
        let out = self.run("list-interfaces", &build_list_ports_cmd()).await?;
        Ok(parse_port_names(&out))
    }
}
