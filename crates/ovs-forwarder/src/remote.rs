//! Cross-connects with one endpoint behind a VXLAN tunnel.
//!
//! The local side is the destination of an incoming connection and the
//! source of an outgoing one. Its switch port is joined to the tunnel port
//! of the peer by an encap flow and a decap flow keyed on the VNI.

use nsm_fwd_common::{Flow, FwdError, FwdResult};
use tracing::info;

use crate::device_pool::AllocationKey;
use crate::forwarder::{teardown_config, Endpoint, Forwarder};
use crate::tables::REMOTE_PORT_PREFIX;
use crate::types::{ConnectionKind, CrossConnectRequest, DeviceMap, MonitorDevice, Role};

/// Switch-side veth name of the local endpoint of a remote connection.
pub fn remote_port_name(id: &str) -> String {
    format!("{}{}", REMOTE_PORT_PREFIX, id)
}

impl Forwarder {
    pub(crate) async fn connect_remote(
        &self,
        req: &CrossConnectRequest,
        kind: ConnectionKind,
    ) -> FwdResult<DeviceMap> {
        let side = kind.local_side();
        let ep = req.endpoint(side);
        let cfg = ep.link_config(side)?;
        let tunnel = req.remote_endpoint(kind).tunnel_params(kind)?;
        let local_ip = tunnel
            .local_ip
            .or_else(|| self.config().egress_addr())
            .ok_or_else(|| {
                FwdError::invalid_request("no local tunnel address in request or configuration")
            })?;

        let key = AllocationKey::new(&req.id, Role::Remote);
        let port = self
            .setup_endpoint(key, side, ep, &cfg, remote_port_name(&req.id))
            .await?;

        let ports = self.state().ports();
        let tunnel_port = self
            .state()
            .tunnels()
            .acquire(ports, &req.id, local_ip, tunnel.remote_ip, tunnel.vni)
            .await?;
        let local = ports.bind(&port).await?;
        let tun = ports.lookup(&tunnel_port).await?;
        ports
            .install(&[
                Flow::encap(local, tun, tunnel.vni),
                Flow::decap(tun, tunnel.vni, local),
            ])
            .await?;

        info!(conn_id = %req.id, port = %port, tunnel = %tunnel_port, vni = tunnel.vni,
            "Remote connection established");
        let mut devices = DeviceMap::new();
        devices.insert(
            cfg.netns,
            MonitorDevice {
                name: cfg.ifname,
                xcon_name: side.xcon_name(&req.id),
            },
        );
        Ok(devices)
    }

    /// Removes this connection's tunnel flows, the local port and interface,
    /// then drops the tunnel reference and frees the device.
    ///
    /// The tunnel side comes from what the connect recorded, so a close
    /// request with a bare tunnel endpoint still releases it.
    pub(crate) async fn close_remote(
        &self,
        req: &CrossConnectRequest,
        kind: ConnectionKind,
    ) -> DeviceMap {
        let side = kind.local_side();
        let fallback = vec![Endpoint {
            key: AllocationKey::new(&req.id, Role::Remote),
            side,
            veth_port: remote_port_name(&req.id),
            link: teardown_config(req, side),
        }];
        let devices = self.teardown(&req.id, fallback).await;
        info!(conn_id = %req.id, "Remote connection removed");
        devices
    }
}
