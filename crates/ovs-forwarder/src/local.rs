//! Cross-connects with both endpoints on this host.
//!
//! Each side gets either a VF from the device pool or a veth pair whose
//! switch end is named after the side and the connection id. The two switch
//! ports are joined by a pair of symmetric flows.

use nsm_fwd_common::{Flow, FwdResult};
use tracing::info;

use crate::device_pool::AllocationKey;
use crate::forwarder::{teardown_config, Endpoint, Forwarder};
use crate::types::{CrossConnectRequest, DeviceMap, MonitorDevice, Side};

/// Switch-side veth name of a local endpoint.
pub fn local_port_name(side: Side, id: &str) -> String {
    format!("{}{}", side.port_prefix(), id)
}

impl Forwarder {
    pub(crate) async fn connect_local(&self, req: &CrossConnectRequest) -> FwdResult<DeviceMap> {
        let mut devices = DeviceMap::new();
        let src_port = self.setup_local_side(req, Side::Source, &mut devices).await?;
        let dst_port = self
            .setup_local_side(req, Side::Destination, &mut devices)
            .await?;

        let ports = self.state().ports();
        let src = ports.bind(&src_port).await?;
        let dst = ports.bind(&dst_port).await?;
        ports
            .install(&[Flow::forward(src, dst), Flow::forward(dst, src)])
            .await?;

        info!(conn_id = %req.id, src_port = %src_port, dst_port = %dst_port, "Local connection established");
        Ok(devices)
    }

    async fn setup_local_side(
        &self,
        req: &CrossConnectRequest,
        side: Side,
        devices: &mut DeviceMap,
    ) -> FwdResult<String> {
        let ep = req.endpoint(side);
        let cfg = ep.link_config(side)?;
        let key = AllocationKey::new(&req.id, side.into());
        let port = self
            .setup_endpoint(key, side, ep, &cfg, local_port_name(side, &req.id))
            .await?;
        devices.insert(
            cfg.netns,
            MonitorDevice {
                name: cfg.ifname,
                xcon_name: side.xcon_name(&req.id),
            },
        );
        Ok(port)
    }

    /// Removes flows and ports first, then returns both interfaces and
    /// frees their devices.
    pub(crate) async fn close_local(&self, req: &CrossConnectRequest) -> DeviceMap {
        let fallback = [Side::Source, Side::Destination]
            .into_iter()
            .map(|side| Endpoint {
                key: AllocationKey::new(&req.id, side.into()),
                side,
                veth_port: local_port_name(side, &req.id),
                link: teardown_config(req, side),
            })
            .collect();
        let devices = self.teardown(&req.id, fallback).await;
        info!(conn_id = %req.id, "Local connection removed");
        devices
    }
}
