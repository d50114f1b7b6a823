//! Remote cross-connect scenarios: a local endpoint joined to a VXLAN peer.

mod common;

use std::net::IpAddr;

use common::*;
use nsm_fwd_common::{Flow, FlowMatch, FwdError, TunnelSpec};
use nsm_fwd_test::{HostVerifier, SwitchVerifier, HOST_NS};
use ovs_forwarder::tables::PARAM_SRC_IP;
use ovs_forwarder::tunnel::tunnel_port_name;
use ovs_forwarder::{EndpointDescriptor, MechanismKind, Role};
use pretty_assertions::assert_eq;

fn peer() -> IpAddr {
    PEER_IP.parse().unwrap()
}

#[tokio::test]
async fn test_tunnel_shared_by_connections_to_one_peer() {
    let env = TestEnv::new().await;
    let tunnel = tunnel_port_name(&peer());
    assert_eq!(tunnel, "v10005");

    let first = env
        .forwarder
        .request(&incoming_request("1", NS_A, 42))
        .await
        .unwrap();
    let second = env
        .forwarder
        .request(&incoming_request("2", NS_B, 43))
        .await
        .unwrap();

    assert_eq!(first.get(NS_A).unwrap().xcon_name, "DST-1");
    assert_eq!(second.get(NS_B).unwrap().xcon_name, "DST-2");
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(2));
    assert_eq!(env.forwarder.tunnel_count().await, 1);
    assert_eq!(env.switch.call_count("add_tunnel_port"), 1);
    assert_eq!(
        env.switch.port(&tunnel).unwrap().tunnel,
        Some(TunnelSpec {
            local_ip: EGRESS_IP.to_string(),
            remote_ip: PEER_IP.to_string(),
        })
    );

    // The destination gets the destination address.
    let host = HostVerifier::new(&env.host);
    host.assert_link_up(HOST_NS, "tap_1").unwrap();
    host.assert_address(NS_A, "nsm0", "172.16.1.2/30").unwrap();

    let switch = SwitchVerifier::new(&env.switch, BRIDGE);
    let tun = switch.assert_port(&tunnel).unwrap();
    let local1 = switch.assert_port("tap_1").unwrap();
    let local2 = switch.assert_port("tap_2").unwrap();
    switch.assert_flow(&Flow::encap(local1, tun, 42)).unwrap();
    switch.assert_flow(&Flow::decap(tun, 42, local1)).unwrap();
    switch.assert_flow(&Flow::encap(local2, tun, 43)).unwrap();
    switch.assert_flow(&Flow::decap(tun, 43, local2)).unwrap();

    // Closing one connection keeps the tunnel and the other's flows.
    let closed = env
        .forwarder
        .close(&incoming_request("1", NS_A, 42))
        .await
        .unwrap();
    assert_eq!(closed, first);
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(1));
    switch.assert_port(&tunnel).unwrap();
    switch.assert_no_port("tap_1").unwrap();
    switch.assert_no_flows(&FlowMatch::tunnel(tun, 42)).unwrap();
    switch.assert_no_flows(&FlowMatch::in_port(local1)).unwrap();
    switch.assert_flow(&Flow::encap(local2, tun, 43)).unwrap();
    switch.assert_flow(&Flow::decap(tun, 43, local2)).unwrap();
    host.assert_no_link(HOST_NS, "tap_1").unwrap();
    host.assert_no_link(NS_A, "nsm0").unwrap();

    // The last reference removes the tunnel port.
    env.forwarder
        .close(&incoming_request("2", NS_B, 43))
        .await
        .unwrap();
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, None);
    assert_eq!(env.forwarder.tunnel_count().await, 0);
    switch.assert_no_port(&tunnel).unwrap();
    assert!(env.switch.flows(BRIDGE).is_empty());
}

#[tokio::test]
async fn test_outgoing_connection() {
    let env = TestEnv::new().await;
    let req = outgoing_request("7", NS_C, 100);

    let devices = env.forwarder.request(&req).await.unwrap();
    assert_eq!(devices.get(NS_C).unwrap().xcon_name, "SRC-7");
    HostVerifier::new(&env.host)
        .assert_address(NS_C, "nsm0", "172.16.1.1/30")
        .unwrap();

    let switch = SwitchVerifier::new(&env.switch, BRIDGE);
    let tun = switch.assert_port(&tunnel_port_name(&peer())).unwrap();
    let local = switch.assert_port("tap_7").unwrap();
    switch.assert_flow(&Flow::encap(local, tun, 100)).unwrap();
    switch.assert_flow(&Flow::decap(tun, 100, local)).unwrap();

    env.forwarder.close(&req).await.unwrap();
    assert_eq!(env.forwarder.tunnel_count().await, 0);
    assert!(env.switch.port_names().is_empty());
}

#[tokio::test]
async fn test_outgoing_uses_configured_egress_address() {
    let env = TestEnv::new().await;
    let mut req = outgoing_request("1", NS_A, 42);
    req.destination.parameters.remove(PARAM_SRC_IP);

    env.forwarder.request(&req).await.unwrap();
    let tunnel = env.switch.port(&tunnel_port_name(&peer())).unwrap().tunnel;
    assert_eq!(tunnel.unwrap().local_ip, EGRESS_IP);
}

#[tokio::test]
async fn test_no_local_tunnel_address() {
    let env = TestEnv::with_config(|c| c.egress_ip = None).await;
    let mut req = outgoing_request("1", NS_A, 42);
    req.destination.parameters.remove(PARAM_SRC_IP);

    assert!(matches!(
        env.forwarder.request(&req).await,
        Err(FwdError::InvalidRequest { .. })
    ));
    assert_eq!(env.forwarder.connection_state("1"), None);
    assert!(env.host.links_in(HOST_NS).iter().all(|l| !l.starts_with("tap")));
    assert_eq!(env.switch.call_count("add_port"), 0);
}

#[tokio::test]
async fn test_incoming_to_vf_binds_representor() {
    let env = TestEnv::new().await;
    let req = request(
        "1",
        tunnel_endpoint(PEER_IP, EGRESS_IP, 42),
        vf_endpoint(NS_A, "nsm0", &[vf_pci(0), vf_pci(1)]),
    );

    env.forwarder.request(&req).await.unwrap();
    assert_eq!(env.forwarder.allocation("1", Role::Remote).await, Some(vf_pci(0)));
    assert_eq!(env.host.device_link(&vf_pci(0)).unwrap().netns, NS_A);

    let switch = SwitchVerifier::new(&env.switch, BRIDGE);
    let rep = switch.assert_port(&vf_rep(0)).unwrap();
    let tun = switch.assert_port(&tunnel_port_name(&peer())).unwrap();
    switch.assert_flow(&Flow::encap(rep, tun, 42)).unwrap();
    switch.assert_no_port("tap_1").unwrap();

    env.forwarder.close(&req).await.unwrap();
    assert_eq!(env.forwarder.allocation("1", Role::Remote).await, None);
    assert_eq!(env.forwarder.device_in_use(&vf_pci(0)).await, Some(false));
    assert_eq!(env.host.device_link(&vf_pci(0)).unwrap().name, vf_netdev(0));
    switch.assert_no_port(&vf_rep(0)).unwrap();
}

#[tokio::test]
async fn test_failed_tunnel_removal_keeps_reference() {
    let env = TestEnv::new().await;
    let req = incoming_request("1", NS_A, 42);
    env.forwarder.request(&req).await.unwrap();

    env.switch.fail_operation("delete_port");
    env.forwarder.close(&req).await.unwrap();
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(1));
    assert_eq!(env.forwarder.connection_state("1"), None);
}

#[tokio::test]
async fn test_failed_tunnel_creation() {
    let env = TestEnv::new().await;
    env.switch.fail_operation("add_tunnel_port");

    let err = env
        .forwarder
        .request(&incoming_request("1", NS_A, 42))
        .await
        .unwrap_err();
    assert!(matches!(err, FwdError::SwitchProgrammingFailed { .. }));
    assert_eq!(env.forwarder.tunnel_count().await, 0);
    assert_eq!(env.forwarder.connection_state("1"), None);
}

#[tokio::test]
async fn test_failed_connect_then_close_releases_tunnel() {
    let env = TestEnv::new().await;
    let req = incoming_request("1", NS_A, 42);

    env.switch.fail_operation("add_flow");
    assert!(env.forwarder.request(&req).await.is_err());
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(1));

    env.switch.clear_failures();
    env.forwarder.close(&req).await.unwrap();
    assert_eq!(env.forwarder.tunnel_count().await, 0);
    assert!(env.switch.port_names().is_empty());
}

#[tokio::test]
async fn test_close_of_unknown_id_keeps_shared_tunnel() {
    let env = TestEnv::new().await;
    env.forwarder
        .request(&incoming_request("1", NS_A, 42))
        .await
        .unwrap();

    env.forwarder
        .close(&incoming_request("2", NS_B, 43))
        .await
        .unwrap();
    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(1));
    SwitchVerifier::new(&env.switch, BRIDGE)
        .assert_port(&tunnel_port_name(&peer()))
        .unwrap();
}

#[tokio::test]
async fn test_bare_close_releases_recorded_tunnel() {
    let env = TestEnv::new().await;
    let devices = env
        .forwarder
        .request(&outgoing_request("1", NS_A, 42))
        .await
        .unwrap();

    // Neither endpoint carries parameters; everything comes from the connect.
    let bare = request(
        "1",
        EndpointDescriptor::new(MechanismKind::LocalKernel),
        EndpointDescriptor::new(MechanismKind::RemoteTunnel),
    );
    let closed = env.forwarder.close(&bare).await.unwrap();

    assert_eq!(closed, devices);
    assert_eq!(env.forwarder.tunnel_count().await, 0);
    assert!(env.switch.flows(BRIDGE).is_empty());
    assert!(env.switch.port_names().is_empty());
    HostVerifier::new(&env.host)
        .assert_no_link(NS_A, "nsm0")
        .unwrap();
}

#[tokio::test]
async fn test_bare_close_keeps_other_flows_on_shared_tunnel() {
    let env = TestEnv::new().await;
    for (id, ns, vni) in [("1", NS_A, 42), ("2", NS_B, 43)] {
        env.forwarder
            .request(&incoming_request(id, ns, vni))
            .await
            .unwrap();
    }

    let bare = request(
        "1",
        EndpointDescriptor::new(MechanismKind::RemoteTunnel),
        EndpointDescriptor::new(MechanismKind::LocalKernel),
    );
    env.forwarder.close(&bare).await.unwrap();

    assert_eq!(env.forwarder.tunnel_refs(peer()).await, Some(1));
    let switch = SwitchVerifier::new(&env.switch, BRIDGE);
    let tun = switch.assert_port(&tunnel_port_name(&peer())).unwrap();
    let local2 = switch.assert_port("tap_2").unwrap();
    switch.assert_no_port("tap_1").unwrap();
    switch.assert_no_flows(&FlowMatch::tunnel(tun, 42)).unwrap();
    switch.assert_flow(&Flow::encap(local2, tun, 43)).unwrap();
    switch.assert_flow(&Flow::decap(tun, 43, local2)).unwrap();
}
