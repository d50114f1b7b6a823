//! Verification helpers for testing the forwarder
//!
//! Provides assertion helpers over the state of a [`MockHost`] and a
//! [`MockSwitch`] after a connect or disconnect.

use nsm_fwd_common::{Flow, FlowMatch};
use thiserror::Error;

use crate::{MockHost, MockSwitch};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected link '{name}' in namespace '{netns}'")]
    LinkNotFound { netns: String, name: String },

    #[error("Link '{name}' in namespace '{netns}' should not exist")]
    UnexpectedLink { netns: String, name: String },

    #[error("Link '{name}' is {actual}, expected {expected}")]
    LinkState {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Address '{address}' missing on link '{name}' (has {actual:?})")]
    AddressMissing {
        name: String,
        address: String,
        actual: Vec<String>,
    },

    #[error("Expected port '{port}' on the switch")]
    PortNotFound { port: String },

    #[error("Port '{port}' should not be attached")]
    UnexpectedPort { port: String },

    #[error("Flow '{flow}' not installed on '{bridge}' (flows: {actual:?})")]
    FlowNotFound {
        bridge: String,
        flow: String,
        actual: Vec<String>,
    },

    #[error("{count} flow(s) on '{bridge}' still match '{filter}'")]
    LeftoverFlows {
        bridge: String,
        filter: String,
        count: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Host state verification helper
pub struct HostVerifier<'a> {
    host: &'a MockHost,
}

impl<'a> HostVerifier<'a> {
    /// Create a new host verifier
    pub fn new(host: &'a MockHost) -> Self {
        Self { host }
    }

    /// Verify that a link exists in a namespace and is up
    pub fn assert_link_up(&self, netns: &str, name: &str) -> VerifyResult<()> {
        let link = self
            .host
            .link(netns, name)
            .ok_or_else(|| VerificationError::LinkNotFound {
                netns: netns.to_string(),
                name: name.to_string(),
            })?;
        if !link.up {
            return Err(VerificationError::LinkState {
                name: name.to_string(),
                expected: "up",
                actual: "down",
            });
        }
        Ok(())
    }

    /// Verify that a link does not exist in a namespace
    pub fn assert_no_link(&self, netns: &str, name: &str) -> VerifyResult<()> {
        if self.host.link(netns, name).is_some() {
            return Err(VerificationError::UnexpectedLink {
                netns: netns.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Verify that a link carries an address (CIDR notation)
    pub fn assert_address(&self, netns: &str, name: &str, address: &str) -> VerifyResult<()> {
        let link = self
            .host
            .link(netns, name)
            .ok_or_else(|| VerificationError::LinkNotFound {
                netns: netns.to_string(),
                name: name.to_string(),
            })?;
        if !link.addresses.iter().any(|a| a == address) {
            return Err(VerificationError::AddressMissing {
                name: name.to_string(),
                address: address.to_string(),
                actual: link.addresses,
            });
        }
        Ok(())
    }
}

/// Switch state verification helper
pub struct SwitchVerifier<'a> {
    switch: &'a MockSwitch,
    bridge: &'a str,
}

impl<'a> SwitchVerifier<'a> {
    /// Create a new switch verifier for one bridge
    pub fn new(switch: &'a MockSwitch, bridge: &'a str) -> Self {
        Self { switch, bridge }
    }

    /// Verify that a port is attached and return its port number
    pub fn assert_port(&self, port: &str) -> VerifyResult<u32> {
        self.switch
            .port(port)
            .map(|p| p.ofport)
            .ok_or_else(|| VerificationError::PortNotFound {
                port: port.to_string(),
            })
    }

    /// Verify that a port is not attached
    pub fn assert_no_port(&self, port: &str) -> VerifyResult<()> {
        if self.switch.port(port).is_some() {
            return Err(VerificationError::UnexpectedPort {
                port: port.to_string(),
            });
        }
        Ok(())
    }

    /// Verify that a flow is installed
    pub fn assert_flow(&self, flow: &Flow) -> VerifyResult<()> {
        let flows = self.switch.flows(self.bridge);
        if !flows.contains(flow) {
            return Err(VerificationError::FlowNotFound {
                bridge: self.bridge.to_string(),
                flow: flow.to_string(),
                actual: flows.iter().map(Flow::to_string).collect(),
            });
        }
        Ok(())
    }

    /// Verify that no installed flow is covered by `filter`
    pub fn assert_no_flows(&self, filter: &FlowMatch) -> VerifyResult<()> {
        let count = self
            .switch
            .flows(self.bridge)
            .iter()
            .filter(|f| f.matches.covered_by(filter))
            .count();
        if count > 0 {
            return Err(VerificationError::LeftoverFlows {
                bridge: self.bridge.to_string(),
                filter: filter.to_string(),
                count,
            });
        }
        Ok(())
    }
}
