//! Test infrastructure for the OVS forwarder
//!
//! Provides:
//! - [`MockHost`]: in-memory namespaces and links implementing the namespace
//!   and link primitives
//! - [`MockSwitch`]: in-memory bridge, ports and flow table implementing the
//!   switch primitives
//! - [`SysfsTree`]: a temporary sysfs layout for SR-IOV lookups
//! - Verification helpers for asserting on host and switch state

mod host;
mod switch;
mod sysfs;
mod verification;

pub use host::{LinkSnapshot, MockHost, HOST_NS};
pub use switch::{MockPort, MockSwitch};
pub use sysfs::SysfsTree;
pub use verification::*;
