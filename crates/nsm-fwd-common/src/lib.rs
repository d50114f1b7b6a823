//! Common infrastructure for the OVS forwarder.
//!
//! This crate holds everything the connection controller consumes from the
//! host but does not decide itself:
//!
//! - [`error`]: Error types shared by all forwarder crates
//! - [`shell`]: Shell command execution with proper quoting
//! - [`netns`]: Namespace handles and the scoped [`NetnsExecutor`]
//! - [`link`]: Link primitives ([`LinkOps`]) and the `ip`-backed [`IpLink`]
//! - [`switch`]: Switch primitives ([`SwitchOps`]) and the OVS-backed [`OvsSwitch`]
//! - [`retry`]: Bounded fixed-delay retry for lagging lookups
//! - [`ref_map`]: Reference-counted map without implicit entry creation
//!
//! # Example
//!
//! ```ignore
//! use nsm_fwd_common::{LinkOps, IpLink, NetnsExecutor, LinuxNetns};
//! use std::sync::Arc;
//!
//! let exec = NetnsExecutor::new(Arc::new(LinuxNetns::new()));
//! exec.run("up", |scope| {
//!     let ns = scope.open("4026532000")?;
//!     scope.enter(&ns)?;
//!     IpLink::new().set_admin_state("nsm0", AdminState::Up)
//! })
//! .await?;
//! ```

pub mod error;
pub mod link;
pub mod netns;
pub mod ref_map;
pub mod retry;
pub mod shell;
pub mod switch;

// Re-export commonly used items at crate root
pub use error::{FwdError, FwdResult};
pub use link::{AdminState, IpLink, LinkOps};
#[cfg(target_os = "linux")]
pub use netns::LinuxNetns;
pub use netns::{Netns, NetnsExecutor, NetnsOps, NetnsScope};
pub use ref_map::{Acquire, RefMap, Release};
pub use retry::{retry_fixed, RetryPolicy};
pub use switch::{Flow, FlowAction, FlowMatch, OvsSwitch, SwitchOps, TunnelSpec};
