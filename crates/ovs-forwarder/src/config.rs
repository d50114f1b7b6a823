//! Configuration file support for the forwarder
//!
//! Loads and validates forwarder configuration from TOML files.
//! Default location: /etc/nsm/ovs-forwarder.toml

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nsm_fwd_common::{FwdError, FwdResult, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::tables::{DEFAULT_BRIDGE, VETH_MTU};

/// Retry knobs for lookups that lag behind the switch or the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts to read a non-zero OpenFlow port number
    #[serde(default = "default_attempts")]
    pub port_id_attempts: u32,

    /// Delay between port number reads in milliseconds
    #[serde(default = "default_delay_ms")]
    pub port_id_delay_ms: u64,

    /// Attempts to resolve a VF representor during teardown
    #[serde(default = "default_attempts")]
    pub representor_attempts: u32,

    /// Delay between representor lookups in milliseconds
    #[serde(default = "default_delay_ms")]
    pub representor_delay_ms: u64,
}

impl RetryConfig {
    /// Policy for OpenFlow port number reads
    pub fn port_id_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.port_id_attempts,
            Duration::from_millis(self.port_id_delay_ms),
        )
    }

    /// Policy for representor lookups
    pub fn representor_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.representor_attempts,
            Duration::from_millis(self.representor_delay_ms),
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            port_id_attempts: default_attempts(),
            port_id_delay_ms: default_delay_ms(),
            representor_attempts: default_attempts(),
            representor_delay_ms: default_delay_ms(),
        }
    }
}

/// Complete forwarder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Integration bridge all ports are attached to
    #[serde(default = "default_bridge")]
    pub bridge: String,

    /// Local tunnel endpoint, used when a request does not carry one
    #[serde(default)]
    pub egress_ip: Option<String>,

    /// PCI addresses of VFs available for allocation
    #[serde(default)]
    pub devices: Vec<String>,

    /// PF netdevs whose VFs are added to the pool at startup
    #[serde(default)]
    pub physical_functions: Vec<String>,

    /// Root of the sysfs tree used for SR-IOV lookups
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// MTU of veth pairs
    #[serde(default = "default_veth_mtu")]
    pub veth_mtu: u32,

    /// Emit device events to the monitoring sink
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            egress_ip: None,
            devices: Vec::new(),
            physical_functions: Vec::new(),
            sysfs_root: default_sysfs_root(),
            veth_mtu: default_veth_mtu(),
            metrics_enabled: false,
            retry: RetryConfig::default(),
        }
    }
}

// Default functions
fn default_bridge() -> String {
    DEFAULT_BRIDGE.to_string()
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_veth_mtu() -> u32 {
    VETH_MTU
}

fn default_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    500
}

impl ForwarderConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> FwdResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            FwdError::config(path.display().to_string(), format!("cannot read: {}", e))
        })?;
        let config: ForwarderConfig = toml::from_str(&contents).map_err(|e| {
            FwdError::config(path.display().to_string(), format!("cannot parse: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file is missing
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> FwdResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> FwdResult<()> {
        if self.bridge.trim().is_empty() {
            return Err(FwdError::config("bridge", "must not be empty"));
        }
        if let Some(ip) = &self.egress_ip {
            ip.parse::<IpAddr>()
                .map_err(|_| FwdError::config("egress_ip", format!("'{}' is not an IP address", ip)))?;
        }
        if !(68..=65535).contains(&self.veth_mtu) {
            return Err(FwdError::config("veth_mtu", "must be between 68 and 65535"));
        }
        if self.retry.port_id_attempts == 0 || self.retry.representor_attempts == 0 {
            return Err(FwdError::config("retry", "attempts must be at least 1"));
        }
        if let Some(dup) = first_duplicate(&self.devices) {
            return Err(FwdError::config("devices", format!("'{}' listed twice", dup)));
        }
        Ok(())
    }

    /// Parsed egress address, if configured
    pub fn egress_addr(&self) -> Option<IpAddr> {
        self.egress_ip.as_deref().and_then(|ip| ip.parse().ok())
    }
}

fn first_duplicate(items: &[String]) -> Option<&str> {
    let mut seen = std::collections::HashSet::new();
    items
        .iter()
        .find(|item| !seen.insert(item.as_str()))
        .map(String::as_str)
}
