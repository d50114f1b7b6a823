//! Device events for monitoring.

use tracing::info;

use crate::types::DeviceMap;

/// Receives the devices of a connection when it comes up or goes down.
pub trait MonitorSink: Send + Sync {
    fn update(&self, devices: &DeviceMap, connected: bool);
}

/// Sink that reports device events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl MonitorSink for TracingMonitor {
    fn update(&self, devices: &DeviceMap, connected: bool) {
        for (netns, device) in devices {
            info!(
                netns = %netns,
                device = %device.name,
                xcon = %device.xcon_name,
                connected,
                "Device update"
            );
        }
    }
}
