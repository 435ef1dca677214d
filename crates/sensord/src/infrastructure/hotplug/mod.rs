//! USB hotplug detection for smart sensors.
//!
//! The kernel publishes every USB interface under `/sys/bus/usb/devices`.
//! [`sysfs::SysfsScanner`] diffs that tree between polls and turns
//! appearances and disappearances of smart sensor interfaces into typed
//! [`HotplugEvent`]s.  [`monitor::HotplugMonitor`] runs the scanner on a
//! dedicated thread and hands events to the orchestrator through a bounded
//! tokio channel, so nothing on the monitor thread ever blocks on the async
//! runtime.
//!
//! # Event order
//!
//! A sensor that appears produces `Add` then `Bind`; one that disappears
//! produces `Unbind` then `Remove`.  Only `Add` carries ports.

use std::path::PathBuf;

use thiserror::Error;

pub mod monitor;
pub mod sysfs;

/// Kind of hotplug notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotplugAction {
    Add,
    Remove,
    Bind,
    Unbind,
}

/// A typed hotplug notification for one smart sensor USB interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: HotplugAction,
    /// Sysfs path of the USB interface.
    pub device_path: PathBuf,
    /// Serial device paths of the interface, e.g. `/dev/ttyACM0`.  May be
    /// empty, and always is for anything but `Add`.
    pub ports: Vec<String>,
}

impl HotplugEvent {
    pub fn new(action: HotplugAction, device_path: impl Into<PathBuf>, ports: Vec<String>) -> Self {
        Self {
            action,
            device_path: device_path.into(),
            ports,
        }
    }
}

/// Error type for hotplug monitoring.
#[derive(Debug, Error)]
pub enum HotplugError {
    /// The orchestrator is not draining events; the queue is undersized or
    /// the consumer is stuck.
    #[error("hotplug event queue is full ({capacity} events queued)")]
    QueueFull { capacity: usize },

    #[error("hotplug event consumer has gone away")]
    ConsumerClosed,

    #[error("cannot read USB device tree at {path}: {source}")]
    DeviceTree {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn hotplug thread: {0}")]
    Spawn(#[source] std::io::Error),
}
