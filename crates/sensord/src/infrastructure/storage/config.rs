//! TOML configuration for the device service.
//!
//! Every field has a serde default, so the service runs with no config file
//! at all and with files written for older versions.  Example:
//!
//! ```toml
//! [service]
//! log_level = "debug"
//!
//! [device]
//! baud_rate = 115200
//! max_hotplug_events = 128
//! broadcast_interval = 0.2   # seconds
//! write_interval = 0.02      # seconds
//! buffer_dir = "/dev/shm"     # where smart-sensor-<uid> segments are published
//!
//! [sockets]
//! sensor_command = "/tmp/sensor-command.sock"
//! sensor_status = "/tmp/sensor-status.sock"
//! ```
//!
//! Durations are given in (fractional) seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::orchestrator::OrchestratorConfig;
use crate::application::retry::RetryPolicy;
use crate::application::session::SessionConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range, e.g. a zero baud rate or negative interval.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub sockets: SocketConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Sensor handling parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Capacity of the hotplug event queue.
    #[serde(default = "default_max_hotplug_events")]
    pub max_hotplug_events: usize,
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval: f64,
    #[serde(default = "default_write_interval")]
    pub write_interval: f64,
    /// Grace period for buffer readers to detach when a session ends.
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout: f64,
    /// How often the USB device tree is rescanned.
    #[serde(default = "default_hotplug_poll_interval")]
    pub hotplug_poll_interval: f64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: f64,
    #[serde(default = "default_ping_max_tries")]
    pub ping_max_tries: u32,
    /// Pause between ping attempts.
    #[serde(default = "default_ping_backoff")]
    pub ping_backoff: f64,
    /// Directory sensor buffer segments are published in.
    #[serde(default = "default_buffer_dir")]
    pub buffer_dir: PathBuf,
}

/// Unix socket paths of the command and status channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketConfig {
    #[serde(default = "default_sensor_command")]
    pub sensor_command: PathBuf,
    #[serde(default = "default_sensor_status")]
    pub sensor_status: PathBuf,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_max_hotplug_events() -> usize {
    128
}
fn default_broadcast_interval() -> f64 {
    0.2
}
fn default_write_interval() -> f64 {
    0.02
}
fn default_terminate_timeout() -> f64 {
    2.0
}
fn default_hotplug_poll_interval() -> f64 {
    0.5
}
fn default_ping_timeout() -> f64 {
    1.0
}
fn default_ping_max_tries() -> u32 {
    10
}
fn default_ping_backoff() -> f64 {
    1.0
}
fn default_buffer_dir() -> PathBuf {
    PathBuf::from("/dev/shm")
}
fn default_sensor_command() -> PathBuf {
    PathBuf::from("/tmp/sensor-command.sock")
}
fn default_sensor_status() -> PathBuf {
    PathBuf::from("/tmp/sensor-status.sock")
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            max_hotplug_events: default_max_hotplug_events(),
            broadcast_interval: default_broadcast_interval(),
            write_interval: default_write_interval(),
            terminate_timeout: default_terminate_timeout(),
            hotplug_poll_interval: default_hotplug_poll_interval(),
            ping_timeout: default_ping_timeout(),
            ping_max_tries: default_ping_max_tries(),
            ping_backoff: default_ping_backoff(),
            buffer_dir: default_buffer_dir(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            sensor_command: default_sensor_command(),
            sensor_status: default_sensor_status(),
        }
    }
}

// ── Validation and conversion ─────────────────────────────────────────────────

fn positive_seconds(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && Duration::try_from_secs_f64(value).is_ok() {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("expected a positive number of seconds, got {value}"),
        })
    }
}

fn positive_integer(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        })
    }
}

impl ServiceConfig {
    /// Rejects non-positive numbers and an empty buffer directory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.device;
        if d.buffer_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "device.buffer_dir",
                reason: "must name a directory".to_string(),
            });
        }
        positive_integer("device.baud_rate", u64::from(d.baud_rate))?;
        positive_integer("device.max_hotplug_events", d.max_hotplug_events as u64)?;
        positive_integer("device.ping_max_tries", u64::from(d.ping_max_tries))?;
        positive_seconds("device.broadcast_interval", d.broadcast_interval)?;
        positive_seconds("device.write_interval", d.write_interval)?;
        positive_seconds("device.terminate_timeout", d.terminate_timeout)?;
        positive_seconds("device.hotplug_poll_interval", d.hotplug_poll_interval)?;
        positive_seconds("device.ping_timeout", d.ping_timeout)?;
        positive_seconds("device.ping_backoff", d.ping_backoff)?;
        Ok(())
    }

    /// Session timing derived from `[device]`.  Call after [`validate`](Self::validate).
    pub fn session_config(&self) -> SessionConfig {
        let d = &self.device;
        SessionConfig {
            write_interval: Duration::from_secs_f64(d.write_interval),
            terminate_timeout: Duration::from_secs_f64(d.terminate_timeout),
            ping_timeout: Duration::from_secs_f64(d.ping_timeout),
            ping_policy: RetryPolicy::constant(d.ping_max_tries, Duration::from_secs_f64(d.ping_backoff)),
            ..SessionConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            broadcast_interval: Duration::from_secs_f64(self.device.broadcast_interval),
            session: self.session_config(),
        }
    }

    pub fn hotplug_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.device.hotplug_poll_interval)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads and validates the config at `path`, falling back to defaults if the
/// file does not exist.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let config = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<ServiceConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServiceConfig::default(),
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    config.validate()?;
    Ok(config)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
