//! Smart sensor device service: entry point.
//!
//! Discovers smart sensors as they are plugged in, runs one protocol session
//! per sensor, publishes live sensor status on a Unix socket and accepts
//! commands on another.
//!
//! # Usage
//!
//! ```text
//! sensord [OPTIONS]
//!
//! Options:
//!   --config      <PATH>   TOML config file [default: /etc/sensord/config.toml]
//!   --log-level   <LEVEL>  Overrides [service] log_level
//!   --baud-rate   <BAUD>   Overrides [device] baud_rate
//!   --usb-devices <PATH>   USB device tree to scan [default: /sys/bus/usb/devices]
//! ```
//!
//! Each option can also be set through an environment variable
//! (`SENSORD_CONFIG`, `SENSORD_LOG_LEVEL`, `SENSORD_BAUD_RATE`,
//! `SENSORD_USB_DEVICES`); CLI args take precedence.  `RUST_LOG` overrides
//! the log level entirely.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  ├─ HotplugMonitor      (OS thread "sensor-hotplug")  ──► hotplug queue
//!  ├─ run_command_server  (Tokio task)                  ──► command queue
//!  ├─ run_status_server   (Tokio task)                  ◄── StatusBroadcaster
//!  └─ DeviceOrchestrator::run
//!       └─ SensorSession::run per sensor port (Tokio task each)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

use sensor_core::BufferStore;
use sensord::application::command::CommandClient;
use sensord::application::orchestrator::DeviceOrchestrator;
use sensord::infrastructure::hotplug::monitor::HotplugMonitor;
use sensord::infrastructure::hotplug::sysfs::{SysfsScanner, DEV_ROOT, USB_DEVICES_ROOT};
use sensord::infrastructure::hotplug::HotplugError;
use sensord::infrastructure::link::serial::SerialLinkFactory;
use sensord::infrastructure::rpc::bind_unix;
use sensord::infrastructure::rpc::command_server::run_command_server;
use sensord::infrastructure::rpc::status_server::{run_status_server, StatusBroadcaster};
use sensord::infrastructure::storage::config::{load_config, ServiceConfig};

/// Pending command requests before callers start waiting to enqueue.
const COMMAND_QUEUE: usize = 32;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Smart sensor device service.
#[derive(Debug, Parser)]
#[command(
    name = "sensord",
    about = "Discovers smart sensors over USB-serial and publishes their live values",
    version
)]
struct Cli {
    /// Path of the TOML config file.  A missing file means all defaults.
    #[arg(long, default_value = "/etc/sensord/config.toml", env = "SENSORD_CONFIG")]
    config: PathBuf,

    /// `tracing` level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long, env = "SENSORD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Serial baud rate for every sensor port.
    #[arg(long, env = "SENSORD_BAUD_RATE")]
    baud_rate: Option<u32>,

    /// Root of the sysfs USB device tree.
    #[arg(long, default_value = USB_DEVICES_ROOT, env = "SENSORD_USB_DEVICES")]
    usb_devices: PathBuf,
}

impl Cli {
    /// Loads the config file and applies the CLI overrides.
    fn load_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load config from {}", self.config.display()))?;
        self.apply_overrides(&mut config)?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut ServiceConfig) -> anyhow::Result<()> {
        if let Some(level) = &self.log_level {
            config.service.log_level = level.clone();
        }
        if let Some(baud_rate) = self.baud_rate {
            config.device.baud_rate = baud_rate;
        }
        config.validate().context("invalid command-line override")?;
        Ok(())
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level)),
        )
        .init();

    info!(
        baud_rate = config.device.baud_rate,
        config = %cli.config.display(),
        "smart sensor device service starting"
    );

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Command and status sockets ────────────────────────────────────────────
    let command_listener = bind_unix(&config.sockets.sensor_command).context("command socket setup failed")?;
    let status_listener = bind_unix(&config.sockets.sensor_status).context("status socket setup failed")?;

    let (client, command_rx) = CommandClient::channel(COMMAND_QUEUE);
    let broadcaster = StatusBroadcaster::new();
    tokio::spawn(run_command_server(command_listener, client, Arc::clone(&running)));
    tokio::spawn(run_status_server(status_listener, broadcaster.clone(), Arc::clone(&running)));

    // ── Hotplug monitor ───────────────────────────────────────────────────────
    let (mut monitor, hotplug_rx) = HotplugMonitor::new(
        SysfsScanner::new(&cli.usb_devices, DEV_ROOT),
        config.device.max_hotplug_events,
        config.hotplug_poll_interval(),
        info_span!("hotplug"),
    );
    match monitor.handle_initial_sensors() {
        Ok(_) => {}
        // Logged by the monitor; the sensors that did not fit are retried.
        Err(HotplugError::QueueFull { .. }) => {}
        Err(e) => return Err(e).context("hotplug monitor setup failed"),
    }
    let monitor = monitor.start().context("hotplug monitor setup failed")?;

    std::fs::create_dir_all(&config.device.buffer_dir)
        .with_context(|| format!("cannot create buffer directory {}", config.device.buffer_dir.display()))?;

    // ── Orchestrator ──────────────────────────────────────────────────────────
    let orchestrator = DeviceOrchestrator::new(
        Arc::new(SerialLinkFactory::new(config.device.baud_rate)),
        Arc::new(BufferStore::shared(&config.device.buffer_dir)),
        Arc::new(broadcaster),
        config.orchestrator_config(),
        info_span!("orchestrator"),
    );
    orchestrator
        .run(hotplug_rx, command_rx, wait_for_shutdown(Arc::clone(&running)))
        .await;

    // Joining the monitor thread blocks for up to one poll interval.
    if tokio::task::spawn_blocking(move || monitor.stop()).await.is_err() {
        error!("hotplug monitor did not stop cleanly");
    }
    for path in [&config.sockets.sensor_command, &config.sockets.sensor_status] {
        let _ = std::fs::remove_file(path);
    }

    info!("smart sensor device service stopped");
    Ok(())
}

/// Resolves once `running` has been cleared.
async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
