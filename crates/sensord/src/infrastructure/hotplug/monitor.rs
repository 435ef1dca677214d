//! The hotplug monitor thread.
//!
//! The monitor polls the USB device tree on a dedicated OS thread and
//! forwards events with `try_send`, so it never waits on the async runtime.
//! A full queue means the orchestrator is not keeping up (or the queue is
//! configured too small); it is logged as an error and the undelivered
//! sensor is re-announced on a later poll instead of being lost.

use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn, Span};

use super::sysfs::{enumerate_serial_ports, SysfsScanner};
use super::{HotplugAction, HotplugError, HotplugEvent};

/// Lists the serial ports the OS currently knows about.
pub type PortEnumerator = Arc<dyn Fn() -> HashSet<String> + Send + Sync>;

/// Watches for smart sensors and feeds [`HotplugEvent`]s to the orchestrator.
pub struct HotplugMonitor {
    scanner: SysfsScanner,
    enumerate: PortEnumerator,
    tx: mpsc::Sender<HotplugEvent>,
    capacity: usize,
    poll_interval: Duration,
    span: Span,
}

impl HotplugMonitor {
    /// Creates a monitor and the receiving end of its bounded event queue.
    pub fn new(
        scanner: SysfsScanner,
        capacity: usize,
        poll_interval: Duration,
        span: Span,
    ) -> (Self, mpsc::Receiver<HotplugEvent>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let monitor = Self {
            scanner,
            enumerate: Arc::new(enumerate_serial_ports),
            tx,
            capacity,
            poll_interval,
            span,
        };
        (monitor, rx)
    }

    /// Replaces the serial port enumeration (tests use a fixed set).
    pub fn with_enumerator(mut self, enumerate: PortEnumerator) -> Self {
        self.enumerate = enumerate;
        self
    }

    /// Announces every smart sensor already attached, as `Add` followed by
    /// `Bind`, so sensors plugged in before startup are not missed.
    pub fn handle_initial_sensors(&mut self) -> Result<usize, HotplugError> {
        let _entered = self.span.clone().entered();
        let delivered = self.poll_once()?;
        info!(events = delivered, "announced sensors present at startup");
        Ok(delivered)
    }

    /// Scans once and forwards the resulting events.  Returns how many were delivered.
    fn poll_once(&mut self) -> Result<usize, HotplugError> {
        let enumerated = (self.enumerate)();
        let events = self.scanner.scan(&enumerated)?;
        let mut delivered = 0;
        let mut first_error = None;

        for event in events {
            match self.forward(event) {
                Ok(()) => delivered += 1,
                Err(e @ HotplugError::ConsumerClosed) => return Err(e),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    fn forward(&mut self, event: HotplugEvent) -> Result<(), HotplugError> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                error!(
                    capacity = self.capacity,
                    action = ?event.action,
                    path = %event.device_path.display(),
                    "hotplug queue full; event not delivered"
                );
                if event.action == HotplugAction::Add {
                    self.scanner.forget(&event.device_path);
                }
                Err(HotplugError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(HotplugError::ConsumerClosed),
        }
    }

    /// Starts polling on a dedicated thread.
    pub fn start(self) -> Result<MonitorHandle, HotplugError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("sensor-hotplug".to_string())
            .spawn(move || self.poll_loop(running_clone))
            .map_err(HotplugError::Spawn)?;
        Ok(MonitorHandle {
            running,
            thread: Some(thread),
        })
    }

    fn poll_loop(mut self, running: Arc<AtomicBool>) {
        let span = self.span.clone();
        let _entered = span.enter();
        info!(interval = ?self.poll_interval, "hotplug monitor started");

        while running.load(Ordering::Relaxed) {
            std::thread::sleep(self.poll_interval);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            match self.poll_once() {
                Ok(0) => {}
                Ok(n) => debug!(events = n, "hotplug events forwarded"),
                Err(HotplugError::ConsumerClosed) => {
                    info!("hotplug consumer closed; monitor exiting");
                    return;
                }
                // Already logged when the queue overflowed.
                Err(HotplugError::QueueFull { .. }) => {}
                Err(e) => warn!("hotplug scan failed: {e}"),
            }
        }
        info!("hotplug monitor stopped");
    }
}

/// Owner of a running monitor thread.  Dropping it stops the thread.
pub struct MonitorHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Signals the thread to stop and waits for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("hotplug monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
