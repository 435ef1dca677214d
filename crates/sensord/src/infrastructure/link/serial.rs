//! USB-serial packet link.
//!
//! Each open port gets a dedicated reader thread.  The thread blocks on the
//! port with a short timeout, feeds every chunk into a [`FrameDecoder`], and
//! forwards decoded frames into a bounded tokio channel.  The short timeout
//! lets the thread notice shutdown even when the sensor is silent.
//!
//! Writes go through a cloned port handle on the blocking pool, so a slow
//! write never stalls the async runtime and reads never wait on writes.

use std::io::{ErrorKind, Read, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use sensor_core::{encode_frame, FrameDecoder, SensorPacket};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{LinkError, LinkFactory, PacketLink};

/// Read timeout of the blocking reader thread.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Decoded frames queued between the reader thread and the session.
const INBOUND_CAPACITY: usize = 256;

/// Bytes requested per blocking read.
const READ_CHUNK: usize = 256;

type Inbound = Result<SensorPacket, LinkError>;

/// A [`PacketLink`] over a USB-serial port.
pub struct SerialLink {
    port: String,
    writer: Arc<Mutex<Box<dyn SerialPort>>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    running: Arc<AtomicBool>,
}

impl SerialLink {
    /// Opens `path` at `baud_rate`, 8N1, no flow control, and starts its reader thread.
    ///
    /// Request-to-send is de-asserted on open; the sensors reset when it is held.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let open_error = |reason: String| LinkError::Open {
            port: path.to_string(),
            reason,
        };

        let mut port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| open_error(e.to_string()))?;
        port.write_request_to_send(false)
            .map_err(|e| open_error(e.to_string()))?;
        let reader_port = port.try_clone().map_err(|e| open_error(e.to_string()))?;

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread_port = path.to_string();

        std::thread::Builder::new()
            .name(format!("serial-reader:{path}"))
            .spawn(move || reader_loop(thread_port, reader_port, tx, running_clone))
            .map_err(|e| open_error(format!("failed to spawn reader thread: {e}")))?;

        info!(port = path, baud_rate, "opened serial port");

        Ok(Self {
            port: path.to_string(),
            writer: Arc::new(Mutex::new(port)),
            inbound: tokio::sync::Mutex::new(rx),
            running,
        })
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl PacketLink for SerialLink {
    fn port(&self) -> &str {
        &self.port
    }

    async fn send(&self, packet: &SensorPacket) -> Result<(), LinkError> {
        let frame = encode_frame(packet)?;
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut port = writer
                .lock()
                .map_err(|_| LinkError::Transport("writer lock poisoned".to_string()))?;
            port.write_all(&frame)
                .and_then(|()| port.flush())
                .map_err(|e| LinkError::Transport(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Transport(format!("write task failed: {e}")))?
    }

    async fn recv(&self) -> Result<SensorPacket, LinkError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.unwrap_or(Err(LinkError::Closed))
    }
}

/// Body of the reader thread.  Exits when the link is dropped, the port
/// faults, or the session stops listening.
fn reader_loop(
    path: String,
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<Inbound>,
    running: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; READ_CHUNK];

    while running.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(0) => continue,
            Ok(n) => {
                decoder.push(&chunk[..n]);
                while let Some(frame) = decoder.next_frame() {
                    if tx.blocking_send(frame.map_err(LinkError::from)).is_err() {
                        debug!(port = %path, "session stopped listening; reader exiting");
                        return;
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(port = %path, "serial read failed: {e}");
                let _ = tx.blocking_send(Err(LinkError::Transport(e.to_string())));
                return;
            }
        }
    }
    debug!(port = %path, "reader thread stopped");
}

/// Opens [`SerialLink`]s at a fixed baud rate.
#[derive(Debug, Clone)]
pub struct SerialLinkFactory {
    baud_rate: u32,
}

impl SerialLinkFactory {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl LinkFactory for SerialLinkFactory {
    fn open(&self, port: &str) -> Result<Arc<dyn PacketLink>, LinkError> {
        match SerialLink::open(port, self.baud_rate) {
            Ok(link) => Ok(Arc::new(link)),
            Err(e) => {
                error!(port, "could not open serial link: {e}");
                Err(e)
            }
        }
    }
}
