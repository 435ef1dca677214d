//! Packet links: one framed, bidirectional packet connection per sensor.
//!
//! The production implementation ([`serial::SerialLink`]) owns a USB-serial
//! port and a blocking reader thread.  Tests use [`mock::MockLink`], which
//! records outbound packets and lets the test (or a scripted responder) play
//! the part of the sensor firmware.
//!
//! # Error classes
//!
//! [`LinkError::Codec`] from [`PacketLink::recv`] means one frame was
//! undecodable; the link itself is fine and the caller should keep reading.
//! Every other error means the link is gone.

use std::sync::Arc;

use async_trait::async_trait;
use sensor_core::{ProtocolError, SensorPacket};
use thiserror::Error;

pub mod mock;
pub mod serial;

/// Error type for packet link operations.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("serial transport fault: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// Whether the link is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LinkError::Codec(_))
    }
}

/// A framed packet connection to one sensor.
///
/// `send` may be called concurrently from several activities of a session;
/// `recv` is only ever awaited by the session's read loop.
#[async_trait]
pub trait PacketLink: Send + Sync {
    /// Path of the underlying port, e.g. `/dev/ttyACM0`.
    fn port(&self) -> &str;

    /// Encodes and writes one packet.
    async fn send(&self, packet: &SensorPacket) -> Result<(), LinkError>;

    /// Waits for the next inbound packet.
    async fn recv(&self) -> Result<SensorPacket, LinkError>;
}

/// Opens links by port path.  The orchestrator owns one of these.
pub trait LinkFactory: Send + Sync {
    fn open(&self, port: &str) -> Result<Arc<dyn PacketLink>, LinkError>;
}
