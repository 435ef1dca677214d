//! All smart sensor packet types.
//!
//! The message identifiers match the sensor firmware.  Every packet carries a
//! one-byte message ID and a payload of at most [`MAX_PAYLOAD_SIZE`] bytes;
//! multi-byte integers in payloads are little-endian.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Largest payload a single packet may carry.
///
/// Chosen so that the COBS-encoded packet (id + length + payload + checksum,
/// plus COBS overhead) still fits in the one-byte frame length field.
pub const MAX_PAYLOAD_SIZE: usize = 250;

/// Size of a subscription response payload in bytes.
pub const SUBSCRIPTION_RESPONSE_SIZE: usize = 15;

/// Heartbeat ID reserved for round-trip-time measurement.
pub const ROUND_TRIP_ID: u8 = 0xFF;

// ── Message identifiers ───────────────────────────────────────────────────────

/// Message identifier byte at the start of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageId {
    Ping = 0x00,
    SubscriptionRequest = 0x01,
    SubscriptionResponse = 0x02,
    DeviceRead = 0x03,
    DeviceWrite = 0x04,
    DeviceData = 0x05,
    DeviceDisable = 0x06,
    HeartbeatRequest = 0x07,
    HeartbeatResponse = 0x08,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageId {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x00 => Ok(MessageId::Ping),
            0x01 => Ok(MessageId::SubscriptionRequest),
            0x02 => Ok(MessageId::SubscriptionResponse),
            0x03 => Ok(MessageId::DeviceRead),
            0x04 => Ok(MessageId::DeviceWrite),
            0x05 => Ok(MessageId::DeviceData),
            0x06 => Ok(MessageId::DeviceDisable),
            0x07 => Ok(MessageId::HeartbeatRequest),
            0x08 => Ok(MessageId::HeartbeatResponse),
            0xFF => Ok(MessageId::Error),
            _ => Err(()),
        }
    }
}

// ── Sensor identity ───────────────────────────────────────────────────────────

/// Unique identity burned into every sensor's firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SensorUid {
    /// Catalog device type (see [`crate::domain::catalog`]).
    pub device_type: u16,
    /// Competition year the board was built for.
    pub year: u8,
    /// Per-board random identifier.
    pub id: u64,
}

impl SensorUid {
    /// Packs the UID into a single integer: `device_type << 72 | year << 64 | id`.
    pub fn to_int(&self) -> u128 {
        (u128::from(self.device_type) << 72) | (u128::from(self.year) << 64) | u128::from(self.id)
    }

    /// Name under which this sensor's buffer is published.
    pub fn buffer_key(&self) -> String {
        format!("smart-sensor-{}", self.to_int())
    }
}

/// Payload of a SUBSCRIPTION_RESPONSE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    /// Bitmap of parameters the sensor will stream in DEVICE_DATA packets.
    pub params: u16,
    /// Milliseconds between consecutive DEVICE_DATA packets.
    pub delay: u16,
    /// Identity of the responding sensor.
    pub uid: SensorUid,
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// A decoded smart sensor packet.
///
/// `DeviceWrite` and `DeviceData` carry their parameter values still packed:
/// the sizes of the individual fields are only known to the buffer that owns
/// the device's parameter layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorPacket {
    Ping,
    SubscriptionRequest { params: u16, delay: u16 },
    SubscriptionResponse(SubscriptionResponse),
    DeviceRead { params: u16 },
    DeviceWrite { params: u16, data: Vec<u8> },
    DeviceData { params: u16, data: Vec<u8> },
    DeviceDisable,
    HeartbeatRequest { id: u8 },
    HeartbeatResponse { id: u8 },
    Error { code: u8 },
}

impl SensorPacket {
    /// Returns the message identifier for this packet.
    pub fn message_id(&self) -> MessageId {
        match self {
            SensorPacket::Ping => MessageId::Ping,
            SensorPacket::SubscriptionRequest { .. } => MessageId::SubscriptionRequest,
            SensorPacket::SubscriptionResponse(_) => MessageId::SubscriptionResponse,
            SensorPacket::DeviceRead { .. } => MessageId::DeviceRead,
            SensorPacket::DeviceWrite { .. } => MessageId::DeviceWrite,
            SensorPacket::DeviceData { .. } => MessageId::DeviceData,
            SensorPacket::DeviceDisable => MessageId::DeviceDisable,
            SensorPacket::HeartbeatRequest { .. } => MessageId::HeartbeatRequest,
            SensorPacket::HeartbeatResponse { .. } => MessageId::HeartbeatResponse,
            SensorPacket::Error { .. } => MessageId::Error,
        }
    }

    /// Asks the sensor to identify itself with a subscription response.
    pub fn ping() -> Self {
        SensorPacket::Ping
    }

    /// Puts the sensor's actuators into their safe, inactive state.
    pub fn disable() -> Self {
        SensorPacket::DeviceDisable
    }

    pub fn heartbeat_request(id: u8) -> Self {
        SensorPacket::HeartbeatRequest { id }
    }

    pub fn heartbeat_response(id: u8) -> Self {
        SensorPacket::HeartbeatResponse { id }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
