//! # sensor-core
//!
//! Shared library for the smart sensor runtime containing the packet codec,
//! the device catalog, and the shared sensor buffers that the device service
//! writes and other processes read.
//!
//! It has no dependencies on async runtimes, serial ports, or sockets.
//!
//! # Architecture overview
//!
//! Smart sensors are small microcontroller boards attached over USB-serial.
//! Each one speaks a compact request/response packet protocol: the host pings
//! the sensor, the sensor answers with a *subscription response* naming its
//! device type and the parameters it will stream, and from then on the sensor
//! streams *device data* while the host sends writes and heartbeats.
//!
//! - **`protocol`** – How packets look on the wire.  Packets are checksummed,
//!   COBS-encoded and framed with a `0x00` delimiter so a reader can resync
//!   after line noise.
//!
//! - **`domain`** – The device catalog (which device types exist and what
//!   parameters each one carries) and the [`SensorBuffer`] holding one
//!   sensor's live values, plus the [`BufferStore`] readers attach through.
//!   A store can publish each buffer as a memory-mapped segment file that
//!   other processes map with [`BufferReader::attach_segment`].

pub mod domain;
pub mod protocol;

pub use domain::buffer::{BufferError, BufferReader, BufferStatus, SensorBuffer};
pub use domain::catalog::{DeviceType, ParamSpec, ParamType, ParamValue};
pub use domain::store::BufferStore;
pub use protocol::codec::{decode_packet, encode_frame, encode_packet, FrameDecoder, ProtocolError};
pub use protocol::messages::{MessageId, SensorPacket, SensorUid, SubscriptionResponse};
