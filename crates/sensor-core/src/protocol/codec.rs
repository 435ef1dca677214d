//! Binary codec for smart sensor packets.
//!
//! Packet format:
//! ```text
//! [message_id:1][payload_len:1][payload:N][checksum:1]
//! ```
//! The checksum is the XOR of every byte before it.
//!
//! Frame format on the serial line:
//! ```text
//! [0x00][cobs_len:1][COBS(packet):cobs_len]
//! ```
//!
//! # Why COBS?
//!
//! Consistent Overhead Byte Stuffing rewrites a byte string so it contains no
//! `0x00` bytes, at a cost of one extra byte per 254.  That frees `0x00` to
//! act as an unambiguous start-of-frame marker: if a byte is lost or corrupted
//! mid-frame, the reader discards input until the next `0x00` and carries on
//! with the following packet instead of staying misaligned forever.

use thiserror::Error;

use crate::protocol::messages::{
    MessageId, SensorPacket, SensorUid, SubscriptionResponse, MAX_PAYLOAD_SIZE,
    SUBSCRIPTION_RESPONSE_SIZE,
};

/// Byte that starts every frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Errors that can occur during packet encoding or decoding.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message ID byte is not a recognized value.
    #[error("unknown message id: 0x{0:02X}")]
    UnknownMessageId(u8),

    /// The trailing checksum does not match the packet contents.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// The declared payload length does not match the bytes present.
    #[error("payload length mismatch: header says {declared}, available is {available}")]
    PayloadLengthMismatch { declared: usize, available: usize },

    /// The payload has the wrong size for its message kind.
    #[error("malformed payload for {kind:?}: {reason}")]
    MalformedPayload { kind: MessageId, reason: String },

    /// The payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds the 250 byte limit")]
    PayloadTooLarge(usize),

    /// The frame body is not valid COBS.
    #[error("invalid COBS frame: {0}")]
    InvalidFrame(&'static str),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`SensorPacket`] into raw packet bytes (no framing).
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit in a
/// single packet.
///
/// # Examples
///
/// ```rust
/// use sensor_core::protocol::{decode_packet, encode_packet, SensorPacket};
///
/// let packet = SensorPacket::heartbeat_request(7);
/// let bytes = encode_packet(&packet).unwrap();
/// assert_eq!(decode_packet(&bytes).unwrap(), packet);
/// ```
pub fn encode_packet(packet: &SensorPacket) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(packet);
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(payload.len() + 3);
    buf.push(packet.message_id() as u8);
    buf.push(payload.len() as u8);
    buf.extend_from_slice(&payload);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Decodes one [`SensorPacket`] from raw packet bytes (no framing).
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are truncated, fail the checksum, or
/// carry a payload that does not fit the message kind.
pub fn decode_packet(bytes: &[u8]) -> Result<SensorPacket, ProtocolError> {
    if bytes.len() < 3 {
        return Err(ProtocolError::InsufficientData {
            needed: 3,
            available: bytes.len(),
        });
    }

    let declared = bytes[1] as usize;
    let available = bytes.len() - 3;
    if declared != available {
        return Err(ProtocolError::PayloadLengthMismatch {
            declared,
            available,
        });
    }

    let (body, trailer) = bytes.split_at(bytes.len() - 1);
    let expected = checksum(body);
    if expected != trailer[0] {
        return Err(ProtocolError::ChecksumMismatch {
            expected,
            actual: trailer[0],
        });
    }

    let id = MessageId::try_from(bytes[0]).map_err(|_| ProtocolError::UnknownMessageId(bytes[0]))?;
    decode_payload(id, &body[2..])
}

/// Encodes a packet into a complete wire frame: delimiter, length, COBS body.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload does not fit.
pub fn encode_frame(packet: &SensorPacket) -> Result<Vec<u8>, ProtocolError> {
    let raw = encode_packet(packet)?;
    let body = cobs_encode(&raw);
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(FRAME_DELIMITER);
    frame.push(body.len() as u8);
    frame.extend_from_slice(&body);
    Ok(frame)
}

// ── Streaming frame decoder ───────────────────────────────────────────────────

/// Incremental decoder that turns a raw serial byte stream into packets.
///
/// Serial reads return arbitrary chunks: half a frame, several frames, or
/// noise between frames.  Bytes are accumulated with [`push`](Self::push) and
/// complete frames are pulled out with [`next_frame`](Self::next_frame).
///
/// A corrupted frame yields one `Err` and the decoder resynchronizes on the
/// next delimiter, so a single bad frame never poisons the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete frame, if one is buffered.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<SensorPacket, ProtocolError>> {
        loop {
            match self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(start) => {
                    if start > 0 {
                        tracing::trace!(skipped = start, "discarding bytes before frame delimiter");
                    }
                    self.buf.drain(..start);
                }
                None => {
                    if !self.buf.is_empty() {
                        tracing::trace!(skipped = self.buf.len(), "discarding bytes with no frame delimiter");
                    }
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < 2 {
                return None;
            }

            let len = self.buf[1] as usize;
            if len == 0 {
                // Repeated delimiter; the second one may start the real frame.
                self.buf.drain(..1);
                continue;
            }

            let body_end = (2 + len).min(self.buf.len());
            if let Some(zero) = self.buf[2..body_end].iter().position(|&b| b == FRAME_DELIMITER) {
                self.buf.drain(..2 + zero);
                return Some(Err(ProtocolError::InvalidFrame("frame interrupted by delimiter")));
            }

            if self.buf.len() < 2 + len {
                return None;
            }

            let result = cobs_decode(&self.buf[2..2 + len]).and_then(|raw| decode_packet(&raw));
            self.buf.drain(..2 + len);
            return Some(result);
        }
    }
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(packet: &SensorPacket) -> Vec<u8> {
    let mut buf = Vec::new();
    match packet {
        SensorPacket::Ping | SensorPacket::DeviceDisable => {}
        SensorPacket::SubscriptionRequest { params, delay } => {
            buf.extend_from_slice(&params.to_le_bytes());
            buf.extend_from_slice(&delay.to_le_bytes());
        }
        SensorPacket::SubscriptionResponse(res) => {
            buf.extend_from_slice(&res.params.to_le_bytes());
            buf.extend_from_slice(&res.delay.to_le_bytes());
            buf.extend_from_slice(&res.uid.device_type.to_le_bytes());
            buf.push(res.uid.year);
            buf.extend_from_slice(&res.uid.id.to_le_bytes());
        }
        SensorPacket::DeviceRead { params } => buf.extend_from_slice(&params.to_le_bytes()),
        SensorPacket::DeviceWrite { params, data } | SensorPacket::DeviceData { params, data } => {
            buf.extend_from_slice(&params.to_le_bytes());
            buf.extend_from_slice(data);
        }
        SensorPacket::HeartbeatRequest { id } | SensorPacket::HeartbeatResponse { id } => {
            buf.push(*id)
        }
        SensorPacket::Error { code } => buf.push(*code),
    }
    buf
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(id: MessageId, payload: &[u8]) -> Result<SensorPacket, ProtocolError> {
    match id {
        MessageId::Ping => expect_len(id, payload, 0).map(|_| SensorPacket::Ping),
        MessageId::DeviceDisable => expect_len(id, payload, 0).map(|_| SensorPacket::DeviceDisable),
        MessageId::SubscriptionRequest => {
            expect_len(id, payload, 4)?;
            Ok(SensorPacket::SubscriptionRequest {
                params: read_u16(payload, 0),
                delay: read_u16(payload, 2),
            })
        }
        MessageId::SubscriptionResponse => {
            expect_len(id, payload, SUBSCRIPTION_RESPONSE_SIZE)?;
            let mut raw_id = [0u8; 8];
            raw_id.copy_from_slice(&payload[7..15]);
            Ok(SensorPacket::SubscriptionResponse(SubscriptionResponse {
                params: read_u16(payload, 0),
                delay: read_u16(payload, 2),
                uid: SensorUid {
                    device_type: read_u16(payload, 4),
                    year: payload[6],
                    id: u64::from_le_bytes(raw_id),
                },
            }))
        }
        MessageId::DeviceRead => {
            expect_len(id, payload, 2)?;
            Ok(SensorPacket::DeviceRead {
                params: read_u16(payload, 0),
            })
        }
        MessageId::DeviceWrite => {
            expect_min_len(id, payload, 2)?;
            Ok(SensorPacket::DeviceWrite {
                params: read_u16(payload, 0),
                data: payload[2..].to_vec(),
            })
        }
        MessageId::DeviceData => {
            expect_min_len(id, payload, 2)?;
            Ok(SensorPacket::DeviceData {
                params: read_u16(payload, 0),
                data: payload[2..].to_vec(),
            })
        }
        MessageId::HeartbeatRequest => {
            expect_len(id, payload, 1)?;
            Ok(SensorPacket::HeartbeatRequest { id: payload[0] })
        }
        MessageId::HeartbeatResponse => {
            expect_len(id, payload, 1)?;
            Ok(SensorPacket::HeartbeatResponse { id: payload[0] })
        }
        MessageId::Error => {
            expect_len(id, payload, 1)?;
            Ok(SensorPacket::Error { code: payload[0] })
        }
    }
}

fn expect_len(kind: MessageId, payload: &[u8], len: usize) -> Result<(), ProtocolError> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(ProtocolError::MalformedPayload {
            kind,
            reason: format!("expected {len} bytes, got {}", payload.len()),
        })
    }
}

fn expect_min_len(kind: MessageId, payload: &[u8], len: usize) -> Result<(), ProtocolError> {
    if payload.len() >= len {
        Ok(())
    } else {
        Err(ProtocolError::MalformedPayload {
            kind,
            reason: format!("expected at least {len} bytes, got {}", payload.len()),
        })
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

// ── COBS ──────────────────────────────────────────────────────────────────────

fn cobs_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 254 + 2);
    let mut code_idx = 0;
    let mut code = 1u8;
    out.push(0);

    for &byte in data {
        if byte == 0 {
            out[code_idx] = code;
            code_idx = out.len();
            out.push(0);
            code = 1;
        } else {
            out.push(byte);
            code += 1;
            if code == 0xFF {
                out[code_idx] = code;
                code_idx = out.len();
                out.push(0);
                code = 1;
            }
        }
    }

    out[code_idx] = code;
    out
}

fn cobs_decode(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let code = data[i] as usize;
        if code == 0 {
            return Err(ProtocolError::InvalidFrame("zero code byte"));
        }
        i += 1;

        let end = i + code - 1;
        if end > data.len() {
            return Err(ProtocolError::InvalidFrame("block runs past end of frame"));
        }
        out.extend_from_slice(&data[i..end]);
        i = end;

        if code < 0xFF && i < data.len() {
            out.push(0);
        }
    }

    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
