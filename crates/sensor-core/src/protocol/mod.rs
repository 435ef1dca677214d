//! Protocol module containing packet types and the binary codec.

pub mod codec;
pub mod messages;

pub use codec::{decode_packet, encode_frame, encode_packet, FrameDecoder, ProtocolError};
pub use messages::*;
