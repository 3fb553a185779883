//! Packet codec for nspmux.
//!
//! Every packet is one structural text frame:
//! - a type digit (CONNECT, DISCONNECT, EVENT, ACK, ERROR, BINARY_EVENT, BINARY_ACK)
//! - for binary types, the attachment count followed by `-`
//! - the namespace followed by `,` when it is not `/`
//! - an optional decimal ack id
//! - an optional JSON payload
//!
//! Binary packets are followed by their attachments as raw binary frames.
//! The [`Decoder`] is stateful and buffers those frames until the packet is
//! whole.

pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod packet;
pub mod value;

pub use config::{CodecConfig, DEFAULT_MAX_ATTACHMENTS, DEFAULT_MAX_FRAME_SIZE};
pub use decoder::{Decoded, Decoder};
pub use encoder::encode_packet;
pub use error::{ProtocolError, Result};
pub use packet::{normalize_nsp, Packet, PacketType, ROOT_NSP};
pub use value::Value;
