use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Result, TransportError};
use crate::traits::Frame;

/// Wire header: magic (2) + length (4) + kind (1) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Magic bytes: "NM" (0x4E 0x4D).
pub const MAGIC: [u8; 2] = [0x4E, 0x4D];

/// Kind byte for UTF-8 text frames.
pub const KIND_TEXT: u8 = 0;

/// Kind byte for binary frames.
pub const KIND_BINARY: u8 = 1;

/// Default maximum frame payload: 16 MiB.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Configuration for the stream wire codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_frame_size: usize,
    /// Queued outbound frames at which the transport reports congestion.
    pub outbound_high_water: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME,
            outbound_high_water: 256,
        }
    }
}

/// Encode a frame into the stream wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B)   │ Length    │ Kind     │ Payload          │
/// │ 0x4E 0x4D    │ (4B LE)   │ (1B)     │ (Length bytes)   │
/// │ "NM"         │           │ 0 text   │                  │
/// │              │           │ 1 binary │                  │
/// └──────────────┴───────────┴──────────┴─────────────────┘
/// ```
pub fn encode_wire(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let (kind, payload): (u8, &[u8]) = match frame {
        Frame::Text(text) => (KIND_TEXT, text.as_bytes()),
        Frame::Binary(bytes) => (KIND_BINARY, bytes.as_ref()),
    };
    if payload.len() > u32::MAX as usize {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u8(kind);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_wire(src: &mut BytesMut, max_frame: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(TransportError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let kind = src[6];

    if payload_len > max_frame {
        return Err(TransportError::FrameTooLarge {
            size: payload_len,
            max: max_frame,
        });
    }
    if kind != KIND_TEXT && kind != KIND_BINARY {
        return Err(TransportError::UnknownKind(kind));
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    if kind == KIND_TEXT {
        let text = String::from_utf8(payload.to_vec()).map_err(|_| TransportError::InvalidUtf8)?;
        Ok(Some(Frame::Text(text)))
    } else {
        Ok(Some(Frame::Binary(payload)))
    }
}

/// `tokio_util` codec for the stream wire format.
#[derive(Debug, Clone)]
pub struct WireCodec {
    max_frame: usize,
}

impl WireCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_wire(src, self.max_frame)
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame,
            });
        }
        encode_wire(&item, dst)
    }
}
