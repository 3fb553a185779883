use bytes::Bytes;
use nspmux_transport::Frame;
use tracing::trace;

use crate::config::CodecConfig;
use crate::encoder::{PLACEHOLDER_KEY, PLACEHOLDER_NUM};
use crate::error::{ProtocolError, Result};
use crate::packet::{Packet, PacketType, ROOT_NSP};
use crate::value::Value;

/// Outcome of feeding one frame to the [`Decoder`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete packet.
    Packet(Packet),
    /// A binary packet is being reassembled; this many frames are still due.
    Pending { remaining: usize },
}

/// Structural part of a binary packet whose attachments are still arriving.
#[derive(Debug)]
struct Reconstruction {
    packet_type: PacketType,
    nsp: String,
    id: Option<u64>,
    body: Option<serde_json::Value>,
    expected: usize,
    attachments: Vec<Bytes>,
}

impl Reconstruction {
    fn remaining(&self) -> usize {
        self.expected - self.attachments.len()
    }
}

/// Stateful packet decoder. One instance per connection; never shared.
///
/// Text frames carry structural packets. A binary packet declares an
/// attachment count and the decoder then buffers that many binary frames
/// before yielding the reassembled [`Packet`].
#[derive(Debug, Default)]
pub struct Decoder {
    config: CodecConfig,
    pending: Option<Reconstruction>,
}

impl Decoder {
    /// Create a decoder with default limits.
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    /// Create a decoder with explicit limits.
    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    /// Feed one frame.
    ///
    /// Any error leaves the decoder reset; the caller is expected to tear the
    /// connection down.
    pub fn decode(&mut self, frame: Frame) -> Result<Decoded> {
        let result = self.decode_inner(frame);
        if result.is_err() {
            self.pending = None;
        }
        result
    }

    fn decode_inner(&mut self, frame: Frame) -> Result<Decoded> {
        if frame.len() > self.config.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.config.max_frame_size,
            });
        }

        match frame {
            Frame::Text(text) => {
                if let Some(pending) = &self.pending {
                    return Err(ProtocolError::UnexpectedText {
                        remaining: pending.remaining(),
                    });
                }
                self.decode_text(&text)
            }
            Frame::Binary(bytes) => {
                let Some(mut pending) = self.pending.take() else {
                    return Err(ProtocolError::UnexpectedBinary);
                };
                pending.attachments.push(bytes);
                if pending.remaining() > 0 {
                    let remaining = pending.remaining();
                    self.pending = Some(pending);
                    return Ok(Decoded::Pending { remaining });
                }
                trace!(attachments = pending.expected, "binary packet reassembled");
                finish_reconstruction(pending).map(Decoded::Packet)
            }
        }
    }

    fn decode_text(&mut self, text: &str) -> Result<Decoded> {
        let digit = text.chars().next().ok_or(ProtocolError::EmptyFrame)?;
        let packet_type = PacketType::from_digit(digit).ok_or(ProtocolError::UnknownType(digit))?;

        let mut cursor = 1;
        let mut expected = 0usize;
        if packet_type.is_binary() {
            let rest = &text[cursor..];
            let dash = rest.find('-').ok_or(ProtocolError::InvalidAttachments)?;
            let digits = &rest[..dash];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ProtocolError::InvalidAttachments);
            }
            expected = digits
                .parse::<usize>()
                .map_err(|_| ProtocolError::InvalidAttachments)?;
            if expected > self.config.max_attachments {
                return Err(ProtocolError::TooManyAttachments {
                    count: expected,
                    max: self.config.max_attachments,
                });
            }
            cursor += dash + 1;
        }

        let mut nsp = ROOT_NSP.to_string();
        if text[cursor..].starts_with('/') {
            let rest = &text[cursor..];
            match rest.find(',') {
                Some(comma) => {
                    nsp = rest[..comma].to_string();
                    cursor += comma + 1;
                }
                None => {
                    nsp = rest.to_string();
                    cursor = text.len();
                }
            }
        }

        // ERROR packets never carry an id, so leading digits belong to the payload.
        let id_len = if packet_type == PacketType::Error {
            0
        } else {
            text[cursor..]
                .bytes()
                .take_while(u8::is_ascii_digit)
                .count()
        };
        let id = if id_len > 0 {
            let raw = &text[cursor..cursor + id_len];
            cursor += id_len;
            Some(
                raw.parse::<u64>()
                    .map_err(|_| ProtocolError::InvalidPayload(format!("ack id {raw} out of range")))?,
            )
        } else {
            None
        };

        let rest = &text[cursor..];
        let body = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<serde_json::Value>(rest)?)
        };

        validate_body(packet_type, body.as_ref())?;

        let reconstruction = Reconstruction {
            packet_type,
            nsp,
            id,
            body,
            expected,
            attachments: Vec::with_capacity(expected),
        };

        if packet_type.is_binary() && expected > 0 {
            self.pending = Some(reconstruction);
            return Ok(Decoded::Pending {
                remaining: expected,
            });
        }
        finish_reconstruction(reconstruction).map(Decoded::Packet)
    }

    /// Signal end of stream. Errors if a binary packet is incomplete.
    pub fn finish(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(pending) => Err(ProtocolError::Incomplete {
                remaining: pending.remaining(),
            }),
            None => Ok(()),
        }
    }

    /// Drop any partially reassembled packet.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Returns true while binary attachments are outstanding.
    pub fn is_reconstructing(&self) -> bool {
        self.pending.is_some()
    }

    /// Current decoder limits.
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }
}

fn validate_body(packet_type: PacketType, body: Option<&serde_json::Value>) -> Result<()> {
    match packet_type {
        PacketType::Connect | PacketType::Disconnect => {
            if body.is_some() {
                return Err(ProtocolError::InvalidPayload(format!(
                    "{packet_type} packets carry no payload"
                )));
            }
        }
        PacketType::Event | PacketType::BinaryEvent => match body {
            Some(serde_json::Value::Array(items))
                if matches!(items.first(), Some(serde_json::Value::String(_))) => {}
            _ => {
                return Err(ProtocolError::InvalidPayload(
                    "event payload must be an array starting with the event name".to_string(),
                ))
            }
        },
        PacketType::Ack | PacketType::BinaryAck => {
            if !matches!(body, Some(serde_json::Value::Array(_))) {
                return Err(ProtocolError::InvalidPayload(
                    "ack payload must be an array".to_string(),
                ));
            }
        }
        PacketType::Error => {}
    }
    Ok(())
}

fn finish_reconstruction(reconstruction: Reconstruction) -> Result<Packet> {
    let Reconstruction {
        packet_type,
        nsp,
        id,
        body,
        attachments,
        ..
    } = reconstruction;

    if packet_type.is_ack() && id.is_none() {
        return Err(ProtocolError::InvalidPayload(
            "ack packet without an ack id".to_string(),
        ));
    }

    let mut used = vec![false; attachments.len()];
    let data = match body {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) if packet_type != PacketType::Error => items
            .into_iter()
            .map(|item| reconstruct(item, &attachments, &mut used))
            .collect::<Result<Vec<_>>>()?,
        Some(value) => vec![reconstruct(value, &attachments, &mut used)?],
    };
    let referenced = used.iter().filter(|seen| **seen).count();
    if referenced != attachments.len() {
        return Err(ProtocolError::UnusedAttachments {
            referenced,
            count: attachments.len(),
        });
    }

    Ok(Packet {
        packet_type,
        nsp,
        id,
        data,
    })
}

/// Replace placeholders with attachments, marking each one used.
fn reconstruct(
    value: serde_json::Value,
    attachments: &[Bytes],
    used: &mut [bool],
) -> Result<Value> {
    match value {
        serde_json::Value::Array(items) => Ok(Value::Array(
            items
                .into_iter()
                .map(|item| reconstruct(item, attachments, used))
                .collect::<Result<Vec<_>>>()?,
        )),
        serde_json::Value::Object(map) => {
            if let Some(num) = placeholder_num(&map) {
                let index = usize::try_from(num).unwrap_or(usize::MAX);
                let bytes = attachments.get(index).cloned().ok_or(
                    ProtocolError::InvalidPlaceholder {
                        num,
                        count: attachments.len(),
                    },
                )?;
                used[index] = true;
                return Ok(Value::Binary(bytes));
            }
            Ok(Value::Object(
                map.into_iter()
                    .map(|(key, item)| Ok((key, reconstruct(item, attachments, used)?)))
                    .collect::<Result<_>>()?,
            ))
        }
        other => Ok(Value::from(other)),
    }
}

fn placeholder_num(map: &serde_json::Map<String, serde_json::Value>) -> Option<u64> {
    if map.get(PLACEHOLDER_KEY) != Some(&serde_json::Value::Bool(true)) {
        return None;
    }
    map.get(PLACEHOLDER_NUM).and_then(serde_json::Value::as_u64)
}
