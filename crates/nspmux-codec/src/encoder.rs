use std::fmt::Write as _;

use bytes::Bytes;
use nspmux_transport::Frame;

use crate::error::{ProtocolError, Result};
use crate::packet::{Packet, PacketType, ROOT_NSP};
use crate::value::Value;

/// Key marking a binary placeholder object.
pub const PLACEHOLDER_KEY: &str = "_placeholder";

/// Key holding the attachment index of a placeholder.
pub const PLACEHOLDER_NUM: &str = "num";

/// Encode a packet into frames.
///
/// Text frame layout:
/// ```text
/// <type digit>[<attachments>-][<nsp>,][<ack id>][<json>]
/// ```
/// Binary blobs anywhere in the payload are replaced by
/// `{"_placeholder":true,"num":N}` and follow the structural frame as raw
/// binary frames, in payload order. EVENT/ACK types are upgraded to their
/// binary variants when attachments are present.
pub fn encode_packet(packet: &Packet) -> Result<Vec<Frame>> {
    let mut attachments = Vec::new();
    let body = match packet.packet_type {
        PacketType::Connect | PacketType::Disconnect => {
            if !packet.data.is_empty() {
                return Err(ProtocolError::InvalidPayload(format!(
                    "{} packets carry no payload",
                    packet.packet_type
                )));
            }
            None
        }
        PacketType::Error => {
            if packet.has_binary() {
                return Err(ProtocolError::InvalidPayload(
                    "ERROR packets cannot carry binary data".to_string(),
                ));
            }
            packet
                .data
                .first()
                .map(|value| deconstruct(value, &mut attachments))
        }
        _ => Some(serde_json::Value::Array(
            packet
                .data
                .iter()
                .map(|value| deconstruct(value, &mut attachments))
                .collect(),
        )),
    };

    let packet_type = packet.packet_type.with_binary(!attachments.is_empty());

    let mut text = String::new();
    text.push(packet_type.as_digit());
    if packet_type.is_binary() {
        let _ = write!(text, "{}-", attachments.len());
    }
    if !packet.nsp.is_empty() && packet.nsp != ROOT_NSP {
        text.push_str(&packet.nsp);
        text.push(',');
    }
    if let Some(id) = packet.id.filter(|_| packet_type != PacketType::Error) {
        let _ = write!(text, "{id}");
    }
    if let Some(body) = body {
        text.push_str(&serde_json::to_string(&body)?);
    }

    let mut frames = Vec::with_capacity(1 + attachments.len());
    frames.push(Frame::Text(text));
    frames.extend(attachments.into_iter().map(Frame::Binary));
    Ok(frames)
}

fn deconstruct(value: &Value, attachments: &mut Vec<Bytes>) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Binary(bytes) => {
            let num = attachments.len();
            attachments.push(bytes.clone());
            let mut placeholder = serde_json::Map::new();
            placeholder.insert(PLACEHOLDER_KEY.to_string(), serde_json::Value::Bool(true));
            placeholder.insert(PLACEHOLDER_NUM.to_string(), serde_json::Value::from(num));
            serde_json::Value::Object(placeholder)
        }
        Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|item| deconstruct(item, attachments))
                .collect(),
        ),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), deconstruct(item, attachments)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn text(frames: &[Frame]) -> &str {
        match &frames[0] {
            Frame::Text(text) => text,
            Frame::Binary(_) => panic!("first frame must be text"),
        }
    }

    #[test]
    fn encodes_root_event() {
        let packet = Packet::event("/", "hi", vec![Value::from(1), Value::from("two")]);
        let frames = encode_packet(&packet).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(text(&frames), r#"2["hi",1,"two"]"#);
    }

    #[test]
    fn encodes_namespace_and_ack_id() {
        let packet = Packet::event("/chat", "hi", vec![]).with_id(12);
        let frames = encode_packet(&packet).unwrap();
        assert_eq!(text(&frames), r#"2/chat,12["hi"]"#);
    }

    #[test]
    fn encodes_connect_and_disconnect() {
        assert_eq!(text(&encode_packet(&Packet::connect("/")).unwrap()), "0");
        assert_eq!(text(&encode_packet(&Packet::connect("/chat")).unwrap()), "0/chat,");
        assert_eq!(text(&encode_packet(&Packet::disconnect("/chat")).unwrap()), "1/chat,");
    }

    #[test]
    fn encodes_error_as_single_value() {
        let packet = Packet::error("/nope", "Invalid namespace");
        assert_eq!(text(&encode_packet(&packet).unwrap()), r#"4/nope,"Invalid namespace""#);

        let packet = Packet::error("/", Value::from(json!({"code": 3})));
        assert_eq!(text(&encode_packet(&packet).unwrap()), r#"4{"code":3}"#);
    }

    #[test]
    fn binary_payload_becomes_placeholders_and_frames() {
        let packet = Packet::event(
            "/files",
            "upload",
            vec![
                Value::from(Bytes::from_static(b"first")),
                Value::from(json!({"name": "a.txt"})),
                Value::Array(vec![Value::from(Bytes::from_static(b"second"))]),
            ],
        );
        let frames = encode_packet(&packet).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(
            text(&frames),
            r#"52-/files,["upload",{"_placeholder":true,"num":0},{"name":"a.txt"},[{"_placeholder":true,"num":1}]]"#
        );
        assert_eq!(frames[1], Frame::Binary(Bytes::from_static(b"first")));
        assert_eq!(frames[2], Frame::Binary(Bytes::from_static(b"second")));
    }

    #[test]
    fn plain_type_upgraded_when_binary_present() {
        let packet = Packet {
            packet_type: PacketType::Ack,
            nsp: "/".to_string(),
            id: Some(4),
            data: vec![Value::from(vec![9u8])],
        };
        let frames = encode_packet(&packet).unwrap();
        assert_eq!(text(&frames), r#"61-4[{"_placeholder":true,"num":0}]"#);
    }

    #[test]
    fn rejects_payload_on_connect() {
        let mut packet = Packet::connect("/");
        packet.data.push(Value::from(1));
        assert!(matches!(
            encode_packet(&packet),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }
}
