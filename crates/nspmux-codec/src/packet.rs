//! Protocol packet types.
//!
//! The type digit is the first character of every structural text frame.

use crate::value::Value;

/// The default namespace.
pub const ROOT_NSP: &str = "/";

/// Protocol packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
}

impl PacketType {
    /// Wire digit for this type.
    pub fn as_digit(self) -> char {
        match self {
            PacketType::Connect => '0',
            PacketType::Disconnect => '1',
            PacketType::Event => '2',
            PacketType::Ack => '3',
            PacketType::Error => '4',
            PacketType::BinaryEvent => '5',
            PacketType::BinaryAck => '6',
        }
    }

    /// Parse a wire digit.
    pub fn from_digit(digit: char) -> Option<Self> {
        Some(match digit {
            '0' => PacketType::Connect,
            '1' => PacketType::Disconnect,
            '2' => PacketType::Event,
            '3' => PacketType::Ack,
            '4' => PacketType::Error,
            '5' => PacketType::BinaryEvent,
            '6' => PacketType::BinaryAck,
            _ => return None,
        })
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Connect => "CONNECT",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::Event => "EVENT",
            PacketType::Ack => "ACK",
            PacketType::Error => "ERROR",
            PacketType::BinaryEvent => "BINARY_EVENT",
            PacketType::BinaryAck => "BINARY_ACK",
        }
    }

    /// Returns true for types that carry binary attachments.
    pub fn is_binary(self) -> bool {
        matches!(self, PacketType::BinaryEvent | PacketType::BinaryAck)
    }

    /// Returns true for EVENT and BINARY_EVENT.
    pub fn is_event(self) -> bool {
        matches!(self, PacketType::Event | PacketType::BinaryEvent)
    }

    /// Returns true for ACK and BINARY_ACK.
    pub fn is_ack(self) -> bool {
        matches!(self, PacketType::Ack | PacketType::BinaryAck)
    }

    /// The binary counterpart of an event/ack type; other types are unchanged.
    pub fn with_binary(self, binary: bool) -> Self {
        match (self, binary) {
            (PacketType::Event | PacketType::BinaryEvent, true) => PacketType::BinaryEvent,
            (PacketType::Event | PacketType::BinaryEvent, false) => PacketType::Event,
            (PacketType::Ack | PacketType::BinaryAck, true) => PacketType::BinaryAck,
            (PacketType::Ack | PacketType::BinaryAck, false) => PacketType::Ack,
            (other, _) => other,
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded protocol packet.
///
/// For EVENT packets, `data[0]` is the event name and the rest are arguments.
/// ERROR packets carry a single value; CONNECT and DISCONNECT carry none.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub nsp: String,
    pub id: Option<u64>,
    pub data: Vec<Value>,
}

impl Packet {
    pub fn connect(nsp: impl Into<String>) -> Self {
        Self::bare(PacketType::Connect, nsp)
    }

    pub fn disconnect(nsp: impl Into<String>) -> Self {
        Self::bare(PacketType::Disconnect, nsp)
    }

    /// Build an EVENT, or BINARY_EVENT when any argument is binary.
    pub fn event(nsp: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        let binary = args.iter().any(Value::has_binary);
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::from(event));
        data.extend(args);
        Self {
            packet_type: PacketType::Event.with_binary(binary),
            nsp: nsp.into(),
            id: None,
            data,
        }
    }

    /// Build an ACK, or BINARY_ACK when any argument is binary.
    pub fn ack(nsp: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        let binary = args.iter().any(Value::has_binary);
        Self {
            packet_type: PacketType::Ack.with_binary(binary),
            nsp: nsp.into(),
            id: Some(id),
            data: args,
        }
    }

    pub fn error(nsp: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            packet_type: PacketType::Error,
            nsp: nsp.into(),
            id: None,
            data: vec![data.into()],
        }
    }

    fn bare(packet_type: PacketType, nsp: impl Into<String>) -> Self {
        Self {
            packet_type,
            nsp: nsp.into(),
            id: None,
            data: Vec::new(),
        }
    }

    /// Attach an ack id.
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// Event name of an EVENT packet.
    pub fn event_name(&self) -> Option<&str> {
        if !self.packet_type.is_event() {
            return None;
        }
        self.data.first().and_then(Value::as_str)
    }

    /// Arguments of an EVENT packet (everything after the name).
    pub fn event_args(&self) -> &[Value] {
        if self.packet_type.is_event() && !self.data.is_empty() {
            &self.data[1..]
        } else {
            &self.data
        }
    }

    /// Returns true if any payload value is binary.
    pub fn has_binary(&self) -> bool {
        self.data.iter().any(Value::has_binary)
    }
}

/// Normalize a namespace name: the empty name is the root namespace.
pub fn normalize_nsp(name: &str) -> &str {
    if name.is_empty() {
        ROOT_NSP
    } else {
        name
    }
}
