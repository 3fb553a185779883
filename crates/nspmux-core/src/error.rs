use std::time::Duration;

use nspmux_codec::{ProtocolError, Value};
use nspmux_transport::TransportError;

/// Errors surfaced by namespaces, sockets, and the connection multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed frame. Fatal for the connection it arrived on.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection-level error from the transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Middleware rejected a connecting socket.
    #[error("admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// No static or dynamic namespace matches the requested name.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// Applications may not emit lifecycle event names.
    #[error("\"{0}\" is a reserved event name")]
    ReservedEvent(String),

    /// The socket has already been torn down.
    #[error("socket {0} is disconnected")]
    Disconnected(String),

    /// Room storage failed.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// The remote end sent an ERROR packet.
    #[error("remote error: {0:?}")]
    Remote(Value),
}

/// Rejection produced by a middleware step.
///
/// The client receives an ERROR packet carrying `data` when present,
/// otherwise `message`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct AdmissionError {
    pub message: String,
    pub data: Option<Value>,
}

impl AdmissionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data sent to the client instead of the message.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Payload of the ERROR packet sent to the client.
    pub fn payload(&self) -> Value {
        self.data
            .clone()
            .unwrap_or_else(|| Value::from(self.message.as_str()))
    }
}

/// Failure reported by a room adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct AdapterError(pub String);

/// Why an awaited acknowledgement never arrived.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    #[error("ack timed out after {0:?}")]
    Timeout(Duration),

    #[error("socket disconnected before the ack arrived")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
