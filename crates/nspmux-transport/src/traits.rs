use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Result, TransportError};

/// One message unit carried by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Raw binary frame.
    Binary(Bytes),
}

impl Frame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true for binary frames.
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<Bytes> for Frame {
    fn from(bytes: Bytes) -> Self {
        Frame::Binary(bytes)
    }
}

/// Lifecycle state of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Opening,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            ReadyState::Opening => 0,
            ReadyState::Open => 1,
            ReadyState::Closing => 2,
            ReadyState::Closed => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ReadyState::Opening,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Atomic cell holding a [`ReadyState`], shared between a transport and its tasks.
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state.as_u8())))
    }

    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    /// Move to `Closed`. Returns true only for the caller that performed the transition.
    pub fn close(&self) -> bool {
        self.0.swap(ReadyState::Closed.as_u8(), Ordering::AcqRel) != ReadyState::Closed.as_u8()
    }
}

/// Per-write options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Whether the transport may compress this frame.
    pub compress: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self { compress: true }
    }
}

/// Inbound notification emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame arrived.
    Data(Frame),
    /// The connection failed.
    Error(TransportError),
    /// The connection closed, with a reason.
    Close(String),
}

/// Request metadata captured when the transport connection was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportRequest {
    /// Request URL (path and query) used to open the connection.
    pub url: String,
    /// Request headers, lower-cased keys.
    pub headers: HashMap<String, String>,
    /// Remote address as reported by the transport.
    pub address: String,
    /// Whether the connection is encrypted.
    pub secure: bool,
}

/// Receiving half of a transport's inbound events.
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// A bidirectional, frame-oriented connection.
///
/// Writes never block: frames are queued on the transport's outbound buffer,
/// and [`Transport::writable`] reports whether that buffer is congested.
pub trait Transport: Send + Sync + 'static {
    /// Unique connection id.
    fn id(&self) -> &str;

    /// Metadata of the request that opened this connection.
    fn request(&self) -> &TransportRequest;

    /// Current lifecycle state.
    fn ready_state(&self) -> ReadyState;

    /// False while the outbound buffer is congested.
    fn writable(&self) -> bool;

    /// Queue one frame for sending.
    fn write(&self, frame: Frame, opts: WriteOptions) -> Result<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    /// Transport name for diagnostics.
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// An opened connection: the transport plus its inbound event stream.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: EventReceiver,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, events: EventReceiver) -> Self {
        Self { transport, events }
    }

    /// Id of the underlying transport.
    pub fn id(&self) -> &str {
        self.transport.id()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.transport.id())
            .field("transport", &self.transport.name())
            .field("ready_state", &self.transport.ready_state())
            .finish()
    }
}

/// Rejects writes on anything but an open transport.
pub(crate) fn ensure_open(state: &SharedState) -> Result<()> {
    if state.get() == ReadyState::Open {
        Ok(())
    } else {
        Err(TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_state_close_transitions_once() {
        let state = SharedState::new(ReadyState::Open);
        assert!(state.close());
        assert!(!state.close());
        assert_eq!(state.get(), ReadyState::Closed);
    }

    #[test]
    fn frame_len_and_kind() {
        let text = Frame::from("hello");
        let binary = Frame::from(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(text.len(), 5);
        assert!(!text.is_binary());
        assert_eq!(binary.len(), 3);
        assert!(binary.is_binary());
        assert!(Frame::Text(String::new()).is_empty());
    }

    #[test]
    fn ensure_open_rejects_closed() {
        let state = SharedState::new(ReadyState::Closed);
        assert!(matches!(ensure_open(&state), Err(TransportError::Closed)));
        state.set(ReadyState::Open);
        assert!(ensure_open(&state).is_ok());
    }
}
