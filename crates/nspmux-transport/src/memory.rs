//! In-process transport backed by tokio channels.
//!
//! [`pair`] returns the server-side [`Connection`] together with a
//! [`MemoryPeer`] that plays the remote end: it sends frames in, receives the
//! frames the server wrote, and can inject errors, close the link, or force
//! the outbound buffer into a congested state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{
    ensure_open, Connection, Frame, ReadyState, SharedState, Transport, TransportEvent,
    TransportRequest, WriteOptions,
};

/// Default number of queued outbound frames before the transport reports congestion.
pub const DEFAULT_OUTBOUND_HIGH_WATER: usize = 64;

/// Default inbound event queue capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// Configuration for an in-memory transport pair.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Queued outbound frames at which `writable()` turns false.
    pub outbound_high_water: usize,
    /// Capacity of the inbound event queue.
    pub inbound_capacity: usize,
    /// Request metadata reported by the server side.
    pub request: TransportRequest,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            outbound_high_water: DEFAULT_OUTBOUND_HIGH_WATER,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            request: TransportRequest {
                url: "/".to_string(),
                address: "memory".to_string(),
                ..TransportRequest::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct Congestion {
    pending: AtomicUsize,
    forced: AtomicBool,
}

type Outbound = (Frame, WriteOptions);

/// Server side of an in-memory connection.
pub struct MemoryTransport {
    id: String,
    request: TransportRequest,
    state: SharedState,
    congestion: Arc<Congestion>,
    high_water: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::Sender<TransportEvent>,
}

impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn request(&self) -> &TransportRequest {
        &self.request
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn writable(&self) -> bool {
        !self.congestion.forced.load(Ordering::Acquire)
            && self.congestion.pending.load(Ordering::Acquire) < self.high_water
    }

    fn write(&self, frame: Frame, opts: WriteOptions) -> Result<()> {
        ensure_open(&self.state)?;
        self.congestion.pending.fetch_add(1, Ordering::AcqRel);
        self.outbound.send((frame, opts)).map_err(|_| {
            self.congestion.pending.fetch_sub(1, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    fn close(&self) {
        if self.state.close() {
            debug!(id = %self.id, "closing memory transport");
            let _ = self
                .events
                .try_send(TransportEvent::Close("forced close".to_string()));
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Remote end of an in-memory connection.
pub struct MemoryPeer {
    id: String,
    state: SharedState,
    congestion: Arc<Congestion>,
    inbound: mpsc::Sender<TransportEvent>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// Id shared with the server-side transport.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Deliver a frame to the server side.
    pub async fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        ensure_open(&self.state)?;
        self.inbound
            .send(TransportEvent::Data(frame.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Receive the next frame written by the server side.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.recv_with_options().await.map(|(frame, _)| frame)
    }

    /// Receive the next frame together with the options it was written with.
    pub async fn recv_with_options(&mut self) -> Option<(Frame, WriteOptions)> {
        let item = self.outbound.recv().await?;
        self.congestion.pending.fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }

    /// Receive an already-queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        let (frame, _) = self.outbound.try_recv().ok()?;
        self.congestion.pending.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Force (or clear) outbound congestion regardless of queue depth.
    pub fn set_congested(&self, congested: bool) {
        self.congestion.forced.store(congested, Ordering::Release);
    }

    /// Surface a transport error on the server side.
    pub async fn inject_error(&self, err: TransportError) -> Result<()> {
        self.inbound
            .send(TransportEvent::Error(err))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Close the connection from the remote side.
    pub async fn close(&self, reason: &str) {
        if self.state.close() {
            let _ = self
                .inbound
                .send(TransportEvent::Close(reason.to_string()))
                .await;
        }
    }

    /// Returns true once either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.state.get() == ReadyState::Closed
    }
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Create a connected in-memory transport pair.
pub fn pair(config: MemoryConfig) -> (Connection, MemoryPeer) {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let state = SharedState::new(ReadyState::Open);
    let congestion = Arc::new(Congestion::default());
    let (event_tx, event_rx) = mpsc::channel(config.inbound_capacity.max(1));
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let transport = MemoryTransport {
        id: id.clone(),
        request: config.request,
        state: state.clone(),
        congestion: Arc::clone(&congestion),
        high_water: config.outbound_high_water,
        outbound: out_tx,
        events: event_tx.clone(),
    };

    let peer = MemoryPeer {
        id,
        state,
        congestion,
        inbound: event_tx,
        outbound: out_rx,
    };

    (Connection::new(Arc::new(transport), event_rx), peer)
}
