//! Per-namespace endpoint of one connection.
//!
//! A socket starts `Pending` while the namespace middleware runs, becomes
//! `Connected` once admitted, and ends `Disconnected` after a local
//! `disconnect` or a close/error reported by its client. Handlers registered
//! with [`Socket::on`] run on the owning client's task, one packet at a time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use nspmux_codec::{Packet, PacketType, Value, ROOT_NSP};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::adapter::{Room, Sid};
use crate::broadcast::BroadcastOperator;
use crate::client::{Client, SendOptions};
use crate::error::{AckError, Error, Result};
use crate::handshake::Handshake;
use crate::namespace::Namespace;

/// Event names applications cannot emit.
pub const RESERVED_EVENTS: &[&str] = &[
    "connect",
    "connect_error",
    "disconnect",
    "disconnecting",
    "error",
    "newListener",
    "removeListener",
];

/// Handler for a named application event.
pub type EventHandler = Arc<dyn Fn(&Arc<Socket>, Vec<Value>, Option<AckSender>) + Send + Sync>;

/// Handler invoked for every application event, with its name.
pub type AnyHandler =
    Arc<dyn Fn(&Arc<Socket>, &str, Vec<Value>, Option<AckSender>) + Send + Sync>;

/// Handler for `disconnecting` and `disconnect`, receiving the reason.
pub type DisconnectHandler = Arc<dyn Fn(&Arc<Socket>, &str) + Send + Sync>;

/// Handler for errors reported on the socket.
pub type ErrorHandler = Arc<dyn Fn(&Arc<Socket>, &Error) + Send + Sync>;

/// Resolves to the arguments of the correlated ACK.
pub type AckFuture = BoxFuture<'static, std::result::Result<Vec<Value>, AckError>>;

type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send>;

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created; middleware still running.
    Pending,
    /// Admitted; can send and receive.
    Connected,
    /// Teardown started; rooms not yet cleared.
    Disconnecting,
    /// Terminal.
    Disconnected,
}

#[derive(Default)]
struct Handlers {
    events: HashMap<String, Vec<EventHandler>>,
    any: Vec<AnyHandler>,
    disconnecting: Vec<DisconnectHandler>,
    disconnect: Vec<DisconnectHandler>,
    error: Vec<ErrorHandler>,
}

/// One connection's membership in one namespace.
pub struct Socket {
    id: Sid,
    nsp: Arc<Namespace>,
    client: Arc<Client>,
    handshake: Handshake,
    state: Mutex<SocketState>,
    acks: Mutex<HashMap<u64, AckCallback>>,
    next_ack: AtomicU64,
    handlers: RwLock<Handlers>,
}

impl Socket {
    pub(crate) fn new(nsp: Arc<Namespace>, client: Arc<Client>, handshake: Handshake) -> Arc<Self> {
        let id = if nsp.name() == ROOT_NSP {
            client.id().to_string()
        } else {
            format!("{}#{}", nsp.name(), client.id())
        };
        Arc::new(Self {
            id,
            nsp,
            client,
            handshake,
            state: Mutex::new(SocketState::Pending),
            acks: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            handlers: RwLock::new(Handlers::default()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nsp(&self) -> &Arc<Namespace> {
        &self.nsp
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    pub fn connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    /// Number of emitted acks still waiting for a reply.
    pub fn pending_acks(&self) -> usize {
        self.acks.lock().len()
    }

    // -- handler registration --

    /// Listen for a named application event.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&Arc<Socket>, Vec<Value>, Option<AckSender>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .events
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Listen for every application event.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &str, Vec<Value>, Option<AckSender>) + Send + Sync + 'static,
    {
        self.handlers.write().any.push(Arc::new(handler));
    }

    /// Runs before rooms are cleared; `rooms()` still reports membership.
    pub fn on_disconnecting<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &str) + Send + Sync + 'static,
    {
        self.handlers.write().disconnecting.push(Arc::new(handler));
    }

    /// Runs after the socket left every room and its namespace.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &str) + Send + Sync + 'static,
    {
        self.handlers.write().disconnect.push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Arc<Socket>, &Error) + Send + Sync + 'static,
    {
        self.handlers.write().error.push(Arc::new(handler));
    }

    // -- emitting --

    /// Send an event to this socket's client.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.emitter().emit(event, args)
    }

    /// Emit `message`.
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        self.emit("message", args)
    }

    /// Alias of [`Socket::send`].
    pub fn write(&self, args: Vec<Value>) -> Result<()> {
        self.send(args)
    }

    /// Emit with per-call send options.
    pub fn volatile(&self) -> SocketEmitter<'_> {
        self.emitter().volatile()
    }

    pub fn compress(&self, compress: bool) -> SocketEmitter<'_> {
        self.emitter().compress(compress)
    }

    fn emitter(&self) -> SocketEmitter<'_> {
        SocketEmitter {
            socket: self,
            opts: SendOptions::default(),
        }
    }

    /// Emit an event and invoke `callback` with the client's ACK arguments.
    ///
    /// The callback runs at most once. With an ack timeout configured it is
    /// dropped unanswered once the timeout passes.
    pub fn emit_with_callback<F>(
        self: &Arc<Self>,
        event: &str,
        args: Vec<Value>,
        callback: F,
    ) -> Result<u64>
    where
        F: FnOnce(Vec<Value>) + Send + 'static,
    {
        ensure_not_reserved(event)?;
        self.ensure_not_disconnected()?;
        let id = self.register_ack(Box::new(callback));
        let packet = Packet::event(self.nsp.name(), event, args).with_id(id);
        if let Err(err) = self.client.packet(&packet, SendOptions::default()) {
            self.acks.lock().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Emit an event and return a future resolving to the ACK arguments.
    ///
    /// The event is written before this returns; only the reply is awaited.
    pub fn emit_with_ack(self: &Arc<Self>, event: &str, args: Vec<Value>) -> Result<AckFuture> {
        let (tx, rx) = oneshot::channel();
        let started = tokio::time::Instant::now();
        let limit = self.client.config().ack_timeout;
        self.emit_with_callback(event, args, move |reply| {
            let _ = tx.send(reply);
        })?;
        Ok(Box::pin(async move {
            match rx.await {
                Ok(reply) => Ok(reply),
                Err(_) => match limit {
                    Some(limit) if started.elapsed() >= limit => Err(AckError::Timeout(limit)),
                    _ => Err(AckError::Disconnected),
                },
            }
        }))
    }

    fn register_ack(self: &Arc<Self>, callback: AckCallback) -> u64 {
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        self.acks.lock().insert(id, callback);
        if let Some(limit) = self.client.config().ack_timeout {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let socket = Arc::downgrade(self);
                    runtime.spawn(async move {
                        tokio::time::sleep(limit).await;
                        if let Some(socket) = socket.upgrade() {
                            if socket.acks.lock().remove(&id).is_some() {
                                debug!(sid = %socket.id, ack = id, "ack expired");
                            }
                        }
                    });
                }
                Err(_) => warn!(sid = %self.id, ack = id, "no runtime available; ack will not expire"),
            }
        }
        id
    }

    fn packet(&self, packet: &Packet, opts: SendOptions) -> Result<()> {
        self.client.packet(packet, opts)
    }

    fn ensure_not_disconnected(&self) -> Result<()> {
        if self.state() == SocketState::Disconnected {
            return Err(Error::Disconnected(self.id.clone()));
        }
        Ok(())
    }

    // -- rooms --

    /// Join a room. Joining a room twice is a no-op.
    ///
    /// Fails once the socket is disconnected.
    pub fn join(&self, room: impl Into<Room>) -> Result<()> {
        let room: Room = room.into();
        self.join_all([room])
    }

    pub fn join_all<I>(&self, rooms: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Room>,
    {
        self.ensure_not_disconnected()?;
        let rooms: Vec<Room> = rooms.into_iter().map(Into::into).collect();
        debug!(sid = %self.id, ?rooms, "joining rooms");
        self.nsp.adapter().add_all(&self.id, &rooms)?;
        Ok(())
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        debug!(sid = %self.id, room, "leaving room");
        self.nsp.adapter().del(&self.id, room)?;
        Ok(())
    }

    pub fn leave_all(&self) -> Result<()> {
        self.nsp.adapter().del_all(&self.id)?;
        Ok(())
    }

    /// Rooms this socket is in, including its own-id room.
    pub fn rooms(&self) -> HashSet<Room> {
        self.nsp.adapter().rooms_of(&self.id)
    }

    // -- broadcasting --

    /// Broadcast to the namespace, skipping this socket.
    pub fn broadcast(&self) -> BroadcastOperator {
        BroadcastOperator::new(vec![Arc::clone(&self.nsp)]).except(self.id.clone())
    }

    /// Broadcast to `room`, skipping this socket.
    pub fn to(&self, room: impl Into<Room>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    pub fn in_(&self, room: impl Into<Room>) -> BroadcastOperator {
        self.to(room)
    }

    // -- lifecycle --

    /// Leave the namespace. With `close`, tear down the whole connection.
    pub fn disconnect(self: &Arc<Self>, close: bool) {
        if !self.connected() {
            return;
        }
        if close {
            self.client.disconnect();
        } else {
            if let Err(err) = self.packet(&Packet::disconnect(self.nsp.name()), SendOptions::default()) {
                debug!(sid = %self.id, error = %err, "failed to send disconnect");
            }
            self.handle_close("server namespace disconnect");
        }
    }

    /// Admission finished: join the own-id room and confirm to the client.
    pub(crate) fn handle_connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != SocketState::Pending {
                return Err(Error::Disconnected(self.id.clone()));
            }
            *state = SocketState::Connected;
        }
        debug!(sid = %self.id, nsp = %self.nsp.name(), "socket connected");
        self.join(self.id.clone())?;
        self.packet(&Packet::connect(self.nsp.name()), SendOptions::default())
    }

    pub(crate) fn handle_packet(self: &Arc<Self>, packet: Packet) {
        if !self.connected() {
            debug!(sid = %self.id, packet_type = %packet.packet_type, "socket not connected; dropping packet");
            return;
        }
        match packet.packet_type {
            PacketType::Event | PacketType::BinaryEvent => self.handle_event(packet),
            PacketType::Ack | PacketType::BinaryAck => self.handle_ack(packet),
            PacketType::Disconnect => {
                debug!(sid = %self.id, "got disconnect packet");
                self.handle_close("client namespace disconnect");
            }
            PacketType::Error => {
                let value = packet.data.into_iter().next().unwrap_or_default();
                self.handle_error(&Error::Remote(value));
            }
            PacketType::Connect => {
                debug!(sid = %self.id, "ignoring CONNECT for connected socket");
            }
        }
    }

    fn handle_event(self: &Arc<Self>, packet: Packet) {
        let id = packet.id;
        let mut data = packet.data.into_iter();
        let Some(Value::String(event)) = data.next() else {
            return;
        };
        if RESERVED_EVENTS.contains(&event.as_str()) {
            debug!(sid = %self.id, event = %event, "ignoring reserved event from client");
            return;
        }
        let args: Vec<Value> = data.collect();

        let (named, any) = {
            let handlers = self.handlers.read();
            (
                handlers.events.get(&event).cloned().unwrap_or_default(),
                handlers.any.clone(),
            )
        };
        if named.is_empty() && any.is_empty() {
            debug!(sid = %self.id, event = %event, "no handler for event");
            return;
        }

        let ack = id.map(|id| AckSender::new(Arc::clone(self), id));
        for handler in &named {
            handler(self, args.clone(), ack.clone());
        }
        for handler in &any {
            handler(self, &event, args.clone(), ack.clone());
        }
    }

    fn handle_ack(&self, packet: Packet) {
        let Some(id) = packet.id else {
            return;
        };
        let callback = self.acks.lock().remove(&id);
        match callback {
            Some(callback) => {
                debug!(sid = %self.id, ack = id, "calling ack");
                callback(packet.data);
            }
            None => debug!(sid = %self.id, ack = id, "bad ack"),
        }
    }

    pub(crate) fn handle_error(self: &Arc<Self>, err: &Error) {
        let handlers = self.handlers.read().error.clone();
        if handlers.is_empty() {
            warn!(sid = %self.id, error = %err, "unhandled socket error");
            return;
        }
        for handler in &handlers {
            handler(self, err);
        }
    }

    /// Tear down. Idempotent; only a connected socket transitions.
    pub(crate) fn handle_close(self: &Arc<Self>, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state != SocketState::Connected {
                return;
            }
            *state = SocketState::Disconnecting;
        }
        debug!(sid = %self.id, nsp = %self.nsp.name(), reason, "closing socket");

        let disconnecting = self.handlers.read().disconnecting.clone();
        for handler in &disconnecting {
            handler(self, reason);
        }

        if let Err(err) = self.leave_all() {
            warn!(sid = %self.id, error = %err, "failed to leave rooms");
        }
        self.nsp.remove(self);
        self.client.remove(self);
        self.acks.lock().clear();
        *self.state.lock() = SocketState::Disconnected;

        let disconnect = self.handlers.read().disconnect.clone();
        for handler in &disconnect {
            handler(self, reason);
        }
        self.discard();
    }

    /// Drop handlers and room membership so nothing keeps this socket reachable.
    pub(crate) fn discard(&self) {
        {
            let mut state = self.state.lock();
            if *state == SocketState::Pending {
                *state = SocketState::Disconnected;
            }
        }
        if let Err(err) = self.leave_all() {
            warn!(sid = %self.id, error = %err, "failed to leave rooms");
        }
        *self.handlers.write() = Handlers::default();
        self.acks.lock().clear();
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("nsp", &self.nsp.name())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) fn ensure_not_reserved(event: &str) -> Result<()> {
    if RESERVED_EVENTS.contains(&event) {
        return Err(Error::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Single-socket emit with send options.
#[derive(Debug)]
pub struct SocketEmitter<'a> {
    socket: &'a Socket,
    opts: SendOptions,
}

impl SocketEmitter<'_> {
    /// Drop the event if the transport is congested.
    pub fn volatile(mut self) -> Self {
        self.opts.volatile = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.compress = compress;
        self
    }

    pub fn emit(self, event: &str, args: Vec<Value>) -> Result<()> {
        ensure_not_reserved(event)?;
        self.socket.ensure_not_disconnected()?;
        let packet = Packet::event(self.socket.nsp.name(), event, args);
        self.socket.packet(&packet, self.opts)
    }
}

/// Replies to an event that carried an ack id.
///
/// Clones share one "sent" flag, so only the first reply goes out.
#[derive(Clone)]
pub struct AckSender {
    socket: Arc<Socket>,
    id: u64,
    sent: Arc<AtomicBool>,
}

impl AckSender {
    fn new(socket: Arc<Socket>, id: u64) -> Self {
        Self {
            socket,
            id,
            sent: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send the ACK. Later calls on any clone are ignored.
    pub fn send(self, args: Vec<Value>) -> Result<()> {
        if self.sent.swap(true, Ordering::AcqRel) {
            debug!(sid = %self.socket.id, ack = self.id, "ack already sent");
            return Ok(());
        }
        self.socket.ensure_not_disconnected()?;
        debug!(sid = %self.socket.id, ack = self.id, "sending ack");
        let packet = Packet::ack(self.socket.nsp.name(), self.id, args);
        self.socket.packet(&packet, SendOptions::default())
    }
}

impl fmt::Debug for AckSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckSender")
            .field("sid", &self.socket.id)
            .field("id", &self.id)
            .field("sent", &self.sent.load(Ordering::Acquire))
            .finish()
    }
}
