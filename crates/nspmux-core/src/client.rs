//! Connection multiplexer.
//!
//! One [`Client`] per transport connection. A dedicated task owns the packet
//! decoder and the connect buffer and processes, in order, transport events
//! and the client's own mailbox: deferred packet deliveries, middleware
//! outcomes, and dynamic namespace lookups. Everything a socket handler does
//! therefore runs serialized with the rest of its connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nspmux_codec::{encode_packet, normalize_nsp, Decoded, Decoder, Packet, PacketType, ROOT_NSP};
use nspmux_transport::{
    Connection, EventReceiver, Frame, ReadyState, Transport, TransportEvent, TransportRequest,
    WriteOptions,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::adapter::Sid;
use crate::config::ServerConfig;
use crate::error::{AdmissionError, Error, Result};
use crate::handshake::{parse_connect_nsp, Query};
use crate::namespace::Namespace;
use crate::server::Server;
use crate::socket::Socket;

/// Reason reported when the server closes a connection itself.
pub const FORCED_CLOSE: &str = "forced server close";

/// Per-write delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Drop instead of writing while the transport is congested.
    pub volatile: bool,
    /// Passed through to the transport.
    pub compress: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            volatile: false,
            compress: true,
        }
    }
}

/// Work re-entering the client task.
pub(crate) enum Command {
    /// Hand a decoded packet to its socket.
    Deliver { socket: Arc<Socket>, packet: Packet },
    /// Middleware for `socket` finished.
    Admitted {
        socket: Arc<Socket>,
        result: std::result::Result<(), AdmissionError>,
    },
    /// Dynamic namespace lookup for `name` finished.
    Resolved {
        name: String,
        query: Query,
        nsp: Option<Arc<Namespace>>,
    },
}

#[derive(Default)]
struct Endpoints {
    nsps: HashMap<String, Arc<Socket>>,
    sockets: HashMap<Sid, Arc<Socket>>,
}

/// The multiplexer for one transport connection.
pub struct Client {
    id: String,
    transport: Arc<dyn Transport>,
    config: Arc<ServerConfig>,
    endpoints: Mutex<Endpoints>,
    commands: mpsc::UnboundedSender<Command>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Client {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &TransportRequest {
        self.transport.request()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns true while the transport is open and the client not torn down.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.transport.ready_state() == ReadyState::Open
    }

    /// Socket connected on `nsp`, if any.
    pub fn socket(&self, nsp: &str) -> Option<Arc<Socket>> {
        self.endpoints.lock().nsps.get(normalize_nsp(nsp)).cloned()
    }

    /// Every connected socket of this client.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.endpoints.lock().sockets.values().cloned().collect()
    }

    /// Encode and write a packet.
    ///
    /// Silently drops the packet when the transport is not open, or when it
    /// is volatile and the transport is congested.
    pub fn packet(&self, packet: &Packet, opts: SendOptions) -> Result<()> {
        if !self.is_open() {
            debug!(client = %self.id, packet_type = %packet.packet_type, nsp = %packet.nsp, "ignoring packet write");
            return Ok(());
        }
        if opts.volatile && !self.transport.writable() {
            debug!(client = %self.id, nsp = %packet.nsp, "transport congested; dropping volatile packet");
            return Ok(());
        }
        trace!(client = %self.id, packet_type = %packet.packet_type, nsp = %packet.nsp, "writing packet");
        let frames = encode_packet(packet)?;
        self.write_frames(&frames, opts);
        Ok(())
    }

    /// Write frames that were encoded once for many recipients.
    pub fn write_encoded(&self, frames: &[Frame], opts: SendOptions) {
        if !self.is_open() {
            debug!(client = %self.id, "ignoring broadcast write");
            return;
        }
        if opts.volatile && !self.transport.writable() {
            debug!(client = %self.id, "transport congested; dropping volatile broadcast");
            return;
        }
        self.write_frames(frames, opts);
    }

    fn write_frames(&self, frames: &[Frame], opts: SendOptions) {
        let write_opts = WriteOptions {
            compress: opts.compress,
        };
        for frame in frames {
            if let Err(err) = self.transport.write(frame.clone(), write_opts) {
                debug!(client = %self.id, error = %err, "transport write failed");
                return;
            }
        }
    }

    /// Disconnect every socket, then close the transport.
    pub fn disconnect(&self) {
        for socket in self.sockets() {
            socket.disconnect(false);
        }
        self.close();
    }

    /// Close the transport and tear down without waiting for its close event.
    pub fn close(&self) {
        if self.transport.ready_state() == ReadyState::Open {
            debug!(client = %self.id, "forcing transport close");
            self.transport.close();
            self.handle_close(FORCED_CLOSE);
        }
    }

    pub(crate) fn post(&self, command: Command) {
        if self.commands.send(command).is_err() {
            trace!(client = %self.id, "client task gone; dropping command");
        }
    }

    pub(crate) fn register(&self, socket: &Arc<Socket>) {
        let mut endpoints = self.endpoints.lock();
        endpoints
            .sockets
            .insert(socket.id().to_string(), Arc::clone(socket));
        endpoints
            .nsps
            .insert(socket.nsp().name().to_string(), Arc::clone(socket));
    }

    /// Forget `socket`. Removing twice is a no-op.
    pub(crate) fn remove(&self, socket: &Socket) {
        let mut endpoints = self.endpoints.lock();
        if endpoints.sockets.remove(socket.id()).is_some() {
            endpoints.nsps.remove(socket.nsp().name());
        } else {
            debug!(client = %self.id, sid = %socket.id(), "ignoring remove");
        }
    }

    /// Forward `err` to every socket, then close the connection.
    pub(crate) fn handle_error(&self, err: Error, reason: &str) {
        warn!(client = %self.id, error = %err, "connection error");
        for socket in self.sockets() {
            socket.handle_error(&err);
        }
        if self.transport.ready_state() == ReadyState::Open {
            self.transport.close();
        }
        self.handle_close(reason);
    }

    /// Tear down every socket. Later calls are no-ops.
    pub(crate) fn handle_close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(client = %self.id, reason, "client close");
        let sockets: Vec<Arc<Socket>> = {
            let mut endpoints = self.endpoints.lock();
            endpoints.nsps.clear();
            endpoints.sockets.drain().map(|(_, socket)| socket).collect()
        };
        for socket in sockets {
            socket.handle_close(reason);
        }
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("transport", &self.transport.name())
            .field("open", &self.is_open())
            .field("sockets", &self.endpoints.lock().sockets.len())
            .finish()
    }
}

/// Handle to a running client task.
#[derive(Debug)]
pub struct ClientHandle {
    client: Arc<Client>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn id(&self) -> &str {
        self.client.id()
    }

    /// Wait for the client task to finish.
    pub async fn closed(self) {
        if let Err(err) = self.task.await {
            warn!(client = %self.client.id(), error = %err, "client task failed");
        }
    }
}

/// Start the client task for `connection` and connect it to `/`.
pub(crate) fn spawn(server: Server, connection: Connection) -> ClientHandle {
    let Connection { transport, events } = connection;
    let (tx, rx) = mpsc::unbounded_channel();
    let config = server.shared_config();
    let client = Arc::new(Client {
        id: transport.id().to_string(),
        transport,
        config: Arc::clone(&config),
        endpoints: Mutex::new(Endpoints::default()),
        commands: tx,
        closed: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
    });
    server.register_client(Arc::clone(&client));

    let task = ClientTask {
        server,
        client: Arc::clone(&client),
        events,
        commands: rx,
        decoder: Decoder::with_config(config.codec),
        connect_buffer: VecDeque::new(),
        pending: HashSet::new(),
    };
    let task = tokio::spawn(task.run());
    ClientHandle { client, task }
}

struct ClientTask {
    server: Server,
    client: Arc<Client>,
    events: EventReceiver,
    commands: mpsc::UnboundedReceiver<Command>,
    decoder: Decoder,
    /// Namespaces requested before `/` was connected, in arrival order.
    connect_buffer: VecDeque<(String, Query)>,
    /// Namespaces whose middleware is still running.
    pending: HashSet<String>,
}

impl ClientTask {
    async fn run(mut self) {
        debug!(client = %self.client.id, transport = self.client.transport.name(), "client connected");
        self.connect(ROOT_NSP.to_string(), Query::new());

        let shutdown = self.client.shutdown.clone();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command),
                event = self.events.recv() => match event {
                    Some(TransportEvent::Data(frame)) => self.on_frame(frame),
                    Some(TransportEvent::Error(err)) => {
                        self.client.handle_error(Error::Transport(err), "transport error");
                    }
                    Some(TransportEvent::Close(reason)) => {
                        self.client.handle_close(&reason);
                        break;
                    }
                    None => {
                        self.client.handle_close("transport close");
                        break;
                    }
                },
            }
        }

        if let Err(err) = self.decoder.finish() {
            debug!(client = %self.client.id, error = %err, "discarding partial packet");
        }
        self.decoder.reset();
        self.server.remove_client(&self.client.id);
        debug!(client = %self.client.id, "client task finished");
    }

    fn on_frame(&mut self, frame: Frame) {
        match self.decoder.decode(frame) {
            Ok(Decoded::Packet(packet)) => self.on_packet(packet),
            Ok(Decoded::Pending { remaining }) => {
                trace!(client = %self.client.id, remaining, "awaiting binary attachments");
            }
            Err(err) => self.client.handle_error(Error::Protocol(err), "parse error"),
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        if packet.packet_type == PacketType::Connect {
            let (name, query) = parse_connect_nsp(&packet.nsp);
            self.connect(name, query);
            return;
        }
        match self.client.socket(&packet.nsp) {
            // Delivered on the next turn of the loop, behind earlier packets.
            Some(socket) => self.client.post(Command::Deliver { socket, packet }),
            None => debug!(client = %self.client.id, nsp = %packet.nsp, "no socket for namespace"),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Deliver { socket, packet } => socket.handle_packet(packet),
            Command::Admitted { socket, result } => self.on_admitted(socket, result),
            Command::Resolved { name, query, nsp } => match nsp {
                Some(nsp) => {
                    debug!(client = %self.client.id, nsp = %name, "dynamic namespace created");
                    self.do_connect(nsp, query);
                }
                None => self.reject_namespace(&name),
            },
        }
    }

    fn connect(&mut self, name: String, query: Query) {
        if let Some(nsp) = self.server.namespace(&name) {
            debug!(client = %self.client.id, nsp = %name, "connecting to namespace");
            self.do_connect(nsp, query);
            return;
        }
        if !self.server.has_dynamic_namespaces() {
            self.reject_namespace(&name);
            return;
        }

        let server = self.server.clone();
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let nsp = server.check_namespace(&name, &query).await;
            client.post(Command::Resolved { name, query, nsp });
        });
    }

    fn do_connect(&mut self, nsp: Arc<Namespace>, query: Query) {
        let name = nsp.name();
        if name != ROOT_NSP && self.client.socket(ROOT_NSP).is_none() {
            if self.connect_buffer.len() >= self.client.config.max_connect_buffer {
                warn!(client = %self.client.id, nsp = %name, "connect buffer full");
                self.send_error(name, "Connect buffer full".into());
                return;
            }
            debug!(client = %self.client.id, nsp = %name, "buffering connect until / is connected");
            self.connect_buffer.push_back((name.to_string(), query));
            return;
        }
        if self.client.socket(name).is_some() || !self.pending.insert(name.to_string()) {
            debug!(client = %self.client.id, nsp = %name, "namespace already connected or connecting");
            return;
        }
        nsp.add(&self.client, &query);
    }

    fn on_admitted(&mut self, socket: Arc<Socket>, result: std::result::Result<(), AdmissionError>) {
        let nsp = Arc::clone(socket.nsp());
        self.pending.remove(nsp.name());

        if !self.client.is_open() {
            debug!(client = %self.client.id, nsp = %nsp.name(), "middleware finished after the client closed; discarding socket");
            socket.discard();
            return;
        }
        if let Err(err) = result {
            debug!(client = %self.client.id, nsp = %nsp.name(), error = %err, "middleware rejected socket");
            socket.discard();
            self.send_error(nsp.name(), err.payload());
            return;
        }

        nsp.admit(&socket);
        self.client.register(&socket);
        if let Err(err) = socket.handle_connect() {
            warn!(sid = %socket.id(), error = %err, "failed to connect socket");
            nsp.remove(&socket);
            self.client.remove(&socket);
            socket.discard();
            self.send_error(nsp.name(), err.to_string().into());
            return;
        }

        if nsp.name() == ROOT_NSP && !self.connect_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.connect_buffer);
            debug!(client = %self.client.id, count = buffered.len(), "replaying buffered connects");
            for (name, query) in buffered {
                self.connect(name, query);
            }
        }

        nsp.notify_connection(&socket);
    }

    fn reject_namespace(&self, name: &str) {
        debug!(client = %self.client.id, nsp = %name, "invalid namespace");
        self.send_error(name, "Invalid namespace".into());
    }

    fn send_error(&self, nsp: &str, data: nspmux_codec::Value) {
        if let Err(err) = self.client.packet(&Packet::error(nsp, data), SendOptions::default()) {
            warn!(client = %self.client.id, nsp = %nsp, error = %err, "failed to send error packet");
        }
    }
}
