//! Namespace registry and broadcast bus.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use nspmux_codec::Value;
use nspmux_transport::Frame;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::adapter::{Adapter, BroadcastOptions, Room, Sid};
use crate::broadcast::BroadcastOperator;
use crate::client::{Client, Command, SendOptions};
use crate::error::{AdmissionError, Result};
use crate::handshake::{Handshake, Query};
use crate::socket::Socket;

/// ERROR payload sent when a middleware step panics.
pub const MIDDLEWARE_FAILED: &str = "Middleware failed";

/// One admission step. Resolve `Err` to reject the socket.
pub type Middleware =
    Arc<dyn Fn(Arc<Socket>) -> BoxFuture<'static, std::result::Result<(), AdmissionError>> + Send + Sync>;

/// Called with each newly admitted socket.
pub type ConnectionHandler = Arc<dyn Fn(&Arc<Socket>) + Send + Sync>;

pub(crate) fn boxed_middleware<F, Fut>(middleware: F) -> Middleware
where
    F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), AdmissionError>> + Send + 'static,
{
    Arc::new(move |socket: Arc<Socket>| middleware(socket).boxed())
}

/// Run `chain` in order, stopping at the first rejection.
/// Run `chain` in order, stopping at the first rejection.
///
/// A panicking step rejects the socket like an `Err` would.
pub(crate) async fn run_chain(
    chain: &[Middleware],
    socket: &Arc<Socket>,
) -> std::result::Result<(), AdmissionError> {
    let steps = async {
        for step in chain {
            step(Arc::clone(socket)).await?;
        }
        Ok::<(), AdmissionError>(())
    };
    match AssertUnwindSafe(steps).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            warn!(sid = %socket.id(), nsp = %socket.nsp().name(), "middleware panicked");
            Err(AdmissionError::new(MIDDLEWARE_FAILED))
        }
    }
}

/// A named channel shared by every connection.
pub struct Namespace {
    name: String,
    adapter: Arc<dyn Adapter>,
    middleware: RwLock<Vec<Middleware>>,
    connection_handlers: RwLock<Vec<ConnectionHandler>>,
    sockets: RwLock<HashMap<Sid, Weak<Socket>>>,
}

impl Namespace {
    pub(crate) fn new(name: String, adapter: Arc<dyn Adapter>) -> Arc<Self> {
        Self::with_inherited(name, adapter, Vec::new(), Vec::new())
    }

    pub(crate) fn with_inherited(
        name: String,
        adapter: Arc<dyn Adapter>,
        middleware: Vec<Middleware>,
        connection_handlers: Vec<ConnectionHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            adapter,
            middleware: RwLock::new(middleware),
            connection_handlers: RwLock::new(connection_handlers),
            sockets: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    /// Append an admission step. Steps run in registration order for every
    /// connection attempt that starts afterwards.
    pub fn use_middleware<F, Fut>(&self, middleware: F) -> &Self
    where
        F: Fn(Arc<Socket>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), AdmissionError>> + Send + 'static,
    {
        self.middleware.write().push(boxed_middleware(middleware));
        self
    }

    /// Register a handler fired for every admitted socket.
    pub fn on_connection<F>(&self, handler: F) -> &Self
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        self.connection_handlers.write().push(Arc::new(handler));
        self
    }

    /// Run the middleware chain against `socket`.
    pub async fn run(&self, socket: &Arc<Socket>) -> std::result::Result<(), AdmissionError> {
        let chain = self.middleware.read().clone();
        run_chain(&chain, socket).await
    }

    /// Create a pending socket for `client` and start admission.
    ///
    /// The outcome always re-enters the client's mailbox, so registration
    /// happens on a later turn of its loop. An empty chain skips the spawn.
    pub(crate) fn add(self: &Arc<Self>, client: &Arc<Client>, query: &Query) -> Arc<Socket> {
        debug!(nsp = %self.name, client = %client.id(), "adding socket");
        let handshake = Handshake::new(client.request(), query);
        let socket = Socket::new(Arc::clone(self), Arc::clone(client), handshake);

        let chain = self.middleware.read().clone();
        if chain.is_empty() {
            client.post(Command::Admitted {
                socket: Arc::clone(&socket),
                result: Ok(()),
            });
            return socket;
        }

        let client = Arc::clone(client);
        let candidate = Arc::clone(&socket);
        tokio::spawn(async move {
            let result = run_chain(&chain, &candidate).await;
            client.post(Command::Admitted {
                socket: candidate,
                result,
            });
        });
        socket
    }

    /// Track an admitted socket.
    pub(crate) fn admit(&self, socket: &Arc<Socket>) {
        self.sockets
            .write()
            .insert(socket.id().to_string(), Arc::downgrade(socket));
    }

    pub(crate) fn notify_connection(&self, socket: &Arc<Socket>) {
        let handlers = self.connection_handlers.read().clone();
        for handler in &handlers {
            handler(socket);
        }
    }

    /// Stop tracking `socket`. Removing twice is a no-op.
    pub fn remove(&self, socket: &Socket) {
        if self.sockets.write().remove(socket.id()).is_none() {
            debug!(nsp = %self.name, sid = %socket.id(), "ignoring remove");
        }
    }

    /// Look up a connected socket by id.
    pub fn socket(&self, sid: &str) -> Option<Arc<Socket>> {
        self.sockets
            .read()
            .get(sid)
            .and_then(Weak::upgrade)
            .filter(|socket| socket.connected())
    }

    /// Connected sockets.
    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.sockets
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|socket| socket.connected())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sockets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -- broadcasting --

    fn operator(self: &Arc<Self>) -> BroadcastOperator {
        BroadcastOperator::new(vec![Arc::clone(self)])
    }

    /// Target a room for the next broadcast built from the returned operator.
    pub fn to(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.operator().to(room)
    }

    pub fn in_(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.to(room)
    }

    pub fn except(self: &Arc<Self>, room: impl Into<Room>) -> BroadcastOperator {
        self.operator().except(room)
    }

    pub fn volatile(self: &Arc<Self>) -> BroadcastOperator {
        self.operator().volatile()
    }

    pub fn compress(self: &Arc<Self>, compress: bool) -> BroadcastOperator {
        self.operator().compress(compress)
    }

    pub fn local(self: &Arc<Self>) -> BroadcastOperator {
        self.operator().local()
    }

    /// Broadcast an event to every socket in the namespace.
    pub fn emit(self: &Arc<Self>, event: &str, args: Vec<Value>) -> Result<()> {
        self.operator().emit(event, args)
    }

    /// Broadcast `message`.
    pub fn send(self: &Arc<Self>, args: Vec<Value>) -> Result<()> {
        self.operator().send(args)
    }

    pub fn write(self: &Arc<Self>, args: Vec<Value>) -> Result<()> {
        self.send(args)
    }

    /// Ids of every socket in the namespace.
    pub fn clients(self: &Arc<Self>) -> Vec<Sid> {
        self.operator().clients()
    }

    /// Fan pre-encoded frames out to the sockets selected by `opts`.
    pub(crate) fn broadcast_encoded(&self, frames: &[Frame], opts: &BroadcastOptions) -> Result<()> {
        let send = SendOptions {
            volatile: opts.flags.volatile,
            compress: opts.flags.compress,
        };
        self.adapter.broadcast(frames, opts, &mut |sid: &str, frames: &[Frame]| {
            if let Some(socket) = self.socket(sid) {
                socket.client().write_encoded(frames, send);
            }
        })?;
        Ok(())
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("middleware", &self.middleware.read().len())
            .field("sockets", &self.sockets.read().len())
            .finish()
    }
}
