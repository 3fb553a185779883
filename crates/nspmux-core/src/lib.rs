//! Namespaces, rooms, middleware, and acknowledgements over one transport.
//!
//! A [`Server`] owns named [`Namespace`]s. Each transport connection handed
//! to [`Server::attach`] gets a [`Client`] that decodes its frames, admits a
//! [`Socket`] per requested namespace through the namespace middleware, and
//! routes packets to those sockets in arrival order.

pub mod adapter;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod namespace;
pub mod parent;
pub mod server;
pub mod socket;

pub use adapter::{Adapter, BroadcastFlags, BroadcastOptions, MemoryAdapter, Room, Sid};
pub use broadcast::BroadcastOperator;
pub use client::{Client, ClientHandle, SendOptions, FORCED_CLOSE};
pub use config::{ServerConfig, DEFAULT_MAX_CONNECT_BUFFER};
pub use error::{AckError, AdapterError, AdmissionError, Error, Result};
pub use handshake::{Handshake, Query};
pub use namespace::{ConnectionHandler, Middleware, Namespace, MIDDLEWARE_FAILED};
pub use parent::{Matcher, ParentNamespace, Predicate};
pub use server::{AdapterFactory, Server};
pub use socket::{
    AckFuture, AckSender, AnyHandler, DisconnectHandler, ErrorHandler, EventHandler, Socket,
    SocketEmitter, SocketState, RESERVED_EVENTS,
};
