//! Namespaces, rooms, middleware, and acknowledgements multiplexed over a
//! single realtime connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: frame transports (in-memory pair, Unix domain sockets)
//! - [`codec`]: packet text format and binary attachment reassembly
//! - the crate root re-exports [`nspmux_core`]: server, namespaces, sockets,
//!   rooms, and broadcasting
//!
//! ```no_run
//! use nspmux::{codec::Value, Server};
//!
//! let server = Server::default();
//! server.of("/chat").on_connection(|socket| {
//!     socket.on("hello", |socket, args, ack| {
//!         let _ = socket.emit("hello", args.clone());
//!         if let Some(ack) = ack {
//!             let _ = ack.send(vec![Value::from("ok")]);
//!         }
//!     });
//! });
//! ```

pub use nspmux_core::*;

/// Re-export transport types.
pub mod transport {
    pub use nspmux_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use nspmux_codec::*;
}
