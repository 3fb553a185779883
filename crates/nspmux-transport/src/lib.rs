//! Frame-oriented transport contract for nspmux.
//!
//! The multiplexing core consumes a connection as a [`Transport`] (outbound
//! writes, close, congestion and ready-state queries) plus a stream of
//! [`TransportEvent`]s (inbound frames, errors, close). This crate defines that
//! contract and ships two implementations:
//! - [`memory`]: an in-process pair for tests and embedding
//! - [`uds`]: Unix domain sockets framed by [`wire::WireCodec`] (Unix only)

pub mod error;
pub mod memory;
pub mod traits;
pub mod wire;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::{pair, MemoryConfig, MemoryPeer};
pub use traits::{
    Connection, EventReceiver, Frame, ReadyState, Transport, TransportEvent, TransportRequest,
    WriteOptions,
};
pub use wire::{WireCodec, WireConfig};

#[cfg(unix)]
pub use uds::{connect, UdsListener};
