use std::sync::Arc;

use nspmux_codec::{encode_packet, Packet, Value};

use crate::adapter::{BroadcastOptions, Room, Sid};
use crate::error::Result;
use crate::namespace::Namespace;
use crate::socket::ensure_not_reserved;

/// Immutable description of one broadcast.
///
/// Every builder method returns a new operator, so targets and flags never
/// leak from one emit into the next.
#[derive(Clone)]
pub struct BroadcastOperator {
    targets: Vec<Arc<Namespace>>,
    opts: BroadcastOptions,
}

impl BroadcastOperator {
    pub(crate) fn new(targets: Vec<Arc<Namespace>>) -> Self {
        Self {
            targets,
            opts: BroadcastOptions::default(),
        }
    }

    pub fn to(mut self, room: impl Into<Room>) -> Self {
        self.opts.rooms.insert(room.into());
        self
    }

    pub fn in_(self, room: impl Into<Room>) -> Self {
        self.to(room)
    }

    /// Skip members of `room`.
    pub fn except(mut self, room: impl Into<Room>) -> Self {
        self.opts.except.insert(room.into());
        self
    }

    /// Skip recipients whose transport is congested.
    pub fn volatile(mut self) -> Self {
        self.opts.flags.volatile = true;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.opts.flags.compress = compress;
        self
    }

    /// Restrict delivery to this node.
    pub fn local(mut self) -> Self {
        self.opts.flags.local = true;
        self
    }

    pub fn options(&self) -> &BroadcastOptions {
        &self.opts
    }

    /// Encode once per namespace and deliver to every selected socket.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        ensure_not_reserved(event)?;
        for nsp in &self.targets {
            let frames = encode_packet(&Packet::event(nsp.name(), event, args.clone()))?;
            nsp.broadcast_encoded(&frames, &self.opts)?;
        }
        Ok(())
    }

    /// Broadcast `message`.
    pub fn send(&self, args: Vec<Value>) -> Result<()> {
        self.emit("message", args)
    }

    pub fn write(&self, args: Vec<Value>) -> Result<()> {
        self.send(args)
    }

    /// Ids of the sockets this operator would reach, sorted.
    pub fn clients(&self) -> Vec<Sid> {
        let mut ids: Vec<Sid> = Vec::new();
        for nsp in &self.targets {
            let excluded = if self.opts.except.is_empty() {
                Default::default()
            } else {
                nsp.adapter().sockets(&self.opts.except)
            };
            ids.extend(
                nsp.adapter()
                    .sockets(&self.opts.rooms)
                    .into_iter()
                    .filter(|sid| !excluded.contains(sid)),
            );
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

impl std::fmt::Debug for BroadcastOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.targets.iter().map(|nsp| nsp.name()).collect();
        f.debug_struct("BroadcastOperator")
            .field("targets", &names)
            .field("opts", &self.opts)
            .finish()
    }
}
