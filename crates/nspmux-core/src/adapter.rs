//! Room membership and broadcast fan-out.
//!
//! Each namespace owns one adapter. The in-memory adapter keeps two indexes
//! behind `parking_lot` locks so joins, leaves, and broadcasts from different
//! connections can run concurrently.

use std::collections::{HashMap, HashSet};

use nspmux_transport::Frame;
use parking_lot::RwLock;

use crate::error::AdapterError;

/// Socket id within a namespace.
pub type Sid = String;

/// Room name within a namespace.
pub type Room = String;

/// Per-emit flags carried to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastFlags {
    /// Drop for recipients whose transport is congested.
    pub volatile: bool,
    /// Ask the transport to compress the frames.
    pub compress: bool,
    /// Deliver only to sockets on this node (meaningful for distributed adapters).
    pub local: bool,
}

impl Default for BroadcastFlags {
    fn default() -> Self {
        Self {
            volatile: false,
            compress: true,
            local: false,
        }
    }
}

/// Target selection for one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Rooms to reach; empty means every socket in the namespace.
    pub rooms: HashSet<Room>,
    /// Members of these rooms are skipped.
    pub except: HashSet<Room>,
    pub flags: BroadcastFlags,
}

/// Pluggable room storage.
pub trait Adapter: Send + Sync + 'static {
    /// Add `sid` to every room in `rooms`. Joining twice is a no-op.
    fn add_all(&self, sid: &str, rooms: &[Room]) -> Result<(), AdapterError>;

    /// Remove `sid` from `room`.
    fn del(&self, sid: &str, room: &str) -> Result<(), AdapterError>;

    /// Remove `sid` from every room.
    fn del_all(&self, sid: &str) -> Result<(), AdapterError>;

    /// Rooms `sid` currently belongs to.
    fn rooms_of(&self, sid: &str) -> HashSet<Room>;

    /// Sockets in any of `rooms`, or every known socket when `rooms` is empty.
    fn sockets(&self, rooms: &HashSet<Room>) -> HashSet<Sid>;

    /// Hand `frames` to every selected socket via `deliver`.
    ///
    /// The frames are encoded once by the caller; each recipient is visited
    /// at most once even when it is in several target rooms.
    fn broadcast(
        &self,
        frames: &[Frame],
        opts: &BroadcastOptions,
        deliver: &mut dyn FnMut(&str, &[Frame]),
    ) -> Result<(), AdapterError>;
}

#[derive(Debug, Default)]
struct Rooms {
    by_room: HashMap<Room, HashSet<Sid>>,
    by_sid: HashMap<Sid, HashSet<Room>>,
}

/// Single-process adapter.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    rooms: RwLock<Rooms>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().by_room.len()
    }

    fn recipients(&self, opts: &BroadcastOptions) -> Vec<Sid> {
        let rooms = self.rooms.read();
        let excluded: HashSet<&Sid> = opts
            .except
            .iter()
            .filter_map(|room| rooms.by_room.get(room))
            .flatten()
            .collect();

        let mut seen = HashSet::new();
        let candidates: Box<dyn Iterator<Item = &Sid> + '_> = if opts.rooms.is_empty() {
            Box::new(rooms.by_sid.keys())
        } else {
            Box::new(
                opts.rooms
                    .iter()
                    .filter_map(|room| rooms.by_room.get(room))
                    .flatten(),
            )
        };
        candidates
            .filter(|sid| !excluded.contains(sid))
            .filter(|sid| seen.insert(*sid))
            .cloned()
            .collect()
    }
}

impl Adapter for MemoryAdapter {
    fn add_all(&self, sid: &str, rooms: &[Room]) -> Result<(), AdapterError> {
        let mut state = self.rooms.write();
        for room in rooms {
            state
                .by_sid
                .entry(sid.to_string())
                .or_default()
                .insert(room.clone());
            state
                .by_room
                .entry(room.clone())
                .or_default()
                .insert(sid.to_string());
        }
        Ok(())
    }

    fn del(&self, sid: &str, room: &str) -> Result<(), AdapterError> {
        let mut state = self.rooms.write();
        if let Some(joined) = state.by_sid.get_mut(sid) {
            joined.remove(room);
            if joined.is_empty() {
                state.by_sid.remove(sid);
            }
        }
        if let Some(members) = state.by_room.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                state.by_room.remove(room);
            }
        }
        Ok(())
    }

    fn del_all(&self, sid: &str) -> Result<(), AdapterError> {
        let mut state = self.rooms.write();
        let Some(joined) = state.by_sid.remove(sid) else {
            return Ok(());
        };
        for room in joined {
            if let Some(members) = state.by_room.get_mut(&room) {
                members.remove(sid);
                if members.is_empty() {
                    state.by_room.remove(&room);
                }
            }
        }
        Ok(())
    }

    fn rooms_of(&self, sid: &str) -> HashSet<Room> {
        self.rooms
            .read()
            .by_sid
            .get(sid)
            .cloned()
            .unwrap_or_default()
    }

    fn sockets(&self, rooms: &HashSet<Room>) -> HashSet<Sid> {
        let state = self.rooms.read();
        if rooms.is_empty() {
            return state.by_sid.keys().cloned().collect();
        }
        rooms
            .iter()
            .filter_map(|room| state.by_room.get(room))
            .flatten()
            .cloned()
            .collect()
    }

    fn broadcast(
        &self,
        frames: &[Frame],
        opts: &BroadcastOptions,
        deliver: &mut dyn FnMut(&str, &[Frame]),
    ) -> Result<(), AdapterError> {
        // Resolve under the lock, deliver without it.
        for sid in self.recipients(opts) {
            deliver(&sid, frames);
        }
        Ok(())
    }
}
