// Per-tab map from room to its shared, reference-counted connection record.
//
// The record itself lives inside the room actor; the registry only keeps
// the channels to it and the consumer count. A record is created on the
// first acquire and removed when the count returns to zero, so a later
// acquire starts fresh instead of resurrecting stale state. Each record
// carries an epoch so a reference taken before `shutdown` can never
// release a record created after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use livecount_common::types::Room;

use crate::facade::PresenceState;
use crate::poller::OnlineFetcher;
use crate::room::{self, RoomCommand, RoomDeps};

struct RoomEntry {
    epoch: u64,
    refs: usize,
    commands: mpsc::UnboundedSender<RoomCommand>,
    state: watch::Receiver<PresenceState>,
    task: JoinHandle<()>,
}

/// What an acquire hands back to the facade.
pub(crate) struct Lease {
    pub epoch: u64,
    pub commands: mpsc::UnboundedSender<RoomCommand>,
    pub state: watch::Receiver<PresenceState>,
}

/// Release side of the registry, object-safe so handles stay non-generic.
pub(crate) trait Releaser: Send + Sync {
    fn release(&self, room: &Room, epoch: u64);
}

pub struct ConnectionRegistry<F: OnlineFetcher> {
    deps: RoomDeps<F>,
    rooms: Mutex<HashMap<Room, RoomEntry>>,
    next_epoch: AtomicU64,
}

impl<F: OnlineFetcher> ConnectionRegistry<F> {
    pub(crate) fn new(deps: RoomDeps<F>) -> Self {
        Self { deps, rooms: Mutex::new(HashMap::new()), next_epoch: AtomicU64::new(0) }
    }

    /// Take a reference on `room`, spawning its actor if needed. The 0→1
    /// transition asks the actor to establish presence.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn acquire(&self, room: &Room) -> Lease {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms.entry(room.clone()).or_insert_with(|| {
            debug!(room = %room, "creating connection record");
            let spawned = room::spawn(room.clone(), &self.deps);
            RoomEntry {
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                refs: 0,
                commands: spawned.commands,
                state: spawned.state,
                task: spawned.task,
            }
        });
        entry.refs += 1;
        if entry.refs == 1 && entry.commands.send(RoomCommand::EnsurePresence).is_err() {
            warn!(room = %room, "room actor is gone; presence not requested");
        }
        Lease { epoch: entry.epoch, commands: entry.commands.clone(), state: entry.state.clone() }
    }

    /// Number of live consumers of `room`.
    pub fn ref_count(&self, room: &Room) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        rooms.get(room).map_or(0, |entry| entry.refs)
    }

    /// Rooms with at least one consumer.
    pub fn rooms(&self) -> Vec<Room> {
        let rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<Room> = rooms.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Tear down every room regardless of outstanding references. Later
    /// releases of those references are no-ops.
    pub fn shutdown(&self) {
        let drained: Vec<(Room, RoomEntry)> = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            rooms.drain().collect()
        };
        for (room, entry) in drained {
            debug!(room = %room, refs = entry.refs, "shutting down room");
            if entry.commands.send(RoomCommand::Shutdown).is_err() {
                warn!(room = %room, "room actor already gone at shutdown");
                entry.task.abort();
            }
        }
    }
}

impl<F: OnlineFetcher> Releaser for ConnectionRegistry<F> {
    fn release(&self, room: &Room, epoch: u64) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = rooms.get_mut(room).filter(|entry| entry.epoch == epoch) else {
            warn!(room = %room, epoch, "release of a room record that no longer exists");
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = rooms.remove(room) {
            debug!(room = %room, "last consumer released; tearing down");
            if entry.commands.send(RoomCommand::Shutdown).is_err() {
                entry.task.abort();
            }
        }
    }
}

impl<F: OnlineFetcher> Drop for ConnectionRegistry<F> {
    fn drop(&mut self) {
        let rooms = self.rooms.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in rooms.drain() {
            entry.task.abort();
        }
    }
}
