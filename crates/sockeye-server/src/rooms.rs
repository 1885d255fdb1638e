//! Room registry: membership index for broadcast fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::channel::Channel;

/// Two indexes kept consistent under one lock: `room → sid → channel` and
/// `sid → rooms`. Empty rooms are deleted; a channel's entries are purged
/// atomically on disconnect.
#[derive(Default)]
pub(crate) struct RoomRegistry {
    inner: RwLock<Indexes>,
}

#[derive(Default)]
struct Indexes {
    rooms: HashMap<String, HashMap<String, Arc<Channel>>>,
    channel_rooms: HashMap<String, HashSet<String>>,
}

impl RoomRegistry {
    pub(crate) fn join(&self, room: &str, channel: &Arc<Channel>) {
        let mut ix = self.write();
        ix.rooms
            .entry(room.to_string())
            .or_default()
            .insert(channel.id().to_string(), channel.clone());
        ix.channel_rooms
            .entry(channel.id().to_string())
            .or_default()
            .insert(room.to_string());
    }

    pub(crate) fn leave(&self, room: &str, sid: &str) {
        let mut ix = self.write();
        if let Some(members) = ix.rooms.get_mut(room) {
            members.remove(sid);
            if members.is_empty() {
                ix.rooms.remove(room);
            }
        }
        if let Some(rooms) = ix.channel_rooms.get_mut(sid) {
            rooms.remove(room);
            if rooms.is_empty() {
                ix.channel_rooms.remove(sid);
            }
        }
    }

    /// Remove the channel from every room it belongs to. Entries that were
    /// rebound to a successor channel under the same sid are left alone.
    pub(crate) fn purge(&self, channel: &Arc<Channel>) {
        let sid = channel.id();
        let mut ix = self.write();
        let Some(rooms) = ix.channel_rooms.get(sid).cloned() else {
            return;
        };
        let mut rebound = false;
        for room in &rooms {
            if let Some(members) = ix.rooms.get_mut(room) {
                match members.get(sid) {
                    Some(current) if Arc::ptr_eq(current, channel) => {
                        members.remove(sid);
                        if members.is_empty() {
                            ix.rooms.remove(room);
                        }
                    }
                    Some(_) => rebound = true,
                    None => {}
                }
            }
        }
        if !rebound {
            ix.channel_rooms.remove(sid);
        }
    }

    /// Point every membership of `sid` at its replacement channel (transport
    /// upgrade under the same session id).
    pub(crate) fn rebind(&self, sid: &str, replacement: &Arc<Channel>) {
        let mut ix = self.write();
        let rooms: Vec<String> = ix
            .channel_rooms
            .get(sid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for room in rooms {
            if let Some(members) = ix.rooms.get_mut(&room) {
                members.insert(sid.to_string(), replacement.clone());
            }
        }
    }

    /// Snapshot of a room's members.
    pub(crate) fn members(&self, room: &str) -> Vec<Arc<Channel>> {
        self.read()
            .rooms
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn amount(&self, room: &str) -> usize {
        self.read().rooms.get(room).map_or(0, HashMap::len)
    }

    pub(crate) fn count_rooms(&self) -> usize {
        self.read().rooms.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
