//! Crash-safe room directory (C8).
//!
//! Two maps: `room_id -> actor handle` and `(local_user, remote_user) ->
//! room_id` for direct chats. Reads are dirty (no cross-map transaction);
//! writes are atomic per key via the map's own lock. This is the only
//! cross-actor mutable state in the system (§5).

use std::collections::HashMap;
use std::sync::RwLock;

use room_engine_core::{RoomId, UserId};

use crate::room_actor::RoomActorHandle;

/// `(local_user, remote_user)`, the key for direct-chat lookups.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirectKey {
    pub local_user: UserId,
    pub remote_user: UserId,
}

/// The process-global room directory.
#[derive(Default)]
pub struct Registry {
    rooms: RwLock<HashMap<RoomId, RoomActorHandle>>,
    direct: RwLock<HashMap<DirectKey, RoomId>>,
}

/// What starts a fresh room actor when the registry doesn't already have
/// one. A named collaborator (§1): the real implementation restarts actors
/// on demand and is outside this crate's scope.
#[async_trait::async_trait]
pub trait Supervisor: Send + Sync {
    /// Returns `None` if the supervisor declines to start the room (the
    /// Erlang source's "`(ok, undefined)` means ignored" convention).
    async fn start_room(&self, room_id: &RoomId) -> Option<RoomActorHandle>;
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_room(&self, room_id: &RoomId) -> Option<RoomActorHandle> {
        self.rooms.read().expect("registry lock poisoned").get(room_id).cloned()
    }

    pub fn insert_room(&self, room_id: RoomId, handle: RoomActorHandle) {
        self.rooms.write().expect("registry lock poisoned").insert(room_id, handle);
    }

    pub fn remove_room(&self, room_id: &RoomId) {
        self.rooms.write().expect("registry lock poisoned").remove(room_id);
    }

    pub fn lookup_direct(&self, key: &DirectKey) -> Option<RoomId> {
        self.direct.read().expect("registry lock poisoned").get(key).cloned()
    }

    pub fn insert_direct(&self, key: DirectKey, room_id: RoomId) {
        self.direct.write().expect("registry lock poisoned").insert(key, room_id);
    }

    pub fn remove_direct(&self, key: &DirectKey) {
        self.direct.write().expect("registry lock poisoned").remove(key);
    }

    /// `get_room_pid(host, room_id)`: look up or ask the supervisor to
    /// start a new child.
    pub async fn get_room_pid(&self, room_id: &RoomId, supervisor: &dyn Supervisor) -> Option<RoomActorHandle> {
        if let Some(handle) = self.lookup_room(room_id) {
            return Some(handle);
        }
        let handle = supervisor.start_room(room_id).await?;
        self.insert_room(room_id.clone(), handle.clone());
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_key_uniqueness_is_by_both_fields() {
        let a = DirectKey {
            local_user: UserId::parse("@a:x").unwrap(),
            remote_user: UserId::parse("@b:y").unwrap(),
        };
        let b = DirectKey {
            local_user: UserId::parse("@a:x").unwrap(),
            remote_user: UserId::parse("@c:y").unwrap(),
        };
        assert_ne!(a, b);
    }
}
