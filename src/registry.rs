//! Sharded room registry. Lock striping by room-id hash keeps join/leave
//! churn on different rooms off a single writer lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::errors::{SfuError, SfuResult};
use crate::id_types::RoomId;
use crate::metrics::SFU_ACTIVE_ROOMS;
use crate::room::Room;

const SHARD_COUNT: usize = 16;

pub struct RoomRegistry {
    shards: Vec<RwLock<HashMap<RoomId, Arc<Room>>>>,
    count: AtomicUsize,
    max_rooms: usize,
}

impl RoomRegistry {
    pub fn new(max_rooms: usize) -> Self {
        RoomRegistry {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            count: AtomicUsize::new(0),
            max_rooms,
        }
    }

    fn shard(&self, id: &RoomId) -> &RwLock<HashMap<RoomId, Arc<Room>>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.shard(id).read().unwrap().get(id).cloned()
    }

    /// Returns the existing room or creates one via `factory`, enforcing the
    /// `maxRooms` bound.
    pub fn get_or_create<F>(&self, id: &RoomId, factory: F) -> SfuResult<Arc<Room>>
    where
        F: FnOnce() -> Arc<Room>,
    {
        let mut shard = self.shard(id).write().unwrap();
        if let Some(room) = shard.get(id) {
            return Ok(room.clone());
        }
        if self.count.load(Ordering::Relaxed) >= self.max_rooms {
            return Err(SfuError::Capacity(format!(
                "room limit reached ({})",
                self.max_rooms
            )));
        }
        let room = factory();
        shard.insert(id.clone(), room.clone());
        self.count.fetch_add(1, Ordering::Relaxed);
        SFU_ACTIVE_ROOMS.inc();
        Ok(room)
    }

    pub fn remove(&self, id: &RoomId) -> Option<Arc<Room>> {
        let removed = self.shard(id).write().unwrap().remove(id);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            SFU_ACTIVE_ROOMS.dec();
        }
        removed
    }

    pub fn all(&self) -> Vec<Arc<Room>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().unwrap().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
