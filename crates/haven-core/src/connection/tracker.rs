use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::HavenError;

/// Session-wide registry of live sockets.
///
/// Caps how many sockets the session may hold at once and allows a single
/// socket per room. A slot is held by a [`Registration`] and released when it
/// is dropped, so every teardown path frees it exactly once.
#[derive(Debug)]
pub struct ConnectionTracker {
    max_connections: usize,
    rooms: Mutex<HashSet<String>>,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            max_connections,
            rooms: Mutex::new(HashSet::new()),
        })
    }

    pub fn register(self: &Arc<Self>, room_id: &str) -> Result<Registration, HavenError> {
        let mut rooms = self.lock();
        if rooms.contains(room_id) {
            return Err(HavenError::ConnectionLimit(format!(
                "room {room_id} already has a socket"
            )));
        }
        if rooms.len() >= self.max_connections {
            return Err(HavenError::ConnectionLimit(format!(
                "{} concurrent sockets already open",
                rooms.len()
            )));
        }
        rooms.insert(room_id.to_string());
        tracing::debug!("socket registered for room {room_id} ({} active)", rooms.len());
        Ok(Registration {
            tracker: Arc::clone(self),
            room_id: room_id.to_string(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_registered(&self, room_id: &str) -> bool {
        self.lock().contains(room_id)
    }

    fn release(&self, room_id: &str) {
        let mut rooms = self.lock();
        if rooms.remove(room_id) {
            tracing::debug!("socket released for room {room_id} ({} active)", rooms.len());
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Proof that a room holds a tracker slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct Registration {
    tracker: Arc<ConnectionTracker>,
    room_id: String,
}

impl Registration {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.release(&self.room_id);
    }
}
