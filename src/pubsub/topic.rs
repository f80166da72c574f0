//! Per-room subscriber set

use std::collections::HashSet;

/// A room's topic: metadata plus the identities subscribed to it
#[derive(Debug)]
pub struct RoomTopic {
    room_id: String,
    room_name: String,
    creator_id: String,
    subscribers: HashSet<String>,
}

impl RoomTopic {
    pub fn new(room_id: String, room_name: String, creator_id: String) -> Self {
        Self {
            room_id,
            room_name,
            creator_id,
            subscribers: HashSet::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn creator_id(&self) -> &str {
        &self.creator_id
    }

    pub fn add_subscriber(&mut self, identity: &str) {
        self.subscribers.insert(identity.to_string());
    }

    pub fn remove_subscriber(&mut self, identity: &str) {
        self.subscribers.remove(identity);
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.subscribers.contains(identity)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Copy of the subscriber set, taken while the topic lock is held so
    /// delivery can run after it is released
    pub fn snapshot(&self) -> Vec<String> {
        self.subscribers.iter().cloned().collect()
    }
}
