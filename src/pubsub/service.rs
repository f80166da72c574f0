//! Room pub/sub service
//!
//! Tracks which identities are subscribed to which rooms and hands
//! broadcast callers a snapshot of the subscriber set. The topic lock is
//! scoped strictly to set mutation and snapshotting; delivery (socket
//! writes, queue pushes) always runs after the lock is released so a slow
//! consumer cannot stall unrelated room operations.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::error::TopicError;
use super::topic::RoomTopic;

/// Room metadata as mirrored into the pub/sub layer
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: String,
    pub room_name: String,
    pub creator_id: String,
}

/// Process-wide room -> subscriber-set map
#[derive(Default)]
pub struct RoomPubSub {
    topics: Mutex<HashMap<String, RoomTopic>>,
}

impl RoomPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topic for a newly created or mirrored room
    pub fn create_topic(
        &self,
        room_id: &str,
        room_name: &str,
        creator_id: &str,
    ) -> Result<(), TopicError> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(room_id) {
            return Err(TopicError::AlreadyExists(room_id.to_string()));
        }
        topics.insert(
            room_id.to_string(),
            RoomTopic::new(
                room_id.to_string(),
                room_name.to_string(),
                creator_id.to_string(),
            ),
        );
        tracing::debug!(room = room_id, name = room_name, "topic created");
        Ok(())
    }

    /// Drop a topic and its subscriber set
    pub fn remove_topic(&self, room_id: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if topics.remove(room_id).is_some() {
            tracing::debug!(room = room_id, "topic removed");
        }
    }

    /// Subscribe an identity to a room. An unknown room is a logged no-op;
    /// returns whether the subscription was recorded.
    pub fn add_subscriber(&self, room_id: &str, identity: &str) -> bool {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get_mut(room_id) {
            Some(topic) => {
                topic.add_subscriber(identity);
                true
            }
            None => {
                tracing::warn!(room = room_id, identity, "subscribe to unknown room ignored");
                false
            }
        }
    }

    /// Unsubscribe an identity from a room; unknown room or identity is a
    /// no-op (expected race, not an error)
    pub fn remove_subscriber(&self, room_id: &str, identity: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(topic) = topics.get_mut(room_id) {
            topic.remove_subscriber(identity);
        }
    }

    /// Unsubscribe an identity from every topic. Run on connection
    /// teardown so no subscription outlives its connection, including
    /// subscriptions added by rooms created while the session ran.
    pub fn remove_subscriber_everywhere(&self, identity: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in topics.values_mut() {
            topic.remove_subscriber(identity);
        }
    }

    /// Broadcast to a room: snapshot the subscriber set under the lock,
    /// release it, then invoke `deliver` with the snapshot. An unknown room
    /// is a logged no-op.
    pub fn broadcast<F>(&self, room_id: &str, deliver: F)
    where
        F: FnOnce(&[String]),
    {
        let snapshot = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(room_id) {
                Some(topic) => topic.snapshot(),
                None => {
                    tracing::warn!(room = room_id, "broadcast to unknown room ignored");
                    return;
                }
            }
        };
        // Lock released; delivery may take as long as it likes.
        deliver(&snapshot);
    }

    /// All mirrored rooms, for subscribing a fresh session everywhere
    pub fn rooms(&self) -> Vec<RoomInfo> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .values()
            .map(|t| RoomInfo {
                room_id: t.room_id().to_string(),
                room_name: t.room_name().to_string(),
                creator_id: t.creator_id().to_string(),
            })
            .collect()
    }

    /// Name of a mirrored room, if known
    pub fn room_name(&self, room_id: &str) -> Option<String> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get(room_id).map(|t| t.room_name().to_string())
    }

    pub fn contains(&self, room_id: &str) -> bool {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.contains_key(room_id)
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get(room_id).map_or(0, |t| t.subscriber_count())
    }
}
