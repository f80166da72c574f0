//! Room persistence collaborator
//!
//! Rooms live in relational storage owned by another service; this tier
//! only mirrors them into the pub/sub layer. The trait covers the two
//! operations the session needs: create (with name-collision detection)
//! and list-at-startup.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

/// A persisted room record
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub room_id: String,
    pub room_name: String,
    pub creator_id: String,
    pub create_time: String,
    pub update_time: String,
}

/// Room persistence failures
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Another room already uses this name; reported to the requester as
    /// an empty-room-id payload, not as a connection error
    #[error("room name already exists: {0}")]
    NameExists(String),

    #[error("room persistence unavailable: {0}")]
    Backend(String),
}

/// Room create/list (external collaborator)
///
/// Methods return `Send` futures so sessions holding the collaborator can
/// run on spawned tasks.
pub trait RoomDirectory: Send + Sync {
    fn create_room(
        &self,
        room_name: &str,
        creator_id: &str,
    ) -> impl Future<Output = Result<RoomRecord, DirectoryError>> + Send;

    fn list_rooms(&self) -> impl Future<Output = Result<Vec<RoomRecord>, DirectoryError>> + Send;
}

/// In-memory room table for tests and the demo server
#[derive(Default)]
pub struct MemoryRoomDirectory {
    rooms: RwLock<Vec<RoomRecord>>,
    next_id: AtomicU64,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with a fixed ID, as the provisioning scripts would
    pub fn seed(&self, room_id: &str, room_name: &str, creator_id: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RoomRecord {
                room_id: room_id.to_string(),
                room_name: room_name.to_string(),
                creator_id: creator_id.to_string(),
                create_time: now.clone(),
                update_time: now,
            });
    }
}

impl RoomDirectory for MemoryRoomDirectory {
    async fn create_room(
        &self,
        room_name: &str,
        creator_id: &str,
    ) -> Result<RoomRecord, DirectoryError> {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms.iter().any(|r| r.room_name == room_name) {
            return Err(DirectoryError::NameExists(room_name.to_string()));
        }

        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = chrono::Utc::now().to_rfc3339();
        let record = RoomRecord {
            room_id: format!("room-{seq}"),
            room_name: room_name.to_string(),
            creator_id: creator_id.to_string(),
            create_time: now.clone(),
            update_time: now,
        };
        rooms.push(record.clone());
        Ok(record)
    }

    async fn list_rooms(&self) -> Result<Vec<RoomRecord>, DirectoryError> {
        Ok(self
            .rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
