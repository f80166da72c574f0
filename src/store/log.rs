//! Room message log over the stream store
//!
//! Messages are serialized to the `{payload: json}` field map on append and
//! parsed back on read. IDs belong to the store; a [`Message`] has no ID
//! until it has been appended.

use serde::{Deserialize, Serialize};

use super::stream::{Cursor, StreamStore};
use crate::error::StoreError;

/// Default history page size
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// A chat message. `id` is store-assigned, monotonically increasing within
/// a room, and opaque to clients except for ordering and cursor use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub user_id: String,
    pub username: String,
    pub content: String,
    /// Server-stamped, milliseconds since the epoch
    pub timestamp: u64,
}

/// One page of history, newest-first.
#[derive(Debug, Default)]
pub struct MessageBatch {
    pub messages: Vec<Message>,
    /// True iff the page came back full. This is a lower-bound heuristic:
    /// when the room's length is an exact multiple of the page size the last
    /// full page reports `true` and the follow-up request returns empty.
    pub has_more: bool,
}

/// Stored field-map payload; everything except the ID
#[derive(Debug, Serialize, Deserialize)]
struct StoredPayload {
    content: String,
    user_id: String,
    username: String,
    timestamp: u64,
}

/// Append and reverse-cursor reads for room history
pub struct MessageLog<S> {
    store: S,
    page_size: usize,
}

impl<S: StreamStore> MessageLog<S> {
    pub fn new(store: S, page_size: usize) -> Self {
        Self { store, page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Append one message to a room's stream. On success the message's `id`
    /// is set to the store-assigned ID, which is also returned.
    pub async fn append(&self, room_id: &str, message: &mut Message) -> Result<u64, StoreError> {
        let payload = StoredPayload {
            content: message.content.clone(),
            user_id: message.user_id.clone(),
            username: message.username.clone(),
            timestamp: message.timestamp,
        };
        let json = serde_json::to_string(&payload).map_err(StoreError::BadPayload)?;
        let id = self.store.xadd(room_id, json).await?;
        message.id = id;
        Ok(id)
    }

    /// Read one page of history, newest matching the cursor first.
    pub async fn reverse_range(
        &self,
        room_id: &str,
        cursor: Cursor,
        limit: usize,
    ) -> Result<MessageBatch, StoreError> {
        let entries = self.store.xrevrange(room_id, cursor, limit).await?;
        let has_more = entries.len() == limit;

        let mut messages = Vec::with_capacity(entries.len());
        for (id, json) in entries {
            let payload: StoredPayload =
                serde_json::from_str(&json).map_err(StoreError::BadPayload)?;
            messages.push(Message {
                id,
                user_id: payload.user_id,
                username: payload.username,
                content: payload.content,
                timestamp: payload.timestamp,
            });
        }

        Ok(MessageBatch { messages, has_more })
    }
}
